//! NETCONF message framing
//!
//! Two framings exist on the wire: the `]]>]]>` end-of-message sentinel of
//! NETCONF 1.0 and the `\n#<size>\n` chunked encoding of NETCONF 1.1
//! (RFC 6242). Hello messages always travel in 1.0 framing; everything after
//! a successful hello uses the negotiated version.
//!
//! Decoders are incremental: they consume bytes from the session's receive
//! buffer as they are parsed and keep partial state across calls, so
//! pipelined messages and short reads both work.

use memmem::{Searcher, TwoWaySearcher};

use crate::error::{Error, Result};

/// End-of-message sentinel used by NETCONF 1.0 framing.
pub const SENTINEL: &[u8] = b"]]>]]>";

/// Largest chunk size RFC 6242 allows (2^31 - 1).
const MAX_CHUNK_SIZE: u64 = 2_147_483_647;

/// Protocol version negotiated during hello.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Version {
    V10,
    V11,
}

impl Version {
    /// The base capability URI advertising this version.
    pub fn capability(&self) -> &'static str {
        match self {
            Version::V10 => "urn:ietf:params:netconf:base:1.0",
            Version::V11 => "urn:ietf:params:netconf:base:1.1",
        }
    }

    pub fn from_capability(uri: &str) -> Option<Version> {
        match uri.trim() {
            "urn:ietf:params:netconf:base:1.0" => Some(Version::V10),
            "urn:ietf:params:netconf:base:1.1" => Some(Version::V11),
            _ => None,
        }
    }
}

/// Frame a whole message for the wire.
///
/// A 1.1 message is one or more non-empty chunks, so the empty payload is
/// outside the codec's domain; framing it would produce bytes the decoder
/// rejects.
pub fn encode(version: Version, payload: &[u8]) -> Vec<u8> {
    match version {
        Version::V10 => {
            let mut out = Vec::with_capacity(payload.len() + SENTINEL.len());
            out.extend_from_slice(payload);
            out.extend_from_slice(SENTINEL);
            out
        }
        Version::V11 => {
            debug_assert!(!payload.is_empty(), "cannot frame an empty 1.1 message");
            // one chunk per message; peers may chunk however they like
            let header = format!("\n#{}\n", payload.len());
            let mut out = Vec::with_capacity(header.len() + payload.len() + 4);
            out.extend_from_slice(header.as_bytes());
            out.extend_from_slice(payload);
            out.extend_from_slice(b"\n##\n");
            out
        }
    }
}

/// Incremental decoder for one framing version.
#[derive(Debug)]
pub enum FrameDecoder {
    EndTag(EndTagDecoder),
    Chunked(ChunkDecoder),
}

impl FrameDecoder {
    pub fn new(version: Version) -> FrameDecoder {
        match version {
            Version::V10 => FrameDecoder::EndTag(EndTagDecoder::default()),
            Version::V11 => FrameDecoder::Chunked(ChunkDecoder::default()),
        }
    }

    /// Consume framed bytes from the front of `buf`. Returns the next whole
    /// message body once one is complete, `None` while more bytes are
    /// needed. Bytes belonging to a following message are left in `buf`.
    pub fn decode(&mut self, buf: &mut Vec<u8>) -> Result<Option<Vec<u8>>> {
        match self {
            FrameDecoder::EndTag(d) => d.decode(buf),
            FrameDecoder::Chunked(d) => d.decode(buf),
        }
    }
}

/// NETCONF 1.0: scan for the `]]>]]>` sentinel.
#[derive(Debug, Default)]
pub struct EndTagDecoder {
    // how far the buffer has already been scanned without a match
    scanned: usize,
}

impl EndTagDecoder {
    fn decode(&mut self, buf: &mut Vec<u8>) -> Result<Option<Vec<u8>>> {
        // restart a little before the scanned mark so a sentinel split
        // across reads is still found
        let start = self.scanned.saturating_sub(SENTINEL.len() - 1);
        let searcher = TwoWaySearcher::new(SENTINEL);
        match searcher.search_in(&buf[start..]) {
            Some(offset) => {
                let pos = start + offset;
                let msg = buf[..pos].to_vec();
                buf.drain(..pos + SENTINEL.len());
                self.scanned = 0;
                Ok(Some(msg))
            }
            None => {
                self.scanned = buf.len();
                Ok(None)
            }
        }
    }
}

#[derive(Debug, Default, PartialEq)]
enum ChunkState {
    /// expecting the LF that opens a chunk header
    #[default]
    Lf,
    /// expecting `#`
    Hash,
    /// first byte after `#`: a size digit or a second `#`
    SizeOrEnd,
    /// further size digits up to the terminating LF
    Size,
    /// saw `##`, expecting the final LF
    EndLf,
    /// consuming chunk data
    Data,
}

/// NETCONF 1.1: explicit chunk-header state machine.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    state: ChunkState,
    size: u64,
    remaining: u64,
    msg: Vec<u8>,
}

impl ChunkDecoder {
    fn decode(&mut self, buf: &mut Vec<u8>) -> Result<Option<Vec<u8>>> {
        let mut consumed = 0;
        let mut complete = false;

        while consumed < buf.len() && !complete {
            if self.state == ChunkState::Data {
                let avail = buf.len() - consumed;
                let take = (self.remaining as usize).min(avail);
                self.msg.extend_from_slice(&buf[consumed..consumed + take]);
                consumed += take;
                self.remaining -= take as u64;
                if self.remaining == 0 {
                    self.state = ChunkState::Lf;
                }
                continue;
            }

            let b = buf[consumed];
            consumed += 1;
            match self.state {
                ChunkState::Lf => {
                    if b != b'\n' {
                        return self.fail(buf, "expected LF before chunk header");
                    }
                    self.state = ChunkState::Hash;
                }
                ChunkState::Hash => {
                    if b != b'#' {
                        return self.fail(buf, "expected '#' in chunk header");
                    }
                    self.state = ChunkState::SizeOrEnd;
                }
                ChunkState::SizeOrEnd => match b {
                    b'#' => self.state = ChunkState::EndLf,
                    // a leading zero is invalid whether alone ("#0") or
                    // padding ("#007")
                    b'1'..=b'9' => {
                        self.size = u64::from(b - b'0');
                        self.state = ChunkState::Size;
                    }
                    b'0' => return self.fail(buf, "zero or zero-padded chunk size"),
                    _ => return self.fail(buf, "invalid chunk size"),
                },
                ChunkState::Size => match b {
                    b'0'..=b'9' => {
                        self.size = self.size * 10 + u64::from(b - b'0');
                        if self.size > MAX_CHUNK_SIZE {
                            return self.fail(buf, "chunk size exceeds 2^31-1");
                        }
                    }
                    b'\n' => {
                        self.remaining = self.size;
                        self.size = 0;
                        self.state = ChunkState::Data;
                    }
                    _ => return self.fail(buf, "chunk size not terminated by LF"),
                },
                ChunkState::EndLf => {
                    if b != b'\n' {
                        return self.fail(buf, "end-of-chunks marker not terminated by LF");
                    }
                    if self.msg.is_empty() {
                        return self.fail(buf, "end-of-chunks marker before any chunk");
                    }
                    complete = true;
                }
                ChunkState::Data => unreachable!(),
            }
        }

        buf.drain(..consumed);
        if complete {
            self.state = ChunkState::Lf;
            Ok(Some(std::mem::take(&mut self.msg)))
        } else {
            Ok(None)
        }
    }

    fn fail(&mut self, buf: &mut Vec<u8>, what: &str) -> Result<Option<Vec<u8>>> {
        buf.clear();
        self.msg.clear();
        self.state = ChunkState::Lf;
        Err(Error::MalformedMessage(what.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(version: Version, bytes: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut dec = FrameDecoder::new(version);
        let mut buf = bytes.to_vec();
        dec.decode(&mut buf)
    }

    #[test]
    fn end_tag_round_trip() {
        let msg = b"<hello/>";
        let framed = encode(Version::V10, msg);
        assert_eq!(framed, b"<hello/>]]>]]>");
        assert_eq!(decode_all(Version::V10, &framed).unwrap().unwrap(), msg);
    }

    #[test]
    fn end_tag_prefix_is_incomplete_until_sentinel() {
        let mut dec = FrameDecoder::new(Version::V10);
        let mut buf = Vec::new();
        for chunk in [&b"<rpc>"[..], b"</rpc>]]", b">]]"] {
            buf.extend_from_slice(chunk);
            assert!(dec.decode(&mut buf).unwrap().is_none());
        }
        buf.extend_from_slice(b">");
        assert_eq!(dec.decode(&mut buf).unwrap().unwrap(), b"<rpc></rpc>");
        assert!(buf.is_empty());
    }

    #[test]
    fn end_tag_pipelined_messages_stay_separated() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&encode(Version::V10, b"<a/>"));
        buf.extend_from_slice(&encode(Version::V10, b"<b/>"));
        let mut dec = FrameDecoder::new(Version::V10);
        assert_eq!(dec.decode(&mut buf).unwrap().unwrap(), b"<a/>");
        assert_eq!(dec.decode(&mut buf).unwrap().unwrap(), b"<b/>");
        assert!(dec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn chunked_identity_for_boundary_sizes() {
        for n in [1usize, 2, 4095, 4096, 4097, 65535] {
            let msg = vec![b'x'; n];
            let framed = encode(Version::V11, &msg);
            let got = decode_all(Version::V11, &framed).unwrap().unwrap();
            assert_eq!(got, msg, "size {n}");
        }
    }

    #[test]
    fn chunked_exact_wire_image() {
        assert_eq!(encode(Version::V11, b"<rpc/>"), b"\n#6\n<rpc/>\n##\n");
    }

    #[test]
    fn chunked_multiple_chunks_concatenate() {
        let wire = b"\n#4\n<rpc\n#2\n/>\n##\n";
        assert_eq!(decode_all(Version::V11, wire).unwrap().unwrap(), b"<rpc/>");
    }

    #[test]
    fn chunked_byte_at_a_time() {
        let framed = encode(Version::V11, b"<get-config/>");
        let mut dec = FrameDecoder::new(Version::V11);
        let mut out = None;
        for &b in &framed {
            let mut buf = vec![b];
            if let Some(msg) = dec.decode(&mut buf).unwrap() {
                out = Some(msg);
            }
        }
        assert_eq!(out.unwrap(), b"<get-config/>");
    }

    #[test]
    fn chunked_rejects_malformed_headers() {
        for bad in [
            &b"\n#0\n"[..],
            b"\n#-1\n",
            b"\n#\n",
            b"\n#01\nx",
            b"\n#2147483648\n",
            b"\n#3xyz",
            b"#3\nabc",
            b"\nx3\nabc",
            b"\n#3\nabc\n#*",
            b"\n##x",
        ] {
            assert!(
                matches!(decode_all(Version::V11, bad), Err(Error::MalformedMessage(_))),
                "accepted {:?}",
                String::from_utf8_lossy(bad)
            );
        }
    }

    #[test]
    #[should_panic(expected = "empty 1.1 message")]
    fn chunked_encoder_rejects_empty_payload() {
        encode(Version::V11, b"");
    }

    #[test]
    fn chunked_rejects_end_marker_without_chunks() {
        assert!(matches!(
            decode_all(Version::V11, b"\n##\n"),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn chunked_pipelined_messages_stay_separated() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&encode(Version::V11, b"<a/>"));
        buf.extend_from_slice(&encode(Version::V11, b"<b/>"));
        let mut dec = FrameDecoder::new(Version::V11);
        assert_eq!(dec.decode(&mut buf).unwrap().unwrap(), b"<a/>");
        assert_eq!(dec.decode(&mut buf).unwrap().unwrap(), b"<b/>");
    }

    #[test]
    fn version_from_capability() {
        assert_eq!(
            Version::from_capability("urn:ietf:params:netconf:base:1.1"),
            Some(Version::V11)
        );
        assert_eq!(
            Version::from_capability(" urn:ietf:params:netconf:base:1.0 "),
            Some(Version::V10)
        );
        assert_eq!(Version::from_capability("urn:example:foo"), None);
    }
}
