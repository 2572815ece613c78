//! Server-side TLS handshake and cert-to-name
//!
//! The rustls server configuration is rebuilt from the option family
//! snapshot at each accept; a non-empty cert-to-name list makes client
//! certificates mandatory, since without a matching entry there is no
//! NETCONF username and the session cannot exist (RFC 7589).

use std::net::TcpStream;
use std::sync::Arc;

use log::*;
use ring::digest;
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::{FromDer, X509Certificate};

use super::Server;
use crate::config::{CtnEntry, CtnMapType, TlsServerConfig};
use crate::error::{Error, Result};
use crate::transport::tls::{load_certs, load_crls, load_private_key, TlsTransport};

/// Accept a TLS connection and resolve the client username. Returns the
/// transport and the username mapped from the peer certificate (absent
/// only when no cert-to-name rules are configured).
pub(crate) fn tls_accept(
    server: &Server,
    stream: TcpStream,
) -> Result<(TlsTransport, Option<String>)> {
    let opts = server.snapshot_tls();
    let config = build_server_config(&opts)?;
    let tls = TlsTransport::accept(stream, config)?;
    let username = match tls.peer_certificate() {
        Some(cert) => Some(resolve_username(&opts.ctn, cert.as_ref())?),
        None if opts.ctn.is_empty() => None,
        None => {
            return Err(Error::AuthFailed(
                "client certificate required by cert-to-name rules".into(),
            ))
        }
    };
    Ok((tls, username))
}

fn build_server_config(opts: &TlsServerConfig) -> Result<Arc<rustls::ServerConfig>> {
    let cert = opts
        .cert
        .as_ref()
        .ok_or_else(|| Error::InvalidArg("no tls server certificate configured".into()))?;
    let key = opts
        .key
        .as_ref()
        .ok_or_else(|| Error::InvalidArg("no tls server key configured".into()))?;
    let certs = load_certs(cert)?;
    let key = load_private_key(key)?;

    let builder = if opts.ctn.is_empty() && opts.trusted_cas.is_empty() {
        rustls::ServerConfig::builder().with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        for source in &opts.trusted_cas {
            for cert in load_certs(source)? {
                roots
                    .add(cert)
                    .map_err(|e| Error::InvalidArg(format!("trusted certificate: {e}")))?;
            }
        }
        let mut verifier = WebPkiClientVerifier::builder(Arc::new(roots));
        let mut crls = Vec::new();
        for source in &opts.crls {
            crls.extend(load_crls(source)?);
        }
        if !crls.is_empty() {
            verifier = verifier.with_crls(crls);
        }
        let verifier = verifier
            .build()
            .map_err(|e| Error::InvalidArg(format!("client verifier: {e}")))?;
        rustls::ServerConfig::builder().with_client_cert_verifier(verifier)
    };

    builder
        .with_single_cert(certs, key)
        .map(Arc::new)
        .map_err(|e| Error::InvalidArg(format!("tls server certificate: {e}")))
}

/// Identity fields pulled out of the peer certificate once, so rule
/// matching is plain data work.
#[derive(Debug, Default, PartialEq)]
struct CertIdentity {
    common_name: Option<String>,
    san_rfc822: Option<String>,
    san_dns: Option<String>,
    san_ip: Option<String>,
}

fn extract_identity(cert: &X509Certificate<'_>) -> CertIdentity {
    let mut identity = CertIdentity {
        common_name: cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(|cn| cn.to_string()),
        ..CertIdentity::default()
    };
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            match name {
                GeneralName::RFC822Name(s) if identity.san_rfc822.is_none() => {
                    identity.san_rfc822 = Some(s.to_string());
                }
                GeneralName::DNSName(s) if identity.san_dns.is_none() => {
                    identity.san_dns = Some(s.to_string());
                }
                GeneralName::IPAddress(bytes) if identity.san_ip.is_none() => {
                    identity.san_ip = format_ip(bytes);
                }
                _ => {}
            }
        }
    }
    identity
}

fn format_ip(bytes: &[u8]) -> Option<String> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(std::net::Ipv4Addr::from(octets).to_string())
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(std::net::Ipv6Addr::from(octets).to_string())
        }
        _ => None,
    }
}

/// Hash-algorithm octet leading a cert-to-name fingerprint.
const FP_ALG_SHA1: u8 = 0x02;
const FP_ALG_SHA256: u8 = 0x04;

/// Parse `"04:AB:CD:…"` into the algorithm octet and digest bytes.
fn parse_fingerprint(fp: &str) -> Option<(u8, Vec<u8>)> {
    let mut octets = Vec::new();
    for part in fp.split(':') {
        if part.len() != 2 {
            return None;
        }
        octets.push(u8::from_str_radix(part, 16).ok()?);
    }
    let (&alg, rest) = octets.split_first()?;
    if rest.is_empty() {
        return None;
    }
    Some((alg, rest.to_vec()))
}

fn fingerprint_matches(fp: &str, der: &[u8]) -> bool {
    let Some((alg, expected)) = parse_fingerprint(fp) else {
        warn!("unparsable cert-to-name fingerprint \"{fp}\"");
        return false;
    };
    let computed = match alg {
        FP_ALG_SHA1 => digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, der),
        FP_ALG_SHA256 => digest::digest(&digest::SHA256, der),
        other => {
            warn!("unsupported fingerprint hash algorithm {other:#04x}");
            return false;
        }
    };
    computed.as_ref() == expected.as_slice()
}

/// Apply one entry's map-type to the extracted identity.
fn map_identity(entry: &CtnEntry, identity: &CertIdentity) -> Option<String> {
    match entry.map_type {
        CtnMapType::Specified => entry.name.clone(),
        CtnMapType::SanRfc822 => identity.san_rfc822.clone(),
        CtnMapType::SanDns => identity.san_dns.clone(),
        CtnMapType::SanIp => identity.san_ip.clone(),
        CtnMapType::SanAny => identity
            .san_rfc822
            .clone()
            .or_else(|| identity.san_dns.clone())
            .or_else(|| identity.san_ip.clone()),
        CtnMapType::CommonName => identity.common_name.clone(),
    }
}

/// First matching rule in ascending id order wins; rules whose map-type
/// finds nothing in the certificate are skipped.
fn resolve_ctn(entries: &[CtnEntry], der: &[u8], identity: &CertIdentity) -> Option<String> {
    let mut ordered: Vec<&CtnEntry> = entries.iter().collect();
    ordered.sort_by_key(|e| e.id);
    for entry in ordered {
        if let Some(fp) = &entry.fingerprint {
            if !fingerprint_matches(fp, der) {
                continue;
            }
        }
        if let Some(name) = map_identity(entry, identity) {
            debug!("cert-to-name entry {} mapped user \"{name}\"", entry.id);
            return Some(name);
        }
    }
    None
}

fn resolve_username(entries: &[CtnEntry], der: &[u8]) -> Result<String> {
    if entries.is_empty() {
        return Err(Error::AuthFailed(
            "client certificate presented but no cert-to-name rules configured".into(),
        ));
    }
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| Error::AuthFailed(format!("peer certificate: {e}")))?;
    let identity = extract_identity(&cert);
    resolve_ctn(entries, der, &identity)
        .ok_or_else(|| Error::AuthFailed("no cert-to-name entry matched".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u32, fp: Option<&str>, map_type: CtnMapType, name: Option<&str>) -> CtnEntry {
        CtnEntry {
            id,
            fingerprint: fp.map(str::to_string),
            map_type,
            name: name.map(str::to_string),
        }
    }

    #[test]
    fn fingerprint_parsing() {
        assert_eq!(
            parse_fingerprint("04:ab:CD"),
            Some((0x04, vec![0xab, 0xcd]))
        );
        assert_eq!(parse_fingerprint("04"), None);
        assert_eq!(parse_fingerprint("4:ab"), None);
        assert_eq!(parse_fingerprint("04:zz"), None);
    }

    #[test]
    fn sha256_fingerprint_matches_digest() {
        let der = b"not really der but hashable";
        let digest = digest::digest(&digest::SHA256, der);
        let mut fp = String::from("04");
        for b in digest.as_ref() {
            fp.push_str(&format!(":{b:02X}"));
        }
        assert!(fingerprint_matches(&fp, der));
        assert!(!fingerprint_matches(&fp, b"different bytes"));
    }

    #[test]
    fn ctn_first_match_by_ascending_id() {
        let identity = CertIdentity {
            common_name: Some("cn-user".into()),
            san_dns: Some("host.example.com".into()),
            ..CertIdentity::default()
        };
        // declared out of order; id 1 must win
        let entries = vec![
            entry(5, None, CtnMapType::CommonName, None),
            entry(1, None, CtnMapType::SanDns, None),
        ];
        assert_eq!(
            resolve_ctn(&entries, b"", &identity),
            Some("host.example.com".into())
        );
    }

    #[test]
    fn ctn_skips_entries_without_identity() {
        let identity = CertIdentity {
            common_name: Some("cn-user".into()),
            ..CertIdentity::default()
        };
        let entries = vec![
            entry(1, None, CtnMapType::SanRfc822, None),
            entry(2, None, CtnMapType::SanAny, None),
            entry(3, None, CtnMapType::CommonName, None),
        ];
        assert_eq!(resolve_ctn(&entries, b"", &identity), Some("cn-user".into()));
    }

    #[test]
    fn ctn_specified_uses_entry_name() {
        let identity = CertIdentity::default();
        let entries = vec![entry(1, None, CtnMapType::Specified, Some("operator"))];
        assert_eq!(resolve_ctn(&entries, b"", &identity), Some("operator".into()));
    }

    #[test]
    fn ctn_fingerprint_gates_entries() {
        let der = b"certificate bytes";
        let digest = digest::digest(&digest::SHA256, der);
        let mut fp = String::from("04");
        for b in digest.as_ref() {
            fp.push_str(&format!(":{b:02x}"));
        }
        let identity = CertIdentity::default();
        let entries = vec![
            entry(1, Some("04:de:ad:be:ef"), CtnMapType::Specified, Some("wrong")),
            entry(2, Some(&fp), CtnMapType::Specified, Some("right")),
        ];
        assert_eq!(resolve_ctn(&entries, der, &identity), Some("right".into()));
    }

    #[test]
    fn ip_san_formatting() {
        assert_eq!(format_ip(&[192, 0, 2, 1]), Some("192.0.2.1".into()));
        assert_eq!(format_ip(&[0; 3]), None);
    }
}
