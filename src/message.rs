//! Message classification and protocol envelopes
//!
//! A NETCONF message is one whole XML document. This module sorts parsed
//! documents into the protocol's message kinds and renders the envelopes
//! around hello, rpc, rpc-reply and notification payloads.

use log::*;

use crate::error::{Error, Result};
use crate::framing::Version;
use crate::xml::{Element, Node, BASE_NS};

/// Namespace of RFC 5277 event notifications.
pub const NOTIF_NS: &str = "urn:ietf:params:xml:ns:netconf:notification:1.0";

/// Kind of a received message, decided by the root element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Hello,
    Rpc,
    Reply,
    Notification,
    Unknown,
}

/// Classify a parsed document by its root qualified name.
pub fn classify(root: &Element) -> MsgType {
    match (root.name.as_str(), root.namespace.as_deref()) {
        ("hello", Some(BASE_NS)) => MsgType::Hello,
        ("rpc", Some(BASE_NS)) => MsgType::Rpc,
        ("rpc-reply", Some(BASE_NS)) => MsgType::Reply,
        ("notification", Some(NOTIF_NS)) => MsgType::Notification,
        _ => MsgType::Unknown,
    }
}

/// Render a `<hello>`, with `<session-id>` when the sender is a server.
pub fn build_hello(capabilities: &[String], session_id: Option<u32>) -> Element {
    let mut caps = Element::new("capabilities");
    for cap in capabilities {
        caps = caps.with_child(Element::new("capability").with_text(cap));
    }
    let mut hello = Element::new("hello").with_ns(BASE_NS).with_child(caps);
    if let Some(id) = session_id {
        hello = hello.with_child(Element::new("session-id").with_text(&id.to_string()));
    }
    hello
}

/// Pull the capability list and optional session-id out of a `<hello>`.
pub fn parse_hello(root: &Element) -> Result<(Vec<String>, Option<u32>)> {
    let caps_elem = root
        .child("capabilities")
        .ok_or_else(|| Error::ProtocolViolation("hello without capabilities".into()))?;
    let capabilities: Vec<String> = caps_elem
        .children_named("capability")
        .map(|c| c.text())
        .filter(|c| !c.is_empty())
        .collect();
    if capabilities.is_empty() {
        return Err(Error::ProtocolViolation("hello with empty capabilities".into()));
    }
    let session_id = match root.child("session-id") {
        Some(elem) => Some(elem.text().parse::<u32>().map_err(|_| {
            Error::ProtocolViolation(format!("unparsable session-id \"{}\"", elem.text()))
        })?),
        None => None,
    };
    Ok((capabilities, session_id))
}

/// Pick the protocol version: the highest base capability both peers
/// advertise.
pub fn resolve_version(local: &[String], remote: &[String]) -> Result<Version> {
    let highest = |caps: &[String]| {
        caps.iter()
            .filter_map(|c| Version::from_capability(c))
            .collect::<Vec<_>>()
    };
    let ours = highest(local);
    let theirs = highest(remote);
    let common = ours
        .iter()
        .copied()
        .filter(|v| theirs.contains(v))
        .max();
    match common {
        Some(v) => Ok(v),
        None => {
            warn!("no common base capability (local {ours:?}, remote {theirs:?})");
            Err(Error::ProtocolViolation("no common base capability".into()))
        }
    }
}

/// Wrap an rpc body in its envelope. Extra attributes follow `message-id`,
/// as callers may pin vendor attributes onto the envelope.
pub fn build_rpc(message_id: u64, extra_attrs: &[(String, String)], body: Element) -> Element {
    let mut rpc = Element::new("rpc").with_attr("message-id", &message_id.to_string());
    for (k, v) in extra_attrs {
        rpc = rpc.with_attr(k, v);
    }
    rpc.with_ns(BASE_NS).with_child(body)
}

/// Wrap reply content in an `<rpc-reply>` mirroring the request's id.
pub fn build_reply(message_id: &str, content: Vec<Node>) -> Element {
    let mut reply = Element::new("rpc-reply")
        .with_attr("message-id", message_id)
        .with_ns(BASE_NS);
    reply.children = content;
    reply
}

/// Wrap event data in a `<notification>` with its `<eventTime>`.
pub fn build_notification(event_time: &str, event: Element) -> Element {
    Element::new("notification")
        .with_ns(NOTIF_NS)
        .with_child(Element::new("eventTime").with_text(event_time))
        .with_child(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml;

    #[test]
    fn classify_by_root() {
        let rpc = xml::parse(r#"<rpc message-id="1" xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><get/></rpc>"#).unwrap();
        assert_eq!(classify(&rpc), MsgType::Rpc);
        let hello =
            xml::parse(r#"<hello xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"/>"#).unwrap();
        assert_eq!(classify(&hello), MsgType::Hello);
        let notif = xml::parse(
            r#"<notification xmlns="urn:ietf:params:xml:ns:netconf:notification:1.0"/>"#,
        )
        .unwrap();
        assert_eq!(classify(&notif), MsgType::Notification);
        let other = xml::parse(r#"<rpc xmlns="urn:example:not-netconf"/>"#).unwrap();
        assert_eq!(classify(&other), MsgType::Unknown);
    }

    #[test]
    fn hello_round_trip_preserves_capability_set() {
        let caps = vec![
            "urn:ietf:params:netconf:base:1.0".to_string(),
            "urn:ietf:params:netconf:base:1.1".to_string(),
            "urn:ietf:params:netconf:capability:with-defaults:1.0?basic-mode=explicit".to_string(),
        ];
        let hello = build_hello(&caps, Some(7));
        let parsed = xml::parse(&hello.to_xml()).unwrap();
        let (got, sid) = parse_hello(&parsed).unwrap();
        assert_eq!(got, caps);
        assert_eq!(sid, Some(7));
    }

    #[test]
    fn version_resolution_prefers_11() {
        let both = vec![
            "urn:ietf:params:netconf:base:1.0".to_string(),
            "urn:ietf:params:netconf:base:1.1".to_string(),
        ];
        let v11 = vec!["urn:ietf:params:netconf:base:1.1".to_string()];
        let v10 = vec!["urn:ietf:params:netconf:base:1.0".to_string()];
        assert_eq!(resolve_version(&both, &v11).unwrap(), Version::V11);
        assert_eq!(resolve_version(&both, &v10).unwrap(), Version::V10);
        assert_eq!(resolve_version(&both, &both).unwrap(), Version::V11);
        assert!(matches!(
            resolve_version(&v10, &v11),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn rpc_envelope_attribute_order() {
        let rpc = build_rpc(1000, &[], Element::new("commit"));
        assert_eq!(
            rpc.to_xml(),
            r#"<rpc message-id="1000" xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><commit/></rpc>"#
        );
    }

    #[test]
    fn reply_mirrors_request_id() {
        let reply = build_reply("101", vec![Node::Element(Element::new("ok"))]);
        assert_eq!(
            reply.to_xml(),
            r#"<rpc-reply message-id="101" xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><ok/></rpc-reply>"#
        );
    }
}
