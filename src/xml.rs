//! Owned XML element trees
//!
//! The session layer has to hold on to whole messages, look at their root
//! element, and re-serialize envelopes byte-for-byte, so it keeps a small
//! owned tree instead of streaming through serde. Parsing and escaping are
//! done by quick-xml; serialization is canonical: attributes in insertion
//! order, a default-namespace declaration only where the namespace changes,
//! and self-closing tags for empty elements.

use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::name::ResolveResult;
use quick_xml::NsReader;

use crate::error::{Error, Result};

/// The NETCONF base namespace all protocol envelopes live in.
pub const BASE_NS: &str = "urn:ietf:params:xml:ns:netconf:base:1.0";

/// One node in an element tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// An owned XML element: local name, resolved namespace, attributes in
/// document order, and child nodes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Element {
    pub name: String,
    pub namespace: Option<String>,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(name: &str) -> Element {
        Element {
            name: name.to_string(),
            ..Element::default()
        }
    }

    pub fn with_ns(mut self, ns: &str) -> Element {
        self.namespace = Some(ns.to_string());
        self
    }

    pub fn with_attr(mut self, name: &str, value: &str) -> Element {
        self.attributes.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_child(mut self, child: Element) -> Element {
        self.children.push(Node::Element(child));
        self
    }

    pub fn with_text(mut self, text: &str) -> Element {
        self.children.push(Node::Text(text.to_string()));
        self
    }

    /// Value of the named attribute, if present.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// First element child with the given local name.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find_map(|n| match n {
            Node::Element(e) if e.name == name => Some(e),
            _ => None,
        })
    }

    /// All element children with the given local name.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter_map(move |n| match n {
            Node::Element(e) if e.name == name => Some(e),
            _ => None,
        })
    }

    /// First element child regardless of name.
    pub fn first_child(&self) -> Option<&Element> {
        self.children.iter().find_map(|n| match n {
            Node::Element(e) => Some(e),
            _ => None,
        })
    }

    /// Concatenated direct text content, whitespace-trimmed.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for n in &self.children {
            if let Node::Text(t) = n {
                out.push_str(t);
            }
        }
        out.trim().to_string()
    }

    /// Serialize the tree. `]]>]]>` cannot appear in the output because
    /// all text and attribute values are entity-escaped.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write(&mut out, None);
        out
    }

    fn write(&self, out: &mut String, inherited_ns: Option<&str>) {
        out.push('<');
        out.push_str(&self.name);
        for (k, v) in &self.attributes {
            out.push(' ');
            out.push_str(k);
            out.push_str("=\"");
            out.push_str(&escape(v.as_str()));
            out.push('"');
        }
        let effective_ns = self.namespace.as_deref().or(inherited_ns);
        if let Some(ns) = self.namespace.as_deref() {
            if inherited_ns != Some(ns) {
                out.push_str(" xmlns=\"");
                out.push_str(&escape(ns));
                out.push('"');
            }
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for child in &self.children {
            match child {
                Node::Element(e) => e.write(out, effective_ns),
                Node::Text(t) => out.push_str(&escape(t.as_str())),
            }
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

/// Parse a whole XML document into an owned tree.
pub fn parse(input: &str) -> Result<Element> {
    let mut reader = NsReader::from_str(input);
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        let (resolve, event) = reader
            .read_resolved_event()
            .map_err(|e| Error::MalformedMessage(format!("xml parse: {e}")))?;
        match event {
            Event::Start(start) => {
                let elem = element_from_start(&resolve, &start)?;
                stack.push(elem);
            }
            Event::Empty(start) => {
                let elem = element_from_start(&resolve, &start)?;
                attach(&mut stack, &mut root, Node::Element(elem))?;
            }
            Event::End(_) => {
                let elem = stack
                    .pop()
                    .ok_or_else(|| Error::MalformedMessage("unbalanced end tag".into()))?;
                attach(&mut stack, &mut root, Node::Element(elem))?;
            }
            Event::Text(text) => {
                let text = text
                    .unescape()
                    .map_err(|e| Error::MalformedMessage(format!("xml text: {e}")))?;
                if !text.trim().is_empty() {
                    attach(&mut stack, &mut root, Node::Text(text.into_owned()))?;
                }
            }
            Event::CData(data) => {
                let text = String::from_utf8_lossy(&data.into_inner()).into_owned();
                attach(&mut stack, &mut root, Node::Text(text))?;
            }
            Event::Eof => break,
            // declaration, comments, processing instructions
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(Error::MalformedMessage("unterminated element".into()));
    }
    root.ok_or_else(|| Error::MalformedMessage("no root element".into()))
}

fn element_from_start(
    resolve: &ResolveResult,
    start: &quick_xml::events::BytesStart,
) -> Result<Element> {
    let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
    let namespace = match resolve {
        ResolveResult::Bound(ns) => Some(String::from_utf8_lossy(ns.as_ref()).into_owned()),
        _ => None,
    };
    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| Error::MalformedMessage(format!("xml attribute: {e}")))?;
        let key = attr.key.as_ref();
        // namespace declarations are folded into `namespace`
        if key == b"xmlns" || key.starts_with(b"xmlns:") {
            continue;
        }
        let key = String::from_utf8_lossy(key).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| Error::MalformedMessage(format!("xml attribute: {e}")))?;
        attributes.push((key, value.into_owned()));
    }
    Ok(Element {
        name,
        namespace,
        attributes,
        children: Vec::new(),
    })
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, node: Node) -> Result<()> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(node);
        return Ok(());
    }
    match node {
        Node::Element(elem) => {
            if root.is_some() {
                return Err(Error::MalformedMessage("multiple root elements".into()));
            }
            *root = Some(elem);
            Ok(())
        }
        // stray text outside the root is tolerated (framing whitespace)
        Node::Text(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_resolves_default_namespace() {
        let root = parse(
            r#"<rpc message-id="101" xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><lock><target><running/></target></lock></rpc>"#,
        )
        .unwrap();
        assert_eq!(root.name, "rpc");
        assert_eq!(root.namespace.as_deref(), Some(BASE_NS));
        assert_eq!(root.attr("message-id"), Some("101"));
        let lock = root.first_child().unwrap();
        assert_eq!(lock.name, "lock");
        assert_eq!(lock.namespace.as_deref(), Some(BASE_NS));
    }

    #[test]
    fn serialize_is_canonical() {
        let rpc = Element::new("rpc")
            .with_attr("message-id", "1000")
            .with_ns(BASE_NS)
            .with_child(
                Element::new("lock")
                    .with_child(Element::new("target").with_child(Element::new("running"))),
            );
        assert_eq!(
            rpc.to_xml(),
            r#"<rpc message-id="1000" xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><lock><target><running/></target></lock></rpc>"#
        );
    }

    #[test]
    fn round_trip_preserves_tree() {
        let doc = r#"<rpc-reply message-id="4" xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><data><x>a &amp; b</x></data></rpc-reply>"#;
        let tree = parse(doc).unwrap();
        assert_eq!(tree.to_xml(), doc);
        assert_eq!(parse(&tree.to_xml()).unwrap(), tree);
    }

    #[test]
    fn text_is_escaped() {
        let e = Element::new("a").with_text("x < y ]]>]]> z");
        let s = e.to_xml();
        assert!(!s.contains("]]>]]>"));
        assert_eq!(parse(&s).unwrap().text(), "x < y ]]>]]> z");
    }

    #[test]
    fn declaration_and_leading_whitespace_tolerated() {
        let root = parse("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\n<hello xmlns=\"urn:ietf:params:xml:ns:netconf:base:1.0\"/>\n").unwrap();
        assert_eq!(root.name, "hello");
    }
}
