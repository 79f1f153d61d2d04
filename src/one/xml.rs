//! Minimal element tree for OpenNebula XML documents

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{Error, Result};

/// An XML element with its concatenated text and child elements.
/// Attributes are not modelled; OpenNebula never uses them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct XmlNode {
    pub name: String,
    pub text: String,
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    /// Parse a document and return its root element
    pub fn parse(doc: &str) -> Result<XmlNode> {
        let mut reader = Reader::from_str(doc);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<XmlNode> = Vec::new();
        let mut root: Option<XmlNode> = None;

        loop {
            match reader.read_event()? {
                Event::Start(e) => stack.push(XmlNode {
                    name: String::from_utf8_lossy(e.name().as_ref()).into_owned(),
                    ..Default::default()
                }),
                Event::Empty(e) => {
                    let node = XmlNode {
                        name: String::from_utf8_lossy(e.name().as_ref()).into_owned(),
                        ..Default::default()
                    };
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(node),
                        None => root = Some(node),
                    }
                }
                Event::Text(t) => {
                    if let Some(node) = stack.last_mut() {
                        node.text.push_str(&t.unescape()?);
                    }
                }
                Event::CData(c) => {
                    if let Some(node) = stack.last_mut() {
                        node.text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                    }
                }
                Event::End(_) => {
                    let node = stack.pop().ok_or_else(|| {
                        Error::ProtocolError("unbalanced closing tag".to_string())
                    })?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(node),
                        None => root = Some(node),
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err(Error::ProtocolError("unterminated element".to_string()));
        }
        root.ok_or_else(|| Error::ProtocolError("empty XML document".to_string()))
    }

    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlNode> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Text of the first child called `name`
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.as_str())
    }

    /// Numeric id stored in child `name`
    pub fn child_id(&self, name: &str) -> Result<i64> {
        let raw = self.child_text(name).ok_or_else(|| {
            Error::ProtocolError(format!("<{}> has no <{}> element", self.name, name))
        })?;
        raw.trim().parse().map_err(|_| {
            Error::ProtocolError(format!("<{}><{}> is not an integer: {raw}", self.name, name))
        })
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nested_with_cdata() {
        let doc = r#"<VM><ID>12</ID><TEMPLATE><CONTEXT><NETWORK><![CDATA[YES]]></NETWORK><NOTE>a &amp; b</NOTE></CONTEXT></TEMPLATE><EMPTY/></VM>"#;
        let root = XmlNode::parse(doc).unwrap();
        assert_eq!(root.name, "VM");
        assert_eq!(root.child_id("ID").unwrap(), 12);
        let ctx = root.child("TEMPLATE").unwrap().child("CONTEXT").unwrap();
        assert_eq!(ctx.child_text("NETWORK"), Some("YES"));
        assert_eq!(ctx.child_text("NOTE"), Some("a & b"));
        assert!(root.child("EMPTY").unwrap().is_leaf());
    }

    #[test]
    fn test_bad_id() {
        let root = XmlNode::parse("<VNET><ID>abc</ID></VNET>").unwrap();
        assert!(matches!(root.child_id("ID"), Err(Error::ProtocolError(_))));
        assert!(matches!(root.child_id("NAME"), Err(Error::ProtocolError(_))));
    }

    #[test]
    fn test_empty_document() {
        assert!(XmlNode::parse("").is_err());
    }
}
