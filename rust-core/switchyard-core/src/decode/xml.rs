//! # XML Decoder
//!
//! Builds a small element tree with `quick-xml`.
//!
//! Entities are never resolved. By default any `<!DOCTYPE>` is refused;
//! when DTDs are allowed, `SYSTEM`/`PUBLIC` identifiers (external subsets and
//! external entities) are still refused unless explicitly enabled.

use crate::decode::Format;
use crate::error::DecodeError;
use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::Reader;
use serde::Deserialize;

/// Default maximum element nesting depth
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// XML decode settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct XmlOptions {
    /// Accept `<!DOCTYPE>` declarations (internal subsets only unless
    /// `allow_external_entities` is also set)
    pub allow_dtd: bool,
    /// Accept `SYSTEM`/`PUBLIC` references inside a DOCTYPE
    pub allow_external_entities: bool,
    /// Check end-tag names, attribute syntax and entity references
    pub strict: bool,
    /// Maximum element nesting depth
    pub max_depth: usize,
}

impl Default for XmlOptions {
    fn default() -> Self {
        Self {
            allow_dtd: false,
            allow_external_entities: false,
            strict: true,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// Child of an element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlNode {
    /// Nested element
    Element(XmlElement),
    /// Character data (text or CDATA)
    Text(String),
}

/// Element with attributes and children
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlElement {
    /// Qualified tag name
    pub name: String,
    /// Attributes in document order
    pub attributes: Vec<(String, String)>,
    /// Children in document order
    pub children: Vec<XmlNode>,
}

impl XmlElement {
    /// Attribute value by name
    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// First child element with the given name
    #[must_use]
    pub fn child(&self, name: &str) -> Option<&Self> {
        self.elements().find(|e| e.name == name)
    }

    /// Child elements
    pub fn elements(&self) -> impl Iterator<Item = &Self> {
        self.children.iter().filter_map(|c| match c {
            XmlNode::Element(e) => Some(e),
            XmlNode::Text(_) => None,
        })
    }

    /// Concatenated direct text content
    #[must_use]
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|c| match c {
                XmlNode::Text(t) => Some(t.as_str()),
                XmlNode::Element(_) => None,
            })
            .collect()
    }
}

fn malformed(message: impl ToString) -> DecodeError {
    DecodeError::malformed(Format::Xml, message)
}

/// Parse an XML document into its root element
///
/// # Errors
///
/// `MalformedPayload` for syntax errors, refused DOCTYPEs, unknown entities
/// in strict mode, text or elements outside the root; `PayloadTooLarge`
/// (scope `depth`) past `max_depth`.
pub fn decode(bytes: &[u8], options: &XmlOptions) -> Result<XmlElement, DecodeError> {
    let mut reader = Reader::from_reader(bytes);
    let config = reader.config_mut();
    config.trim_text(true);
    config.check_end_names = options.strict;

    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| malformed(format!("{e} (at byte {})", reader.buffer_position())))?;

        match event {
            Event::DocType(doctype) => check_doctype(&doctype, options)?,
            Event::Start(start) => {
                open_element(&stack, root.as_ref(), options)?;
                stack.push(element_from(&start, options)?);
            }
            Event::Empty(start) => {
                open_element(&stack, root.as_ref(), options)?;
                let element = element_from(&start, options)?;
                close_element(&mut stack, &mut root, element);
            }
            Event::End(_) => {
                let element = stack.pop().ok_or_else(|| malformed("unexpected closing tag"))?;
                close_element(&mut stack, &mut root, element);
            }
            Event::Text(text) => {
                let content = text_content(&text, options)?;
                push_text(&mut stack, content)?;
            }
            Event::CData(cdata) => {
                let content = String::from_utf8(cdata.into_inner().into_owned())
                    .map_err(|e| malformed(e))?;
                push_text(&mut stack, content)?;
            }
            Event::Eof => break,
            // Declarations, comments and processing instructions carry no data
            _ => {}
        }
    }

    if let Some(open) = stack.last() {
        return Err(malformed(format!("unclosed element <{}>", open.name)));
    }
    root.ok_or_else(|| malformed("document has no root element"))
}

fn check_doctype(doctype: &BytesText<'_>, options: &XmlOptions) -> Result<(), DecodeError> {
    if !options.allow_dtd {
        return Err(malformed("DOCTYPE declarations are not allowed"));
    }
    if options.allow_external_entities {
        return Ok(());
    }
    let declaration = String::from_utf8_lossy(doctype).to_ascii_uppercase();
    if declaration.contains("SYSTEM") || declaration.contains("PUBLIC") {
        return Err(malformed(
            "external DTD or entity references are not allowed",
        ));
    }
    Ok(())
}

fn open_element(
    stack: &[XmlElement],
    root: Option<&XmlElement>,
    options: &XmlOptions,
) -> Result<(), DecodeError> {
    if stack.is_empty() && root.is_some() {
        return Err(malformed("multiple root elements"));
    }
    if stack.len() >= options.max_depth {
        return Err(DecodeError::PayloadTooLarge {
            scope: "depth",
            limit: options.max_depth,
            actual: stack.len() + 1,
        });
    }
    Ok(())
}

fn close_element(stack: &mut [XmlElement], root: &mut Option<XmlElement>, element: XmlElement) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(XmlNode::Element(element)),
        None => *root = Some(element),
    }
}

fn push_text(stack: &mut [XmlElement], content: String) -> Result<(), DecodeError> {
    match stack.last_mut() {
        Some(parent) => {
            if !content.is_empty() {
                parent.children.push(XmlNode::Text(content));
            }
            Ok(())
        }
        None if content.trim().is_empty() => Ok(()),
        None => Err(malformed("text outside the root element")),
    }
}

fn element_from(start: &BytesStart<'_>, options: &XmlOptions) -> Result<XmlElement, DecodeError> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();

    let mut attributes = Vec::new();
    let mut iter = start.attributes();
    iter.with_checks(options.strict);
    for attr in iter {
        let attr = attr.map_err(|e| malformed(e))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = match attr.unescape_value() {
            Ok(v) => v.into_owned(),
            Err(e) if options.strict => return Err(malformed(e)),
            Err(_) => String::from_utf8_lossy(&attr.value).into_owned(),
        };
        attributes.push((key, value));
    }

    Ok(XmlElement {
        name,
        attributes,
        children: Vec::new(),
    })
}

fn text_content(text: &BytesText<'_>, options: &XmlOptions) -> Result<String, DecodeError> {
    match text.unescape() {
        Ok(v) => Ok(v.into_owned()),
        Err(e) if options.strict => Err(malformed(e)),
        Err(_) => Ok(String::from_utf8_lossy(text).into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_tree() {
        let xml = br#"<?xml version="1.0"?>
            <order id="7">
                <item sku="a1">Widget &amp; Co</item>
                <item sku="b2"/>
                <note><![CDATA[<fragile>]]></note>
            </order>"#;
        let root = decode(xml, &XmlOptions::default()).unwrap();
        assert_eq!(root.name, "order");
        assert_eq!(root.attr("id"), Some("7"));

        let items: Vec<&XmlElement> = root.elements().filter(|e| e.name == "item").collect();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].text(), "Widget & Co");
        assert_eq!(items[1].attr("sku"), Some("b2"));
        assert_eq!(root.child("note").unwrap().text(), "<fragile>");
    }

    #[test]
    fn test_external_entity_rejected_by_default() {
        let xml = br#"<?xml version="1.0"?>
            <!DOCTYPE foo [ <!ENTITY xxe SYSTEM "file:///etc/passwd"> ]>
            <foo>&xxe;</foo>"#;
        let err = decode(xml, &XmlOptions::default()).unwrap_err();
        match err {
            DecodeError::MalformedPayload { message, .. } => {
                assert!(message.contains("DOCTYPE"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_external_entity_rejected_even_with_dtd_allowed() {
        let options = XmlOptions {
            allow_dtd: true,
            ..XmlOptions::default()
        };
        let xml = br#"<!DOCTYPE foo [ <!ENTITY xxe SYSTEM "http://evil.example/x"> ]><foo>&xxe;</foo>"#;
        let err = decode(xml, &options).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::MalformedPayload { ref message, .. } if message.contains("external")
        ));
    }

    #[test]
    fn test_internal_entity_is_never_expanded() {
        let options = XmlOptions {
            allow_dtd: true,
            ..XmlOptions::default()
        };
        let xml = br#"<!DOCTYPE foo [ <!ENTITY boom "lol"> ]><foo>&boom;</foo>"#;
        assert!(decode(xml, &options).is_err());

        let lenient = XmlOptions {
            strict: false,
            ..options
        };
        let root = decode(xml, &lenient).unwrap();
        assert_eq!(root.text(), "&boom;");
    }

    #[test]
    fn test_strict_end_names() {
        let err = decode(b"<a><b></a></b>", &XmlOptions::default()).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedPayload { .. }));
    }

    #[test]
    fn test_multiple_roots_rejected() {
        let err = decode(b"<a/><b/>", &XmlOptions::default()).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedPayload { .. }));
    }

    #[test]
    fn test_depth_limit() {
        let options = XmlOptions {
            max_depth: 2,
            ..XmlOptions::default()
        };
        assert!(decode(b"<a><b/></a>", &options).is_ok());
        let err = decode(b"<a><b><c/></b></a>", &options).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::PayloadTooLarge { scope: "depth", .. }
        ));
    }
}
