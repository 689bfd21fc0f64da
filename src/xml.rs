//! A small owned XML element tree.
//!
//! Both the board configuration and the partition layout descriptions are small documents that
//! are queried many times with ElementTree-style lookups (`.//data[@type='X']/entry`), so they are
//! read once into memory with `quick-xml` and then walked as plain data.

use anyhow::Context;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use std::fs;
use std::path::Path;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Element>,
    text: String,
}

impl Element {
    /// Parse a whole document, returning its root element.
    pub fn parse(source: &str) -> anyhow::Result<Self> {
        let mut reader = Reader::from_str(source);
        reader.trim_text(true);

        // The bottom of the stack is a synthetic document node collecting the root element
        let mut stack = vec![Element::default()];
        let mut buf = Vec::new();
        loop {
            match reader.read_event(&mut buf) {
                Ok(Event::Start(ref e)) => stack.push(Self::from_start(e, &reader)?),
                Ok(Event::Empty(ref e)) => {
                    let element = Self::from_start(e, &reader)?;
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(element);
                    }
                }
                Ok(Event::End(_)) => {
                    anyhow::ensure!(stack.len() > 1, "unbalanced closing tag");
                    if let Some(element) = stack.pop() {
                        if let Some(parent) = stack.last_mut() {
                            parent.children.push(element);
                        }
                    }
                }
                Ok(Event::Text(ref t)) => {
                    let text = t.unescape_and_decode(&reader)?;
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(&text);
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => (),
                Err(e) => anyhow::bail!(
                    "XML error at position {}: {}",
                    reader.buffer_position(),
                    e
                ),
            }
            buf.clear();
        }

        anyhow::ensure!(stack.len() == 1, "unclosed element at end of document");
        stack
            .pop()
            .and_then(|document| document.children.into_iter().next())
            .ok_or(anyhow::anyhow!("empty XML document"))
    }

    /// Read and parse a document from disk.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let source =
            fs::read_to_string(path).with_context(|| format!("error opening {}", path.display()))?;
        Self::parse(&source).with_context(|| format!("error parsing {}", path.display()))
    }

    fn from_start(start: &BytesStart, reader: &Reader<&[u8]>) -> anyhow::Result<Self> {
        let name = String::from_utf8(start.name().to_vec())?;

        let mut attributes = Vec::new();
        for attr in start.attributes() {
            let attr = attr?;
            let key = String::from_utf8(attr.key.to_vec())?;
            let value = attr.unescape_and_decode_value(reader)?;
            attributes.push((key, value));
        }

        Ok(Self {
            name,
            attributes,
            ..Default::default()
        })
    }

    /// The element's text content, with surrounding whitespace removed.
    pub fn text(&self) -> &str {
        self.text.trim()
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Direct children with the given tag name, in document order.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// First direct child with the given tag name.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    /// First direct child with the given tag name and attribute value.
    pub fn child_with_attr(&self, name: &str, key: &str, value: &str) -> Option<&Element> {
        self.children
            .iter()
            .find(|c| c.name == name && c.attr(key) == Some(value))
    }

    /// All descendants (not including `self`) in document order.
    pub fn descendants(&self) -> Vec<&Element> {
        let mut out = Vec::new();
        for child in &self.children {
            out.push(child);
            out.extend(child.descendants());
        }
        out
    }

    /// First descendant with the given tag name, like ElementTree's `.//name`.
    pub fn find(&self, name: &str) -> Option<&Element> {
        self.descendants().into_iter().find(|e| e.name == name)
    }

    /// All descendants with the given tag name.
    pub fn find_all(&self, name: &str) -> Vec<&Element> {
        self.descendants()
            .into_iter()
            .filter(|e| e.name == name)
            .collect()
    }

    /// First descendant with the given tag name and attribute value, like `.//name[@key='value']`.
    pub fn find_with_attr(&self, name: &str, key: &str, value: &str) -> Option<&Element> {
        self.descendants()
            .into_iter()
            .find(|e| e.name == name && e.attr(key) == Some(value))
    }

    /// Text of the first descendant with the given tag name.
    pub fn find_text(&self, name: &str) -> Option<&str> {
        self.find(name).map(Element::text)
    }
}

#[test]
fn test_parse_tree() -> anyhow::Result<()> {
    let doc = Element::parse(
        r#"<?xml version="1.0"?>
        <config>
            <data type="MACH_ID_BOARD_MAP">
                <entry><machid>0x8060001</machid><tiny_image/></entry>
                <entry><machid>0x8060002</machid></entry>
            </data>
            <data type="EMMC_PARAMETER">
                <partition_mbn> gpt_main0.bin </partition_mbn>
            </data>
        </config>"#,
    )?;

    assert_eq!(doc.name, "config");
    let map = doc
        .find_with_attr("data", "type", "MACH_ID_BOARD_MAP")
        .unwrap();
    let entries: Vec<_> = map.children_named("entry").collect();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].find_text("machid"), Some("0x8060001"));
    assert!(entries[0].find("tiny_image").is_some());
    assert!(entries[1].find("tiny_image").is_none());
    assert_eq!(doc.find_text("partition_mbn"), Some("gpt_main0.bin"));
    assert_eq!(doc.find_all("entry").len(), 2);

    Ok(())
}

#[test]
fn test_parse_attributes() -> anyhow::Result<()> {
    let doc = Element::parse(
        r#"<partitions><partition label="0:HLOS" filename="a&amp;b.img"/></partitions>"#,
    )?;
    let row = doc.child("partition").unwrap();
    assert_eq!(row.attr("label"), Some("0:HLOS"));
    assert_eq!(row.attr("filename"), Some("a&b.img"));
    assert_eq!(row.attr("missing"), None);
    Ok(())
}

#[test]
fn test_child_lookups() -> anyhow::Result<()> {
    let doc = Element::parse(
        r#"<nand><partition name="a"/><partition name="b"><img_name>b.bin</img_name></partition></nand>"#,
    )?;
    // The looked-up name is a temporary that does not outlive the call
    let found = doc.child_with_attr(&String::from("partition"), "name", "b");
    assert_eq!(found.and_then(|p| p.child("img_name")).map(Element::text), Some("b.bin"));
    assert_eq!(doc.child(&String::from("partition")).and_then(|p| p.attr("name")), Some("a"));
    assert!(doc.child_with_attr("partition", "name", "c").is_none());
    Ok(())
}

#[test]
fn test_parse_unbalanced() {
    assert!(Element::parse("<a><b></a>").is_err());
    assert!(Element::parse("").is_err());
}
