//! Owned XML element tree used for configuration and log events.
//!
//! The configuration document, the alarm log events, and `clone_alarm` all
//! need a small DOM: ordered attributes, text content, child elements, and a
//! faithful write-back. Parsing goes through `quick-xml`; writing is done
//! directly so the logger controls exactly what bytes land in the envelope.

use std::fmt::Write as _;

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::ConfigError;

/// One XML element: name, ordered attributes, text content, children.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Element {
    pub name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Element>,
    text: String,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    // ------------------------------------------------------------------
    // Attributes
    // ------------------------------------------------------------------

    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let name = name.into();
        let value = value.into();
        if let Some(slot) = self.attrs.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.attrs.push((name, value));
        }
        self
    }

    pub fn set_attr_bool(&mut self, name: impl Into<String>, value: bool) -> &mut Self {
        self.set_attr(name, if value { "true" } else { "false" })
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attr(name).is_some()
    }

    pub fn remove_attr(&mut self, name: &str) {
        self.attrs.retain(|(n, _)| n != name);
    }

    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn require_attr(&self, name: &'static str) -> Result<&str, ConfigError> {
        self.attr(name).ok_or(ConfigError::MissingAttribute(name))
    }

    pub fn attr_bool(&self, name: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.attr(name) {
            None => Ok(default),
            Some("true") | Some("1") => Ok(true),
            Some("false") | Some("0") => Ok(false),
            Some(other) => Err(ConfigError::InvalidAttribute {
                attr: name,
                value: other.to_string(),
            }),
        }
    }

    pub fn attr_u32(&self, name: &'static str) -> Result<Option<u32>, ConfigError> {
        match self.attr(name) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<u32>()
                .map(Some)
                .map_err(|_| ConfigError::InvalidAttribute {
                    attr: name,
                    value: raw.to_string(),
                }),
        }
    }

    pub fn attr_i64(&self, name: &'static str) -> Result<Option<i64>, ConfigError> {
        match self.attr(name) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|_| ConfigError::InvalidAttribute {
                    attr: name,
                    value: raw.to_string(),
                }),
        }
    }

    // ------------------------------------------------------------------
    // Content and children
    // ------------------------------------------------------------------

    pub fn set_text(&mut self, text: impl Into<String>) -> &mut Self {
        self.text = text.into();
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Append a child element and return a mutable reference to it.
    pub fn add_element(&mut self, name: impl Into<String>) -> &mut Element {
        self.children.push(Element::new(name));
        // Just pushed, so the vec is non-empty.
        let idx = self.children.len() - 1;
        &mut self.children[idx]
    }

    pub fn push_child(&mut self, child: Element) {
        self.children.push(child);
    }

    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter()
    }

    pub fn children_mut(&mut self) -> impl Iterator<Item = &mut Element> {
        self.children.iter_mut()
    }

    pub fn find(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut Element> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    pub fn require(&self, name: &'static str) -> Result<&Element, ConfigError> {
        self.find(name).ok_or(ConfigError::MissingElement(name))
    }

    /// Text of a required child element.
    pub fn require_text(&self, name: &'static str) -> Result<&str, ConfigError> {
        self.require(name).map(Element::text)
    }

    // ------------------------------------------------------------------
    // Parse / write
    // ------------------------------------------------------------------

    /// Parse a document and return its root element.
    pub fn parse(input: &str) -> Result<Element, ConfigError> {
        let mut reader = Reader::from_str(input);
        reader.trim_text(true);
        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;
        loop {
            match reader.read_event() {
                Ok(Event::Start(start)) => {
                    let mut elem =
                        Element::new(String::from_utf8_lossy(start.name().as_ref()).into_owned());
                    for attr in start.attributes() {
                        let attr = attr.map_err(|e| ConfigError::Xml(e.to_string()))?;
                        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
                        let value = attr
                            .unescape_value()
                            .map_err(|e| ConfigError::Xml(e.to_string()))?
                            .into_owned();
                        elem.set_attr(key, value);
                    }
                    stack.push(elem);
                }
                Ok(Event::Empty(start)) => {
                    let mut elem =
                        Element::new(String::from_utf8_lossy(start.name().as_ref()).into_owned());
                    for attr in start.attributes() {
                        let attr = attr.map_err(|e| ConfigError::Xml(e.to_string()))?;
                        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
                        let value = attr
                            .unescape_value()
                            .map_err(|e| ConfigError::Xml(e.to_string()))?
                            .into_owned();
                        elem.set_attr(key, value);
                    }
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(elem),
                        None => root = Some(elem),
                    }
                }
                Ok(Event::Text(t)) => {
                    let text = t
                        .unescape()
                        .map_err(|e| ConfigError::Xml(e.to_string()))?
                        .into_owned();
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(&text);
                    }
                }
                Ok(Event::CData(c)) => {
                    let text = String::from_utf8_lossy(&c.into_inner()).into_owned();
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(&text);
                    }
                }
                Ok(Event::End(_)) => {
                    let elem = match stack.pop() {
                        Some(e) => e,
                        None => return Err(ConfigError::Xml("unbalanced end tag".into())),
                    };
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(elem),
                        None => root = Some(elem),
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => return Err(ConfigError::Xml(e.to_string())),
            }
        }
        if !stack.is_empty() {
            return Err(ConfigError::Xml("unterminated element".into()));
        }
        root.ok_or_else(|| ConfigError::Xml("empty document".into()))
    }

    /// Render on one line, no indentation. Used for log event fragments.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_into(&mut out, None, 0);
        out
    }

    /// Render with two-space indentation and trailing newlines per element.
    pub fn to_xml_pretty(&self) -> String {
        let mut out = String::new();
        self.write_into(&mut out, Some(2), 0);
        out
    }

    fn write_into(&self, out: &mut String, indent: Option<usize>, depth: usize) {
        let pad = |out: &mut String, depth: usize| {
            if let Some(width) = indent {
                for _ in 0..depth * width {
                    out.push(' ');
                }
            }
        };
        pad(out, depth);
        let _ = write!(out, "<{}", self.name);
        for (name, value) in &self.attrs {
            let _ = write!(out, " {}=\"{}\"", name, escape_attr(value));
        }
        if self.children.is_empty() && self.text.is_empty() {
            out.push_str("/>");
            if indent.is_some() {
                out.push('\n');
            }
            return;
        }
        out.push('>');
        if self.children.is_empty() {
            out.push_str(&escape_text(&self.text));
            let _ = write!(out, "</{}>", self.name);
            if indent.is_some() {
                out.push('\n');
            }
            return;
        }
        if indent.is_some() {
            out.push('\n');
        }
        if !self.text.is_empty() {
            pad(out, depth + 1);
            out.push_str(&escape_text(&self.text));
            if indent.is_some() {
                out.push('\n');
            }
        }
        for child in &self.children {
            child.write_into(out, indent, depth + 1);
        }
        pad(out, depth);
        let _ = write!(out, "</{}>", self.name);
        if indent.is_some() {
            out.push('\n');
        }
    }
}

fn escape_text(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
    out
}

fn escape_attr(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}
