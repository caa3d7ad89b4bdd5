//! XML documents as JSON.
//!
//! Reading yields `{root: element}` where an element without attributes or
//! children is its text, and otherwise an object with attributes under `$`,
//! text under `_` and every child name mapped to an array of elements.
//! Writing takes a single-key object naming the root; attributes come from
//! `@` (or `$`), text from `#` (or `_`), and arrays repeat the element.

use super::{InputConverter, OutputConverter};
use crate::errors::ConvertError;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt::Display;

const FORMAT: &str = "xml";
const DECLARATION: &str = "<?xml version='1.0'?>\n";
const ATTRIBUTES_KEY: &str = "$";
const TEXT_KEY: &str = "_";

pub struct XmlConverter;

impl InputConverter for XmlConverter {
    fn format(&self) -> &str {
        FORMAT
    }

    fn to_file(&self, data: &Value) -> Result<String, ConvertError> {
        let root = data
            .as_object()
            .filter(|object| object.len() == 1)
            .and_then(|object| object.iter().next())
            .ok_or_else(|| failed("provided object must contain only a single root property"))?;

        let mut out = String::from(DECLARATION);
        write_element(&mut out, root.0, root.1)?;
        Ok(out)
    }
}

impl OutputConverter for XmlConverter {
    fn format(&self) -> &str {
        FORMAT
    }

    fn to_json(&self, text: &str) -> Result<Value, ConvertError> {
        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(true);

        let mut open: Vec<Element> = Vec::new();
        let mut root: Option<Value> = None;
        loop {
            match reader.read_event().map_err(failed)? {
                Event::Start(start) => open.push(Element::open(&start)?),
                Event::Empty(start) => {
                    let element = Element::open(&start)?;
                    close(&mut open, &mut root, element)?;
                }
                Event::End(_) => {
                    let element = open
                        .pop()
                        .ok_or_else(|| failed("closing tag without an open element"))?;
                    close(&mut open, &mut root, element)?;
                }
                Event::Text(content) => {
                    if let Some(element) = open.last_mut() {
                        element.text.push_str(&content.unescape().map_err(failed)?);
                    }
                }
                Event::CData(content) => {
                    if let Some(element) = open.last_mut() {
                        element.text.push_str(&String::from_utf8_lossy(&content));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !open.is_empty() {
            return Err(failed("document ended inside an open element"));
        }
        root.ok_or_else(|| failed("document has no root element"))
    }
}

struct Element {
    name: String,
    attributes: Map<String, Value>,
    children: BTreeMap<String, Vec<Value>>,
    text: String,
}

impl Element {
    fn open(start: &BytesStart<'_>) -> Result<Self, ConvertError> {
        let mut attributes = Map::new();
        for attribute in start.attributes() {
            let attribute = attribute.map_err(failed)?;
            let value = attribute.unescape_value().map_err(failed)?;
            attributes.insert(
                String::from_utf8_lossy(attribute.key.as_ref()).into_owned(),
                Value::String(value.into_owned()),
            );
        }
        Ok(Self {
            name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
            attributes,
            children: BTreeMap::new(),
            text: String::new(),
        })
    }

    fn into_value(self) -> Value {
        let text = self.text.trim();
        if self.attributes.is_empty() && self.children.is_empty() {
            return Value::String(text.to_string());
        }
        let mut object = Map::new();
        if !self.attributes.is_empty() {
            object.insert(ATTRIBUTES_KEY.to_string(), Value::Object(self.attributes));
        }
        if !text.is_empty() {
            object.insert(TEXT_KEY.to_string(), Value::String(text.to_string()));
        }
        for (name, items) in self.children {
            object.insert(name, Value::Array(items));
        }
        Value::Object(object)
    }
}

fn close(
    open: &mut [Element],
    root: &mut Option<Value>,
    element: Element,
) -> Result<(), ConvertError> {
    let name = element.name.clone();
    let value = element.into_value();
    match open.last_mut() {
        Some(parent) => parent.children.entry(name).or_default().push(value),
        None if root.is_some() => return Err(failed("document has more than one root element")),
        None => {
            let mut object = Map::new();
            object.insert(name, value);
            *root = Some(Value::Object(object));
        }
    }
    Ok(())
}

fn write_element(out: &mut String, name: &str, value: &Value) -> Result<(), ConvertError> {
    if !is_valid_name(name) {
        return Err(failed(format!("'{}' is not a valid element name", name)));
    }

    let object = match value {
        Value::Array(items) => {
            for item in items {
                write_element(out, name, item)?;
            }
            return Ok(());
        }
        Value::Null => {
            out.push_str(&format!("<{}/>", name));
            return Ok(());
        }
        Value::Object(object) => object,
        scalar => {
            let text = scalar_text(scalar);
            out.push_str(&format!("<{}>{}</{}>", name, escape(text.as_str()), name));
            return Ok(());
        }
    };

    out.push('<');
    out.push_str(name);
    if let Some(attributes) = object.get("@").or_else(|| object.get(ATTRIBUTES_KEY)) {
        let attributes = attributes
            .as_object()
            .ok_or_else(|| failed(format!("attributes of '{}' must be an object", name)))?;
        for (key, value) in attributes {
            if !is_valid_name(key) {
                return Err(failed(format!("'{}' is not a valid attribute name", key)));
            }
            let text = scalar_text(value);
            out.push_str(&format!(" {}=\"{}\"", key, escape(text.as_str())));
        }
    }

    let text = object
        .get("#")
        .or_else(|| object.get(TEXT_KEY))
        .map(scalar_text);
    let children: Vec<(&String, &Value)> = object
        .iter()
        .filter(|(key, _)| !matches!(key.as_str(), "@" | "#" | ATTRIBUTES_KEY | TEXT_KEY))
        .collect();

    if text.is_none() && children.is_empty() {
        out.push_str("/>");
        return Ok(());
    }
    out.push('>');
    if let Some(text) = text {
        out.push_str(&escape(text.as_str()));
    }
    for (child, value) in children {
        write_element(out, child, value)?;
    }
    out.push_str(&format!("</{}>", name));
    Ok(())
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_alphabetic() || first == '_' || first == ':' => chars
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | ':' | '-' | '.')),
        _ => false,
    }
}

fn failed(message: impl Display) -> ConvertError {
    ConvertError::failed(FORMAT, message.to_string())
}
