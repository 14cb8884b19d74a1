//! Parsed documents and path lookups over them.
//!
//! Path syntax depends on the document kind:
//! - JSON and XML: dot-separated keys and array ordinals (`data.items.0.id`)
//! - HTML: a CSS selector, first match wins
//! - text: a regular expression, first capture group or the whole match
//!
//! XML is converted to a JSON value when parsed: attributes become `@name`
//! keys, repeated child elements become arrays, and text next to attributes
//! or children lands under `#text`.
//!
//! HTML is kept as markup and re-parsed per lookup, so documents stay `Send`
//! and can cross await points.

use crate::config::{DocumentKind, FieldType};
use crate::node::{walk_value, JsonNode};
use crate::types::{CarveError, CarveResult};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::{Map, Value};

/// A fetched body, parsed according to its declared kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Document {
    Json(Value),
    Html {
        markup: String,
        /// Parsed as a fragment (an array element) rather than a full page.
        fragment: bool,
    },
    Text(String),
}

impl Document {
    pub fn parse(kind: DocumentKind, body: &[u8]) -> CarveResult<Self> {
        match kind {
            DocumentKind::Json => {
                if body.iter().all(u8::is_ascii_whitespace) {
                    return Ok(Document::Json(Value::Null));
                }
                serde_json::from_slice(body)
                    .map(Document::Json)
                    .map_err(|e| CarveError::Parse(format!("invalid JSON document: {e}")))
            }
            DocumentKind::Xml => xml_to_value(&String::from_utf8_lossy(body)).map(Document::Json),
            DocumentKind::Html => Ok(Document::Html {
                markup: String::from_utf8_lossy(body).into_owned(),
                fragment: false,
            }),
            DocumentKind::Text => Ok(Document::Text(String::from_utf8_lossy(body).into_owned())),
        }
    }

    /// Treat an already-built node as a structured document.
    pub fn from_node(node: &JsonNode) -> Self {
        Document::Json(node.raw())
    }

    /// The node templates and expressions see when this document is the scope.
    pub fn to_node(&self) -> JsonNode {
        match self {
            Document::Json(value) => JsonNode::from(value.clone()),
            Document::Html { markup, .. } => JsonNode::string(markup.clone()),
            Document::Text(text) => JsonNode::string(text.clone()),
        }
    }

    /// Raw value at `path`, before type coercion. `None` when nothing matches.
    ///
    /// `attribute` and `FieldType::Html` only apply to HTML documents.
    pub fn lookup(
        &self,
        path: &str,
        attribute: Option<&str>,
        field_type: FieldType,
    ) -> CarveResult<Option<Value>> {
        match self {
            Document::Json(value) => Ok(walk_value(value, path)
                .filter(|v| !v.is_null())
                .cloned()),
            Document::Html { markup, fragment } => {
                let html = parse_html(markup, *fragment);
                let element = match path.trim() {
                    "" => top_element(&html, *fragment),
                    selector => html.select(&compile_selector(selector)?).next(),
                };
                Ok(element.and_then(|el| match attribute {
                    Some(name) => el.value().attr(name).map(|v| Value::String(v.to_string())),
                    None if field_type == FieldType::Html => Some(Value::String(el.inner_html())),
                    None => Some(Value::String(element_text(el))),
                }))
            }
            Document::Text(text) => match path {
                blank if blank.trim().is_empty() => Ok(Some(Value::String(text.clone()))),
                pattern => Ok(first_match(&compile_regex(pattern)?, text).map(Value::String)),
            },
        }
    }

    /// Sub-document at `path`. Missing paths give an empty document of the same kind.
    pub fn narrow(&self, path: &str) -> CarveResult<Document> {
        if path.trim().is_empty() {
            return Ok(self.clone());
        }
        match self {
            Document::Json(value) => Ok(Document::Json(
                walk_value(value, path).cloned().unwrap_or(Value::Null),
            )),
            Document::Html { markup, fragment } => {
                let html = parse_html(markup, *fragment);
                let selector = compile_selector(path)?;
                Ok(Document::Html {
                    markup: html.select(&selector).next().map(|el| el.html()).unwrap_or_default(),
                    fragment: true,
                })
            }
            Document::Text(text) => Ok(Document::Text(
                first_match(&compile_regex(path)?, text).unwrap_or_default(),
            )),
        }
    }

    /// The sequence an array spec iterates over, in source order.
    ///
    /// JSON arrays yield their elements, a single non-null value yields itself,
    /// HTML yields every matched element, text yields every regex match.
    pub fn items(&self, path: &str) -> CarveResult<Vec<Document>> {
        match self {
            Document::Json(value) => Ok(match walk_value(value, path) {
                Some(Value::Array(items)) => items.iter().cloned().map(Document::Json).collect(),
                Some(Value::Null) | None => Vec::new(),
                Some(single) => vec![Document::Json(single.clone())],
            }),
            Document::Html { markup, fragment } => {
                if path.trim().is_empty() {
                    return Ok(vec![self.clone()]);
                }
                let html = parse_html(markup, *fragment);
                let selector = compile_selector(path)?;
                Ok(html
                    .select(&selector)
                    .map(|el| Document::Html {
                        markup: el.html(),
                        fragment: true,
                    })
                    .collect())
            }
            Document::Text(text) => {
                if path.trim().is_empty() {
                    return Ok(text.lines().map(|l| Document::Text(l.to_string())).collect());
                }
                let re = compile_regex(path)?;
                Ok(re
                    .captures_iter(text)
                    .filter_map(|caps| caps.get(1).or_else(|| caps.get(0)))
                    .map(|m| Document::Text(m.as_str().to_string()))
                    .collect())
            }
        }
    }
}

/// Convert a raw extracted value to `field_type`. `None` when it cannot be.
pub fn coerce(raw: Value, field_type: FieldType) -> Option<JsonNode> {
    match field_type {
        FieldType::Null => Some(JsonNode::Null),
        FieldType::Bool => match raw {
            Value::Bool(b) => Some(JsonNode::Bool(b)),
            Value::Number(n) => n.as_f64().map(|f| JsonNode::Bool(f != 0.0)),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Some(JsonNode::Bool(true)),
                "false" | "0" | "no" => Some(JsonNode::Bool(false)),
                _ => None,
            },
            _ => None,
        },
        FieldType::String | FieldType::Html => match raw {
            Value::Null => None,
            Value::String(s) => Some(JsonNode::String(s)),
            other => Some(JsonNode::String(other.to_string())),
        },
        FieldType::Int => match raw {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
                .map(JsonNode::int),
            Value::String(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
                    .map(JsonNode::int)
            }
            Value::Bool(b) => Some(JsonNode::int(i64::from(b))),
            _ => None,
        },
        FieldType::Float => match raw {
            Value::Number(n) => n.as_f64().and_then(JsonNode::float),
            Value::String(s) => s.trim().parse::<f64>().ok().and_then(JsonNode::float),
            _ => None,
        },
        FieldType::Raw => match raw {
            Value::String(s) => Some(
                serde_json::from_str::<Value>(&s)
                    .map(JsonNode::from)
                    .unwrap_or(JsonNode::String(s)),
            ),
            other => Some(JsonNode::from(other)),
        },
    }
}

// ── HTML ──

fn parse_html(markup: &str, fragment: bool) -> Html {
    if fragment {
        Html::parse_fragment(markup)
    } else {
        Html::parse_document(markup)
    }
}

/// The element a selector-less lookup reads: the fragment's own element, or
/// the document root.
fn top_element(html: &Html, fragment: bool) -> Option<ElementRef<'_>> {
    let root = html.root_element();
    if fragment {
        root.children().find_map(ElementRef::wrap).or(Some(root))
    } else {
        Some(root)
    }
}

fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn compile_selector(selector: &str) -> CarveResult<Selector> {
    Selector::parse(selector.trim())
        .map_err(|e| CarveError::Configuration(format!("invalid CSS selector '{selector}': {e}")))
}

// ── Text ──

fn compile_regex(pattern: &str) -> CarveResult<Regex> {
    Regex::new(pattern)
        .map_err(|e| CarveError::Configuration(format!("invalid pattern '{pattern}': {e}")))
}

fn first_match(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|caps| caps.get(1).or_else(|| caps.get(0)))
        .map(|m| m.as_str().to_string())
}

// ── XML ──

struct XmlFrame {
    name: String,
    fields: Map<String, Value>,
    text: String,
}

impl XmlFrame {
    fn open(start: &BytesStart<'_>) -> CarveResult<Self> {
        let mut fields = Map::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| CarveError::Parse(format!("invalid XML attribute: {e}")))?;
            let key = format!("@{}", String::from_utf8_lossy(attr.key.local_name().as_ref()));
            let value = attr
                .unescape_value()
                .map_err(|e| CarveError::Parse(format!("invalid XML attribute value: {e}")))?;
            fields.insert(key, Value::String(value.into_owned()));
        }
        Ok(Self {
            name: String::from_utf8_lossy(start.local_name().as_ref()).into_owned(),
            fields,
            text: String::new(),
        })
    }

    fn finish(mut self) -> (String, Value) {
        let text = self.text.trim().to_string();
        let value = if self.fields.is_empty() {
            Value::String(text)
        } else {
            if !text.is_empty() {
                self.fields.insert("#text".to_string(), Value::String(text));
            }
            Value::Object(self.fields)
        };
        (self.name, value)
    }
}

/// Repeated keys turn into arrays in document order.
fn insert_child(fields: &mut Map<String, Value>, name: String, value: Value) {
    match fields.get_mut(&name) {
        Some(Value::Array(existing)) => existing.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            fields.insert(name, value);
        }
    }
}

fn xml_to_value(xml: &str) -> CarveResult<Value> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut stack = vec![XmlFrame {
        name: String::new(),
        fields: Map::new(),
        text: String::new(),
    }];

    loop {
        let event = reader.read_event_into(&mut buf).map_err(|e| {
            CarveError::Parse(format!(
                "invalid XML at position {}: {e}",
                reader.buffer_position()
            ))
        })?;
        match event {
            Event::Start(e) => stack.push(XmlFrame::open(&e)?),
            Event::Empty(e) => {
                let (name, value) = XmlFrame::open(&e)?.finish();
                if let Some(parent) = stack.last_mut() {
                    insert_child(&mut parent.fields, name, value);
                }
            }
            Event::End(_) => {
                if stack.len() < 2 {
                    return Err(CarveError::Parse("unbalanced XML end tag".to_string()));
                }
                if let Some(frame) = stack.pop() {
                    let (name, value) = frame.finish();
                    if let Some(parent) = stack.last_mut() {
                        insert_child(&mut parent.fields, name, value);
                    }
                }
            }
            Event::Text(e) => {
                let text = e
                    .unescape()
                    .map_err(|e| CarveError::Parse(format!("invalid XML text: {e}")))?;
                if let Some(frame) = stack.last_mut() {
                    frame.text.push_str(&text);
                }
            }
            Event::CData(e) => {
                if let Some(frame) = stack.last_mut() {
                    frame.text.push_str(&String::from_utf8_lossy(&e.into_inner()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if stack.len() != 1 {
        return Err(CarveError::Parse("unclosed XML element".to_string()));
    }
    let root = stack.remove(0);
    Ok(Value::Object(root.fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const PAGE: &str = r#"
        <html><body>
          <h1 class="title">  Weekly
             deals </h1>
          <ul id="products">
            <li data-sku="a1"><a href="/p/1">First</a> <span class="price">10</span></li>
            <li data-sku="b2"><a href="/p/2">Second</a> <span class="price">12.5</span></li>
            <li data-sku="c3"><a href="/p/3"><b>Third</b></a></li>
          </ul>
        </body></html>"#;

    fn page() -> Document {
        Document::parse(DocumentKind::Html, PAGE.as_bytes()).unwrap()
    }

    #[test]
    fn test_json_lookup() {
        let doc = Document::parse(DocumentKind::Json, br#"{"data": {"items": [{"id": 1}, {"id": null}]}}"#).unwrap();
        assert_eq!(doc.lookup("data.items.0.id", None, FieldType::Int).unwrap(), Some(json!(1)));
        assert_eq!(doc.lookup("data.items.1.id", None, FieldType::Int).unwrap(), None);
        assert_eq!(doc.lookup("data.nope", None, FieldType::Int).unwrap(), None);
        assert_eq!(doc.items("data.items").unwrap().len(), 2);
        assert!(doc.items("data.missing").unwrap().is_empty());
    }

    #[test]
    fn test_json_errors_and_empty_body() {
        assert_eq!(Document::parse(DocumentKind::Json, b"  \n").unwrap(), Document::Json(Value::Null));
        let err = Document::parse(DocumentKind::Json, b"{broken").unwrap_err();
        assert!(matches!(err, CarveError::Parse(_)));
    }

    #[test]
    fn test_html_selector_text_and_attribute() {
        let doc = page();
        assert_eq!(
            doc.lookup("h1.title", None, FieldType::String).unwrap(),
            Some(json!("Weekly deals"))
        );
        assert_eq!(
            doc.lookup("#products li a", Some("href"), FieldType::String).unwrap(),
            Some(json!("/p/1"))
        );
        assert_eq!(doc.lookup("table", None, FieldType::String).unwrap(), None);
        assert_eq!(doc.lookup("li", Some("missing"), FieldType::String).unwrap(), None);
    }

    #[test]
    fn test_html_items_are_fragments() {
        let items = page().items("#products li").unwrap();
        assert_eq!(items.len(), 3);

        let sku = items[1].lookup("", Some("data-sku"), FieldType::String).unwrap();
        assert_eq!(sku, Some(json!("b2")));
        let price = items[1].lookup("span.price", None, FieldType::Float).unwrap();
        assert_eq!(price, Some(json!("12.5")));
        let inner = items[2].lookup("a", None, FieldType::Html).unwrap();
        assert_eq!(inner, Some(json!("<b>Third</b>")));
    }

    #[test]
    fn test_html_narrow() {
        let list = page().narrow("#products").unwrap();
        assert_eq!(list.items("li").unwrap().len(), 3);
        let missing = page().narrow("table").unwrap();
        assert!(missing.items("li").unwrap().is_empty());
    }

    #[test]
    fn test_invalid_selector_is_configuration_error() {
        let err = page().lookup("li[[", None, FieldType::String).unwrap_err();
        assert!(matches!(err, CarveError::Configuration(_)));
    }

    #[test]
    fn test_text_regex() {
        let doc = Document::parse(DocumentKind::Text, b"order=17\norder=18\ntotal: 35 EUR").unwrap();
        assert_eq!(doc.lookup(r"total: (\d+)", None, FieldType::Int).unwrap(), Some(json!("35")));
        assert_eq!(doc.lookup(r"\d+ EUR", None, FieldType::String).unwrap(), Some(json!("35 EUR")));
        assert_eq!(doc.lookup(r"missing (\d+)", None, FieldType::Int).unwrap(), None);

        let orders: Vec<_> = doc
            .items(r"order=(\d+)")
            .unwrap()
            .into_iter()
            .map(|d| d.to_node())
            .collect();
        assert_eq!(orders, vec![JsonNode::string("17"), JsonNode::string("18")]);
    }

    #[test]
    fn test_blank_text_path_is_whole_text() {
        let doc = Document::parse(DocumentKind::Text, b"a (b\nc").unwrap();
        for blank in ["", "  ", "\t"] {
            assert_eq!(
                doc.lookup(blank, None, FieldType::String).unwrap(),
                Some(json!("a (b\nc")),
                "{blank:?}"
            );
            assert_eq!(doc.items(blank).unwrap().len(), 2, "{blank:?}");
            assert_eq!(doc.narrow(blank).unwrap().to_node(), JsonNode::string("a (b\nc"));
        }
    }

    #[test]
    fn test_xml_conversion() {
        let xml = br#"<?xml version="1.0"?>
            <rss version="2.0">
              <channel>
                <title>Feed &amp; news</title>
                <item id="1"><title>One</title></item>
                <item id="2"><title><![CDATA[Two <b>]]></title></item>
                <enclosure url="x.mp3"/>
                <note lang="en">hi</note>
              </channel>
            </rss>"#;
        let doc = Document::parse(DocumentKind::Xml, xml).unwrap();
        let Document::Json(value) = &doc else {
            panic!("xml converts to a structured document");
        };
        assert_eq!(value["rss"]["@version"], json!("2.0"));
        assert_eq!(value["rss"]["channel"]["title"], json!("Feed & news"));
        assert_eq!(value["rss"]["channel"]["item"][1]["title"], json!("Two <b>"));
        assert_eq!(value["rss"]["channel"]["enclosure"], json!({"@url": "x.mp3"}));
        assert_eq!(value["rss"]["channel"]["note"], json!({"@lang": "en", "#text": "hi"}));

        assert_eq!(doc.items("rss.channel.item").unwrap().len(), 2);
        assert_eq!(
            doc.lookup("rss.channel.item.0.@id", None, FieldType::Int).unwrap(),
            Some(json!("1"))
        );
    }

    #[test]
    fn test_malformed_xml() {
        let err = Document::parse(DocumentKind::Xml, b"<a><b></a>").unwrap_err();
        assert!(matches!(err, CarveError::Parse(_)));
    }

    #[test]
    fn test_coerce() {
        assert_eq!(coerce(json!("42"), FieldType::Int), Some(JsonNode::int(42)));
        assert_eq!(coerce(json!(" 4.9 "), FieldType::Int), Some(JsonNode::int(4)));
        assert_eq!(coerce(json!("abc"), FieldType::Int), None);
        assert_eq!(coerce(json!("2.5"), FieldType::Float), JsonNode::float(2.5));
        assert_eq!(coerce(json!("TRUE"), FieldType::Bool), Some(JsonNode::Bool(true)));
        assert_eq!(coerce(json!("maybe"), FieldType::Bool), None);
        assert_eq!(coerce(json!(7), FieldType::String), Some(JsonNode::string("7")));
        assert_eq!(coerce(json!("x"), FieldType::Null), Some(JsonNode::Null));
        assert_eq!(
            coerce(json!("{\"a\": [1]}"), FieldType::Raw),
            Some(JsonNode::from(json!({"a": [1]})))
        );
        assert_eq!(coerce(json!("plain"), FieldType::Raw), Some(JsonNode::string("plain")));
    }
}
