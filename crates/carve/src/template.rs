//! Placeholder substitution for every dynamic configuration string.
//!
//! | Token | Substitutes |
//! |---|---|
//! | `{{{RefName=NAME}}}`, `{{{RefName=NAME a.b}}}` | a resolved reference, optionally a sub-path of it |
//! | `{{{FromEnv=VAR}}}` | an environment variable |
//! | `{{{FromInput=a.b}}}` | a sub-path of the root input |
//! | `{{{a.b}}}` | a sub-path of the current scope node |
//! | `{INDEX}` | the current iteration index |
//! | `{PL}` | the whole current scope node |
//! | `{INPUT}` | the whole root input |
//!
//! Formatting never fails. Anything that cannot be resolved becomes the empty
//! string. The pass is single and left-to-right: substituted text is never
//! scanned again.

use crate::node::JsonNode;
use crate::references::ReferenceRegistry;
use std::collections::HashMap;
use std::sync::Arc;

const OPEN: &str = "{{{";
const CLOSE: &str = "}}}";
const INDEX_TOKEN: &str = "{INDEX}";
const WHOLE_TOKEN: &str = "{PL}";
const INPUT_TOKEN: &str = "{INPUT}";

/// What a template is evaluated against.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    /// The node templates and expressions see as "current".
    pub current: JsonNode,
    /// Ordinal position inside the enclosing array, if any.
    pub index: Option<u32>,
    /// The input the top-level extraction was started with.
    pub input: Arc<JsonNode>,
}

impl Scope {
    /// Top-level scope: the input is also the current node.
    pub fn root(input: JsonNode, index: Option<u32>) -> Self {
        let input = Arc::new(input);
        Self {
            current: (*input).clone(),
            index,
            input,
        }
    }

    /// Same index and input, different current node.
    pub fn with_current(&self, current: JsonNode) -> Self {
        Self {
            current,
            index: self.index,
            input: Arc::clone(&self.input),
        }
    }

    /// Scope for one element of an array.
    pub fn with_item(&self, current: JsonNode, index: u32) -> Self {
        Self {
            current,
            index: Some(index),
            input: Arc::clone(&self.input),
        }
    }
}

/// A substitutable token.
#[derive(Debug, Clone, PartialEq)]
pub enum Placeholder {
    Reference { name: String, path: String },
    Env(String),
    Input(String),
    Field(String),
    Index,
    Whole,
    WholeInput,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment<'a> {
    Text(&'a str),
    Token(Placeholder),
}

/// Split a template into literal text and placeholders.
fn parse(template: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut literal_start = 0;
    let mut i = 0;

    while i < template.len() {
        let rest = &template[i..];

        let matched = if rest.starts_with(OPEN) {
            rest[OPEN.len()..].find(CLOSE).map(|end| {
                let body = &rest[OPEN.len()..OPEN.len() + end];
                (parse_directive(body), OPEN.len() + end + CLOSE.len())
            })
        } else if rest.starts_with(INDEX_TOKEN) {
            Some((Placeholder::Index, INDEX_TOKEN.len()))
        } else if rest.starts_with(WHOLE_TOKEN) {
            Some((Placeholder::Whole, WHOLE_TOKEN.len()))
        } else if rest.starts_with(INPUT_TOKEN) {
            Some((Placeholder::WholeInput, INPUT_TOKEN.len()))
        } else {
            None
        };

        match matched {
            Some((placeholder, consumed)) => {
                if literal_start < i {
                    segments.push(Segment::Text(&template[literal_start..i]));
                }
                segments.push(Segment::Token(placeholder));
                i += consumed;
                literal_start = i;
            }
            None => {
                i += rest.chars().next().map(char::len_utf8).unwrap_or(1);
            }
        }
    }

    if literal_start < template.len() {
        segments.push(Segment::Text(&template[literal_start..]));
    }
    segments
}

fn parse_directive(body: &str) -> Placeholder {
    let body = body.trim();
    if let Some(rest) = body.strip_prefix("RefName=") {
        let rest = rest.trim();
        let (name, path) = match rest.split_once(char::is_whitespace) {
            Some((name, path)) => (name, path.trim()),
            None => (rest, ""),
        };
        return Placeholder::Reference {
            name: name.to_string(),
            path: path.to_string(),
        };
    }
    if let Some(var) = body.strip_prefix("FromEnv=") {
        return Placeholder::Env(var.trim().to_string());
    }
    if let Some(path) = body.strip_prefix("FromInput=") {
        return Placeholder::Input(path.trim().to_string());
    }
    Placeholder::Field(body.to_string())
}

/// Substitute every placeholder given already-resolved references.
///
/// A reference missing from `references` (or mapped to `None`) renders empty.
fn render(
    segments: &[Segment<'_>],
    scope: &Scope,
    references: &HashMap<String, Option<JsonNode>>,
) -> String {
    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Text(text) => out.push_str(text),
            Segment::Token(placeholder) => out.push_str(&render_placeholder(placeholder, scope, references)),
        }
    }
    out
}

fn render_placeholder(
    placeholder: &Placeholder,
    scope: &Scope,
    references: &HashMap<String, Option<JsonNode>>,
) -> String {
    let lookup = |node: Option<&JsonNode>| node.map(JsonNode::render).unwrap_or_default();
    match placeholder {
        Placeholder::Reference { name, path } => lookup(
            references
                .get(name)
                .and_then(Option::as_ref)
                .and_then(|node| node.get_path(path)),
        ),
        Placeholder::Env(var) => std::env::var(var).unwrap_or_default(),
        Placeholder::Input(path) => lookup(scope.input.get_path(path)),
        Placeholder::Field(path) => lookup(scope.current.get_path(path)),
        Placeholder::Index => scope.index.map(|i| i.to_string()).unwrap_or_default(),
        Placeholder::Whole => scope.current.render(),
        Placeholder::WholeInput => scope.input.render(),
    }
}

/// Expands templates, resolving references through the registry.
#[derive(Clone)]
pub struct TemplateEngine {
    references: Arc<ReferenceRegistry>,
}

impl TemplateEngine {
    pub fn new(references: Arc<ReferenceRegistry>) -> Self {
        Self { references }
    }

    pub fn references(&self) -> &Arc<ReferenceRegistry> {
        &self.references
    }

    /// Expand `template` against `scope`.
    pub async fn format(&self, template: &str, scope: &Scope) -> String {
        if !template.contains('{') {
            return template.to_string();
        }

        let segments = parse(template);
        let mut resolved: HashMap<String, Option<JsonNode>> = HashMap::new();
        for segment in &segments {
            if let Segment::Token(Placeholder::Reference { name, .. }) = segment {
                if resolved.contains_key(name) {
                    continue;
                }
                let node = match self.references.resolve(name).await {
                    Ok(node) => Some(node),
                    Err(e) => {
                        tracing::warn!(reference = %name, error = %e, "reference unavailable, substituting empty string");
                        None
                    }
                };
                resolved.insert(name.clone(), node);
            }
        }

        render(&segments, scope, &resolved)
    }

    /// Expand an optional template, keeping `None` as `None`.
    pub async fn format_opt(&self, template: Option<&str>, scope: &Scope) -> Option<String> {
        match template {
            Some(t) => Some(self.format(t, scope).await),
            None => None,
        }
    }
}
