//! Carve: configuration-driven extraction of typed JSON trees from HTTP
//! responses, rendered browser pages and static values.

pub mod config;
pub mod document;
pub mod engine;
pub mod expression;
pub mod extract;
pub mod fetch;
pub mod governor;
pub mod node;
pub mod references;
pub mod template;
pub mod types;

pub use config::*;
pub use document::Document;
pub use engine::Carver;
pub use expression::{compile, ExpressionEvaluator, Program};
pub use extract::{EvalContext, Extracted, Extractor};
pub use fetch::{RawDocument, SourceFetcher, DEFAULT_TIMEOUT};
pub use governor::{Governor, GovernorConfig};
pub use node::JsonNode;
pub use references::{ReferenceRegistry, ReferenceResolver};
pub use template::{Scope, TemplateEngine};
pub use types::*;
