//! Recursive extraction of a [`JsonNode`] tree from a parsed document.
//!
//! Every call takes the evaluation context explicitly and returns an
//! [`Extracted`] outcome. A branch whose condition is false comes back as
//! [`Extracted::Excluded`]: arrays drop it, objects and the top level turn it
//! into Null.

use crate::config::{ArraySpec, FirstOfSpec, Generated, ModelField, ModelSpec, ObjectSpec, ScalarSpec};
use crate::document::{coerce, Document};
use crate::expression::ExpressionEvaluator;
use crate::fetch::SourceFetcher;
use crate::node::JsonNode;
use crate::template::{Scope, TemplateEngine};
use crate::types::{CarveError, CarveResult};
use futures::future::{self, BoxFuture, FutureExt};
use indexmap::IndexMap;
use serde_json::Value;
use std::borrow::Cow;

/// The context threaded through extraction: current node, index, root input.
pub type EvalContext = Scope;

/// Outcome of evaluating one spec.
#[derive(Debug, Clone, PartialEq)]
pub enum Extracted {
    Value(JsonNode),
    /// Filtered out by its condition.
    Excluded,
}

impl Extracted {
    pub fn into_node(self) -> JsonNode {
        match self {
            Extracted::Value(node) => node,
            Extracted::Excluded => JsonNode::Null,
        }
    }
}

/// Maps model specs over documents. Stateless apart from shared handles.
#[derive(Clone)]
pub struct Extractor {
    templates: TemplateEngine,
    expressions: ExpressionEvaluator,
    fetcher: SourceFetcher,
}

impl Extractor {
    pub fn new(templates: TemplateEngine, fetcher: SourceFetcher) -> Self {
        Self {
            expressions: ExpressionEvaluator::new(templates.clone()),
            templates,
            fetcher,
        }
    }

    pub fn fetcher(&self) -> &SourceFetcher {
        &self.fetcher
    }

    /// Fetch the connector's document, parse it and extract the model.
    pub async fn run(&self, field: &ModelField, ctx: &EvalContext) -> CarveResult<JsonNode> {
        let raw = self.fetcher.fetch(&field.connector, ctx).await?;
        let document = raw.parse()?;
        self.extract(&field.model, &document, ctx).await
    }

    /// Extract `spec` from `document`. An excluded result is Null.
    pub async fn extract(&self, spec: &ModelSpec, document: &Document, ctx: &EvalContext) -> CarveResult<JsonNode> {
        Ok(self.evaluate(spec, document, ctx).await?.into_node())
    }

    pub fn evaluate<'a>(
        &'a self,
        spec: &'a ModelSpec,
        document: &'a Document,
        ctx: &'a EvalContext,
    ) -> BoxFuture<'a, CarveResult<Extracted>> {
        async move {
            match spec {
                ModelSpec::Scalar(scalar) => self.scalar(scalar, document, ctx).await,
                ModelSpec::Object(object) => self.object(object, document, ctx).await,
                ModelSpec::Array(array) => self.array(array, document, ctx).await,
                ModelSpec::FirstOf(first) => self.first_of(first, document, ctx).await,
            }
        }
        .boxed()
    }

    async fn scalar(&self, spec: &ScalarSpec, document: &Document, ctx: &EvalContext) -> CarveResult<Extracted> {
        let path = self.templates.format(&spec.path, ctx).await;
        let raw = document.lookup(&path, spec.attribute.as_deref(), spec.field_type)?;

        let value = match &spec.generated {
            Some(generated) => {
                // Only an explicitly addressed value replaces the scope.
                let scope = match &raw {
                    Some(raw) if !path.trim().is_empty() => ctx.with_current(JsonNode::from(raw.clone())),
                    _ => ctx.clone(),
                };
                self.generated(generated, spec, &scope).await?
            }
            None => raw.and_then(|raw| coerce(raw, spec.field_type)),
        };

        let node = match value {
            Some(node) => node,
            None => match &spec.default {
                Some(default) => {
                    let text = self.templates.format(default, ctx).await;
                    coerce(Value::String(text), spec.field_type).unwrap_or_default()
                }
                None if spec.required => return Err(CarveError::MissingField(path)),
                None => JsonNode::Null,
            },
        };

        self.filter(spec.condition.as_deref(), node, ctx).await
    }

    /// Value of a generated scalar. `None` falls through to the default.
    async fn generated(&self, generated: &Generated, spec: &ScalarSpec, scope: &Scope) -> CarveResult<Option<JsonNode>> {
        let field_type = spec.field_type;
        match generated {
            Generated::Static { value } | Generated::Formatted { template: value } => {
                let text = self.templates.format(value, scope).await;
                Ok(coerce(Value::String(text), field_type))
            }
            Generated::Uuid => Ok(Some(JsonNode::string(uuid::Uuid::new_v4().to_string()))),
            Generated::Calculated { expression } => {
                let value = self.expressions.evaluate(expression, scope).await?;
                Ok(coerce(value, field_type))
            }
            Generated::Reference { name, path } => {
                match self.templates.references().resolve(name).await {
                    Ok(node) => Ok(node
                        .get_path(path)
                        .and_then(|n| coerce(n.raw(), field_type))),
                    Err(e) if spec.required => Err(e),
                    Err(e) => {
                        tracing::warn!(reference = %name, error = %e, "reference unavailable, using default");
                        Ok(None)
                    }
                }
            }
            Generated::Fetch { field } => match self.run(field, scope).await {
                Ok(node) => Ok(coerce(node.raw(), field_type)),
                Err(e) if spec.required => Err(e),
                Err(e) => {
                    tracing::warn!(url = %field.connector.url, error = %e, "nested fetch failed, using default");
                    Ok(None)
                }
            },
        }
    }

    async fn object(&self, spec: &ObjectSpec, document: &Document, ctx: &EvalContext) -> CarveResult<Extracted> {
        // A narrowed object is also the scope its children see.
        let (document, scope) = match &spec.path {
            Some(path) => {
                let path = self.templates.format(path, ctx).await;
                let narrowed = document.narrow(&path)?;
                let scope = ctx.with_current(narrowed.to_node());
                (Cow::Owned(narrowed), Cow::Owned(scope))
            }
            None => (Cow::Borrowed(document), Cow::Borrowed(ctx)),
        };

        let mut fields: IndexMap<String, JsonNode> = IndexMap::with_capacity(spec.fields.len());
        for (name, child) in &spec.fields {
            let child_ctx = with_siblings(&scope, &fields);
            let node = self.evaluate(child, &document, &child_ctx).await?.into_node();
            if spec.drop_empty && node.is_empty() {
                continue;
            }
            fields.insert(name.clone(), node);
        }

        self.filter(spec.condition.as_deref(), JsonNode::Object(fields), ctx)
            .await
    }

    async fn array(&self, spec: &ArraySpec, document: &Document, ctx: &EvalContext) -> CarveResult<Extracted> {
        let path = self.templates.format(&spec.path, ctx).await;
        let mut items = document.items(&path)?;
        if let Some(limit) = spec.limit {
            items.truncate(limit);
        }

        let evaluations = items.iter().enumerate().map(|(index, item)| {
            let item_ctx = ctx.with_item(item.to_node(), index as u32);
            async move { self.evaluate(&spec.item, item, &item_ctx).await }
        });
        // Results come back in source order regardless of completion order.
        let outcomes = future::try_join_all(evaluations).await?;

        let kept: Vec<JsonNode> = outcomes
            .into_iter()
            .filter_map(|outcome| match outcome {
                Extracted::Value(node) => Some(node),
                Extracted::Excluded => None,
            })
            .collect();
        tracing::debug!(path = %path, kept = kept.len(), "array extracted");

        self.filter(spec.condition.as_deref(), JsonNode::Array(kept), ctx)
            .await
    }

    async fn first_of(&self, spec: &FirstOfSpec, document: &Document, ctx: &EvalContext) -> CarveResult<Extracted> {
        for candidate in &spec.candidates {
            if let Extracted::Value(node) = self.evaluate(candidate, document, ctx).await? {
                if !node.is_empty() {
                    return Ok(Extracted::Value(node));
                }
            }
        }
        Ok(Extracted::Value(JsonNode::Null))
    }

    /// Apply an optional condition with `value` bound to `node`.
    ///
    /// A failing condition excludes the node just like a false one.
    async fn filter(&self, condition: Option<&str>, node: JsonNode, ctx: &EvalContext) -> CarveResult<Extracted> {
        let Some(condition) = condition else {
            return Ok(Extracted::Value(node));
        };
        let scope = ctx.with_current(node);
        match self.expressions.evaluate_bool(condition, &scope).await {
            Ok(true) => Ok(Extracted::Value(scope.current)),
            Ok(false) => Ok(Extracted::Excluded),
            Err(e) => {
                tracing::warn!(condition, error = %e, "condition failed, excluding value");
                Ok(Extracted::Excluded)
            }
        }
    }
}

/// Scope for the next object child: the parent node with earlier siblings laid over it.
fn with_siblings(ctx: &EvalContext, siblings: &IndexMap<String, JsonNode>) -> EvalContext {
    if siblings.is_empty() {
        return ctx.clone();
    }
    let current = match &ctx.current {
        JsonNode::Object(parent) => {
            let mut merged = parent.clone();
            merged.extend(siblings.iter().map(|(k, v)| (k.clone(), v.clone())));
            JsonNode::Object(merged)
        }
        _ => JsonNode::Object(siblings.clone()),
    };
    ctx.with_current(current)
}
