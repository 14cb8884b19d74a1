//! Small expression language for conditions and calculated values.
//!
//! The source is template-expanded first, then compiled and run against an
//! environment with three bindings: `value` (the current node), `index` (the
//! iteration ordinal or null) and `input` (the root input).

pub mod eval;
pub mod parser;

pub use eval::Env;
pub use parser::{Builtin, Expr};

use crate::template::{Scope, TemplateEngine};
use crate::types::{CarveError, CarveResult};
use serde_json::Value;

/// A compiled expression, reusable across environments.
#[derive(Debug, Clone)]
pub struct Program {
    source: String,
    expr: Expr,
}

impl Program {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn run(&self, env: &Env) -> CarveResult<Value> {
        eval::eval(&self.expr, env)
    }
}

/// Compile `source`. Malformed input is a [`CarveError::Compilation`].
pub fn compile(source: &str) -> CarveResult<Program> {
    Ok(Program {
        source: source.to_string(),
        expr: parser::parse(source)?,
    })
}

/// Template-expanding front end over [`compile`] and [`Program::run`].
#[derive(Clone)]
pub struct ExpressionEvaluator {
    templates: TemplateEngine,
}

impl ExpressionEvaluator {
    pub fn new(templates: TemplateEngine) -> Self {
        Self { templates }
    }

    /// Bindings an expression sees for `scope`.
    pub fn environment(scope: &Scope) -> Env {
        Env::from([
            ("value".to_string(), scope.current.raw()),
            (
                "index".to_string(),
                scope.index.map(Value::from).unwrap_or(Value::Null),
            ),
            ("input".to_string(), scope.input.raw()),
        ])
    }

    pub async fn evaluate(&self, source: &str, scope: &Scope) -> CarveResult<Value> {
        let expanded = self.templates.format(source, scope).await;
        let program = compile(&expanded)?;
        program.run(&Self::environment(scope))
    }

    /// Evaluate a condition. A non-boolean result is an evaluation error.
    pub async fn evaluate_bool(&self, source: &str, scope: &Scope) -> CarveResult<bool> {
        match self.evaluate(source, scope).await? {
            Value::Bool(b) => Ok(b),
            other => Err(CarveError::Evaluation(format!(
                "condition '{source}' produced {other}, expected a bool"
            ))),
        }
    }
}
