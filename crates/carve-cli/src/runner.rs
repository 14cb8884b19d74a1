//! The `run` and `validate` commands.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::bail;
use carve::{compile, CarveError, Carver, Generated, JsonNode, ModelField, ModelSpec};
use indexmap::IndexMap;

use crate::config::{CliConfig, ItemConfig};

/// Result of one top-level item.
#[derive(Debug)]
pub struct ItemOutcome {
    pub name: String,
    pub result: Result<JsonNode, CarveError>,
}

/// Build the engine for `config` and register its references.
pub fn build_carver(config: &CliConfig) -> anyhow::Result<Arc<Carver>> {
    let carver = Arc::new(Carver::new(config.governor_config())?);
    carver.register_references(config.references.iter().cloned())?;
    Ok(carver)
}

/// Pick the items to run. An empty selection means all of them.
pub fn select_items<'a>(config: &'a CliConfig, only: &[String]) -> anyhow::Result<Vec<&'a ItemConfig>> {
    if only.is_empty() {
        return Ok(config.items.iter().collect());
    }
    only.iter()
        .map(|name| match config.item(name) {
            Some(item) => Ok(item),
            None => bail!("no item named '{name}' in config"),
        })
        .collect()
}

/// Run every item once, concurrently. Outcomes keep config order.
pub async fn run_items(carver: &Carver, items: &[&ItemConfig]) -> Vec<ItemOutcome> {
    let runs = items.iter().map(|item| async move {
        tracing::info!(item = %item.name, "extracting");
        let result = carver
            .extract(&item.field, JsonNode::from(item.input.clone()), item.index)
            .await;
        if let Err(e) = &result {
            tracing::error!(item = %item.name, error = %e, "extraction failed");
        }
        ItemOutcome {
            name: item.name.clone(),
            result,
        }
    });
    futures::future::join_all(runs).await
}

/// Successful trees keyed by item name.
pub fn render(outcomes: &[ItemOutcome]) -> serde_json::Value {
    let trees: IndexMap<&str, serde_json::Value> = outcomes
        .iter()
        .filter_map(|o| o.result.as_ref().ok().map(|tree| (o.name.as_str(), tree.raw())))
        .collect();
    serde_json::json!(trees)
}

/// What `validate` found.
#[derive(Debug, Default, PartialEq)]
pub struct ValidationReport {
    pub items: usize,
    pub references: usize,
    /// Expressions compiled as written.
    pub expressions: usize,
    /// Expressions containing placeholders; these only compile after formatting.
    pub templated: usize,
    pub problems: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Check names and expressions without fetching anything.
pub fn validate(config: &CliConfig) -> ValidationReport {
    let mut report = ValidationReport {
        items: config.items.len(),
        references: config.references.len(),
        ..ValidationReport::default()
    };

    let mut seen = HashSet::new();
    for reference in &config.references {
        if reference.name.trim().is_empty() {
            report.problems.push("reference with an empty name".to_string());
        } else if !seen.insert(reference.name.as_str()) {
            report.problems.push(format!("reference '{}' defined twice", reference.name));
        }
        check_field(&reference.field, &format!("reference {}", reference.name), &mut report);
    }

    let mut seen = HashSet::new();
    for item in &config.items {
        if !seen.insert(item.name.as_str()) {
            report.problems.push(format!("item '{}' defined twice", item.name));
        }
        check_field(&item.field, &format!("item {}", item.name), &mut report);
    }
    report
}

fn check_field(field: &ModelField, at: &str, report: &mut ValidationReport) {
    check_model(&field.model, at, report);
}

fn check_model(model: &ModelSpec, at: &str, report: &mut ValidationReport) {
    match model {
        ModelSpec::Scalar(scalar) => {
            check_expression(scalar.condition.as_deref(), at, report);
            match &scalar.generated {
                Some(Generated::Calculated { expression }) => {
                    check_expression(Some(expression), at, report)
                }
                Some(Generated::Fetch { field }) => check_field(field, &format!("{at} > fetch"), report),
                _ => {}
            }
        }
        ModelSpec::Object(object) => {
            check_expression(object.condition.as_deref(), at, report);
            for (name, child) in &object.fields {
                check_model(child, &format!("{at}.{name}"), report);
            }
        }
        ModelSpec::Array(array) => {
            check_expression(array.condition.as_deref(), at, report);
            check_model(&array.item, &format!("{at}[]"), report);
        }
        ModelSpec::FirstOf(first_of) => {
            for (i, candidate) in first_of.candidates.iter().enumerate() {
                check_model(candidate, &format!("{at}|{i}"), report);
            }
        }
    }
}

fn check_expression(source: Option<&str>, at: &str, report: &mut ValidationReport) {
    let Some(source) = source else {
        return;
    };
    if source.contains('{') {
        report.templated += 1;
        return;
    }
    report.expressions += 1;
    if let Err(e) = compile(source) {
        report.problems.push(format!("{at}: {e}"));
    }
}
