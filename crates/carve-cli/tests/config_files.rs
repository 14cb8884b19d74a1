//! Config files on disk through load, validate and run.

use std::io::Write;

use serde_json::json;

use carve_cli::config::{load_config, resolve_config_path, CONFIG_ENV};
use carve_cli::runner::{build_carver, render, run_items, select_items, validate};

// ─────────────────────── helpers ───────────────────────

/// Write `contents` to `name` inside a fresh temp dir.
fn write_config(name: &str, contents: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    (dir, path)
}

const CATALOG_YAML: &str = r#"
limits:
  http_workers: 4
  browser_instances: 1
references:
  - name: Currency
    connector:
      source: {kind: static, value: '{"code": "EUR"}'}
    model: {kind: scalar, path: code}
items:
  - name: catalog
    input: {shop: north}
    connector:
      source:
        kind: static
        value: '{"products": [{"sku": "a1", "price": "3.5", "stock": 0}, {"sku": "b2", "price": "7", "stock": 4}]}'
    model:
      kind: array
      path: products
      item:
        kind: object
        condition: value.stock > 0
        fields:
          sku: {kind: scalar, path: sku}
          price: {kind: scalar, path: price, type: float}
          stock: {kind: scalar, path: stock, type: int}
          currency:
            kind: scalar
            generated: {kind: formatted, template: '{{{RefName=Currency}}}'}
          shop:
            kind: scalar
            generated: {kind: formatted, template: '{{{FromInput=shop}}}'}
  - name: title
    connector:
      response_type: html
      source: {kind: static, value: '<html><head><title> Catalog </title></head></html>'}
    model: {kind: scalar, path: title}
"#;

// ─────────────────────── tests ───────────────────────

#[test]
fn test_yaml_and_json_load_the_same_config() {
    let (_yaml_dir, yaml_path) = write_config("carve.yaml", CATALOG_YAML);
    let from_yaml = load_config(&yaml_path).unwrap();

    let as_json = serde_json::to_string(&from_yaml).unwrap();
    let (_json_dir, json_path) = write_config("carve.json", &as_json);
    let from_json = load_config(&json_path).unwrap();

    assert_eq!(from_yaml.items.len(), 2);
    assert_eq!(from_json.items.len(), 2);
    assert_eq!(from_json.references[0].name, "Currency");
    assert_eq!(from_json.governor_config().http_workers, 4);
    assert_eq!(from_json.governor_config().browser_instances, Some(1));
}

#[test]
fn test_unknown_extension_rejected() {
    let (_dir, path) = write_config("carve.toml", "items = []");
    let err = load_config(&path).unwrap_err();
    assert!(err.to_string().contains("unsupported config extension"), "{err}");
}

#[test]
fn test_missing_file_reports_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.yaml");
    let err = load_config(&path).unwrap_err();
    assert!(err.to_string().contains("absent.yaml"), "{err}");
}

#[test]
fn test_malformed_yaml_rejected() {
    let (_dir, path) = write_config("bad.yml", "items: [name: x, connector: ");
    assert!(load_config(&path).is_err());
}

#[test]
fn test_env_var_then_default_path() {
    std::env::set_var(CONFIG_ENV, "/etc/carve/jobs.yaml");
    assert_eq!(
        resolve_config_path(None),
        std::path::PathBuf::from("/etc/carve/jobs.yaml")
    );
    std::env::remove_var(CONFIG_ENV);
    assert_eq!(resolve_config_path(None), std::path::PathBuf::from("carve.yaml"));
}

#[test]
fn test_validate_catalog() {
    let (_dir, path) = write_config("carve.yaml", CATALOG_YAML);
    let report = validate(&load_config(&path).unwrap());
    assert!(report.is_valid(), "{:?}", report.problems);
    assert_eq!(report.items, 2);
    assert_eq!(report.references, 1);
    assert_eq!(report.expressions, 1);
}

#[tokio::test]
async fn test_run_catalog_end_to_end() {
    let (_dir, path) = write_config("carve.yaml", CATALOG_YAML);
    let config = load_config(&path).unwrap();
    let carver = build_carver(&config).unwrap();

    let outcomes = run_items(&carver, &select_items(&config, &[]).unwrap()).await;
    assert!(outcomes.iter().all(|o| o.result.is_ok()));
    assert_eq!(
        render(&outcomes),
        json!({
            "catalog": [{"sku": "b2", "price": 7.0, "stock": 4, "currency": "EUR", "shop": "north"}],
            "title": "Catalog"
        })
    );
}

#[tokio::test]
async fn test_run_selected_item_only() {
    let (_dir, path) = write_config("carve.yaml", CATALOG_YAML);
    let config = load_config(&path).unwrap();
    let carver = build_carver(&config).unwrap();

    let selected = select_items(&config, &["title".to_string()]).unwrap();
    let outcomes = run_items(&carver, &selected).await;
    assert_eq!(render(&outcomes), json!({"title": "Catalog"}));
}
