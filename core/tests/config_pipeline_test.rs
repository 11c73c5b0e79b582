//! Configuration pipeline tests
//!
//! The full load path (includes + interpolation + parse + validate) and
//! snapshot materialization.

use scry_core::app::AppSnapshot;
use scry_core::config::{self, Loaded};
use serial_test::serial;
use std::fs;
use std::time::Duration;
use tempfile::tempdir;

fn loaded_from(yaml: &str) -> Loaded {
    Loaded {
        document: config::parse_document(yaml).unwrap(),
        contents: yaml.to_string(),
        watch_paths: Vec::new(),
    }
}

#[test]
#[serial]
fn load_runs_the_full_pipeline() {
    let dir = tempdir().unwrap();
    std::env::set_var("SCRY_PIPELINE_PORT", "9090");

    fs::write(
        dir.path().join("scry.yml"),
        "server:\n  port: ${SCRY_PIPELINE_PORT}\npages:\n  !include: pages.yml\n",
    )
    .unwrap();
    fs::write(
        dir.path().join("pages.yml"),
        "- name: Dash\n  columns:\n    - size: full\n      widgets:\n        - type: html\n          source: '<p>hi</p>'\n",
    )
    .unwrap();

    let loaded = config::load(&dir.path().join("scry.yml")).unwrap();
    std::env::remove_var("SCRY_PIPELINE_PORT");

    assert_eq!(loaded.document.server.port, 9090);
    assert_eq!(loaded.document.pages.len(), 1);
    assert_eq!(loaded.watch_paths.len(), 2, "root and include are watched");
}

#[test]
fn materialize_builds_pages_slugs_and_widget_index() {
    let loaded = loaded_from(
        "
pages:
  - name: Overview
    columns:
      - size: small
        widgets:
          - type: html
            source: '<p>left</p>'
      - size: full
        widgets:
          - type: html
            source: '<p>right</p>'
          - type: probe
            url: http://127.0.0.1:9/
  - name: Second Page
    columns:
      - size: full
",
    );

    let snapshot = AppSnapshot::materialize(&loaded).unwrap();

    assert_eq!(snapshot.pages.len(), 2);
    assert!(snapshot.slugs.contains_key("overview"));
    assert!(snapshot.slugs.contains_key("second-page"));
    assert_eq!(snapshot.widgets.len(), 3);
    assert_eq!(snapshot.content_hash.len(), 10);
    assert!(snapshot.auth.is_none());

    let overview = &snapshot.slugs["overview"];
    assert_eq!(overview.columns.len(), 2);
    assert_eq!(overview.widgets().len(), 3);

    let ids: Vec<u64> = snapshot.widgets.keys().copied().collect();
    let mut deduped = ids.clone();
    deduped.sort_unstable();
    deduped.dedup();
    assert_eq!(ids.len(), deduped.len(), "widget ids are unique");
}

#[test]
fn materialize_rejects_bad_widget_options() {
    let loaded = loaded_from(
        "
pages:
  - name: Dash
    columns:
      - size: full
        widgets:
          - type: probe
            url: 'not a url'
",
    );
    assert!(AppSnapshot::materialize(&loaded).is_err());
}

#[test]
fn widget_node_splits_common_keys_from_options() {
    let value: serde_yaml::Value = serde_yaml::from_str(
        "type: probe\ntitle: My Probe\ncache: 5m\nurl: http://example.com/\n",
    )
    .unwrap();

    let node = config::widget_node(&value).unwrap();
    assert_eq!(node.kind, "probe");
    assert_eq!(node.title.as_deref(), Some("My Probe"));
    assert_eq!(node.cache, Some(Duration::from_secs(300)));

    let options = node.options.as_mapping().unwrap();
    assert!(options.contains_key(&serde_yaml::Value::String("url".into())));
    assert!(!options.contains_key(&serde_yaml::Value::String("title".into())));
}

#[test]
fn content_hash_tracks_document_changes() {
    let a = AppSnapshot::materialize(&loaded_from(
        "pages:\n  - name: A\n    columns:\n      - size: full\n",
    ))
    .unwrap();
    let b = AppSnapshot::materialize(&loaded_from(
        "pages:\n  - name: B\n    columns:\n      - size: full\n",
    ))
    .unwrap();
    assert_ne!(a.content_hash, b.content_hash);
}

#[test]
fn invalid_documents_are_rejected_before_materialization() {
    assert!(config::parse_document("pages: []").is_err());
    assert!(config::parse_document("nonsense: true").is_err());
    assert!(config::parse_document(
        "pages:\n  - name: Static\n    slug: static\n    columns:\n      - size: full\n"
    )
    .is_err());
}
