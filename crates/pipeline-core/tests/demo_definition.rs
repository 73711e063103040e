//! The bundled serverless demo must stay loadable.

use std::path::PathBuf;

use pipeline_core::definition;

fn demo() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../demos/serverless/pipeline.toml")
}

#[test]
fn demo_pipeline_loads() {
    let graph = definition::load(demo()).unwrap();
    assert_eq!(graph.name(), Some("hello-function"));

    let order: Vec<&str> = graph
        .resolve_order("test")
        .unwrap()
        .iter()
        .map(|s| s.id.as_str())
        .collect();
    assert_eq!(order, vec!["lock", "build", "package", "deploy", "test"]);

    let clean: Vec<&str> = graph
        .resolve_order("clean")
        .unwrap()
        .iter()
        .map(|s| s.id.as_str())
        .collect();
    assert_eq!(clean, vec!["clean"]);
}
