//! Drives the `rill` binary end to end.

use std::io::Write;
use std::process::{Command, Output};
use tempfile::NamedTempFile;

fn rill(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_rill"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to spawn rill")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

// ────────────────────────────────────────────────────────────────────────────
// rill run
// ────────────────────────────────────────────────────────────────────────────

#[test]
fn test_run_outputs_view_text_tree() {
    let mut bundle = NamedTempFile::new().unwrap();
    write!(
        bundle,
        r#"
        __sendToHost([
          {{ op: "CREATE", id: 1, type: "View", props: {{}} }},
          {{ op: "CREATE", id: 2, type: "Text", props: {{ text: "hi" }} }},
          {{ op: "APPEND", id: 2, parentId: 1, childId: 2 }},
          {{ op: "APPEND", id: 1, parentId: 0, childId: 1 }},
        ]);
        "#
    )
    .unwrap();

    for backend in ["quickjs", "worker", "direct"] {
        let output = rill(&["run", bundle.path().to_str().unwrap(), "--backend", backend, "--compact"]);
        assert!(output.status.success(), "{}: {}", backend, String::from_utf8_lossy(&output.stderr));
        let tree: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
        assert_eq!(tree[0]["type"], "View");
        assert_eq!(tree[0]["children"][0]["props"]["text"], "hi");
    }
}

#[test]
fn test_run_missing_bundle_fails() {
    let output = rill(&["run", "/nonexistent/bundle.js"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("reading bundle"));
}

// ────────────────────────────────────────────────────────────────────────────
// rill eval
// ────────────────────────────────────────────────────────────────────────────

#[test]
fn test_eval_prints_value() {
    let output = rill(&["eval", "[1, 'two', undefined]"]);
    assert!(output.status.success());
    assert_eq!(stdout(&output), r#"[1,"two",{"__type":"undefined"}]"#);
}

#[test]
fn test_eval_syntax_error_exits_nonzero() {
    let output = rill(&["eval", "let = ;"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("SyntaxError"));
}
