//! End-to-end tool scenarios against the stub language server.

mod common;

use indoc::indoc;
use lsmcp::BrokerError;
use lsmcp::tools;
use serde_json::json;
use test_utils::TestProject;

const A_TS: &str = "export function greet(n: string){ return 'h'+n }";
const B_TS: &str = "import {greet} from './a'; greet('w')";

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rename_updates_every_occurrence_across_files() {
    let project = TestProject::new(&[("a.ts", A_TS), ("b.ts", B_TS)]).unwrap();
    let broker = common::stub_broker();

    let text = tools::dispatch(
        &broker,
        "rename_symbol",
        json!({
            "root": project.root(),
            "filePath": "a.ts",
            "line": 1,
            "target": "greet",
            "newName": "hello",
        }),
    )
    .await
    .unwrap();

    assert!(text.contains("a.ts"), "response names a.ts: {text}");
    assert!(text.contains("b.ts"), "response names b.ts: {text}");
    assert!(text.contains("\"greet\" → \"hello\""));

    assert_eq!(
        project.read("a.ts").unwrap(),
        "export function hello(n: string){ return 'h'+n }"
    );
    assert_eq!(
        project.read("b.ts").unwrap(),
        "import {hello} from './a'; hello('w')"
    );
    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rename_unsupported_leaves_files_untouched() {
    let project = TestProject::new(&[("a.ts", A_TS), ("b.ts", B_TS)]).unwrap();
    let broker = common::stub_broker_with(&["--no-rename"]);

    let error = tools::dispatch(
        &broker,
        "rename_symbol",
        json!({
            "root": project.root(),
            "filePath": "a.ts",
            "line": 1,
            "target": "greet",
            "newName": "hello",
        }),
    )
    .await
    .unwrap_err();

    match &error {
        BrokerError::Unsupported(message) => {
            assert!(
                message.contains("doesn't support rename"),
                "message was: {message}"
            );
        }
        other => panic!("expected Unsupported, got {other:?}"),
    }
    assert_eq!(project.read("a.ts").unwrap(), A_TS);
    assert_eq!(project.read("b.ts").unwrap(), B_TS);
    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rename_method_not_found_maps_to_unsupported() {
    let project = TestProject::new(&[("a.ts", A_TS)]).unwrap();
    // the server claims rename support, then answers -32601
    let broker = common::stub_broker_with(&["--rename-unhandled"]);

    let error = tools::dispatch(
        &broker,
        "rename_symbol",
        json!({
            "root": project.root(),
            "filePath": "a.ts",
            "line": 1,
            "target": "greet",
            "newName": "hello",
        }),
    )
    .await
    .unwrap_err();

    assert!(matches!(&error, BrokerError::Unsupported(m) if m.contains("doesn't support rename")));
    assert_eq!(project.read("a.ts").unwrap(), A_TS);
    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn references_render_with_context_lines() {
    let project = TestProject::new(&[
        (
            "a.ts",
            "export function greet(n: string) {\n  return 'h' + n;\n}\n",
        ),
        ("b.ts", "import {greet} from './a';\ngreet('w');\ngreet('x');\n"),
    ])
    .unwrap();
    let broker = common::stub_broker();

    let text = tools::dispatch(
        &broker,
        "find_references",
        json!({
            "root": project.root(),
            "filePath": "a.ts",
            "line": "function greet",
            "symbolName": "greet",
        }),
    )
    .await
    .unwrap();

    assert!(text.contains("Found 4 references to 'greet'"), "{text}");
    // one-based path:line:col, relative to root
    assert!(text.contains("a.ts:1:17"), "{text}");
    assert!(text.contains("b.ts:2:1"), "{text}");
    // the b.ts:2 block carries the line itself plus both neighbors
    assert!(text.contains("> 2 | greet('w');"), "{text}");
    assert!(text.contains("  1 | import {greet} from './a';"), "{text}");
    assert!(text.contains("  3 | greet('x');"), "{text}");
    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hover_shows_the_declaration() {
    let project = TestProject::new(&[(
        "a.ts",
        "export function greet(n: string) {\n  return 'h' + n;\n}\n",
    )])
    .unwrap();
    let broker = common::stub_broker();

    let text = tools::dispatch(
        &broker,
        "get_hover",
        json!({
            "root": project.root(),
            "filePath": "a.ts",
            "line": 1,
            "target": "greet",
        }),
    )
    .await
    .unwrap();

    assert!(text.contains("a.ts:1:17"), "{text}");
    assert!(text.contains("export function greet"), "{text}");
    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn document_symbols_render_as_a_tagged_tree() {
    let project = TestProject::new(&[(
        "a.ts",
        "export function greet(n: string) {\n  return n;\n}\nclass Greeter {\n}\n",
    )])
    .unwrap();
    let broker = common::stub_broker();

    let text = tools::dispatch(
        &broker,
        "get_document_symbols",
        json!({ "root": project.root(), "filePath": "a.ts" }),
    )
    .await
    .unwrap();

    assert!(text.contains("greet [Function]"), "{text}");
    assert!(text.contains("Greeter [Class]"), "{text}");
    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn signature_help_marks_the_active_parameter() {
    let project = TestProject::new(&[(
        "a.ts",
        "function add(a: number, b: number) { return a + b }\nadd(1, 2);\n",
    )])
    .unwrap();
    let broker = common::stub_broker();

    let text = tools::dispatch(
        &broker,
        "get_signature_help",
        json!({
            "root": project.root(),
            "filePath": "a.ts",
            "line": 2,
            "character": 8,
        }),
    )
    .await
    .unwrap();

    assert!(text.contains("→ add(a: number, b: number)"), "{text}");
    // cursor sits after the comma: second parameter is active
    assert!(text.contains("→ b: number"), "{text}");
    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn line_not_found_and_symbol_not_found_errors() {
    let project = TestProject::new(&[("a.ts", A_TS)]).unwrap();
    let broker = common::stub_broker();

    let missing_line = tools::dispatch(
        &broker,
        "find_references",
        json!({
            "root": project.root(),
            "filePath": "a.ts",
            "line": "no such text",
            "symbolName": "greet",
        }),
    )
    .await
    .unwrap_err();
    assert!(matches!(missing_line, BrokerError::LineNotFound { .. }));

    let missing_symbol = tools::dispatch(
        &broker,
        "find_references",
        json!({
            "root": project.root(),
            "filePath": "a.ts",
            "line": 1,
            "symbolName": "absent",
        }),
    )
    .await
    .unwrap_err();
    assert!(matches!(
        missing_symbol,
        BrokerError::SymbolNotFoundOnLine { line: 1, .. }
    ));

    let missing_file = tools::dispatch(
        &broker,
        "get_hover",
        json!({
            "root": project.root(),
            "filePath": "missing.ts",
            "line": 1,
        }),
    )
    .await
    .unwrap_err();
    assert!(matches!(missing_file, BrokerError::FileNotFound(_)));
    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delete_symbol_removes_definition_and_references() {
    let a_ts = indoc! {"
        export function greet(n: string) {
          return n;
        }
        export function keep() {}
    "};
    let project = TestProject::new(&[
        ("a.ts", a_ts),
        ("b.ts", "import {greet, keep} from './a';\ngreet('w');\n"),
    ])
    .unwrap();
    let broker = common::stub_broker();

    let text = tools::dispatch(
        &broker,
        "delete_symbol",
        json!({
            "root": project.root(),
            "filePath": "a.ts",
            "line": 1,
            "symbolName": "greet",
            "removeReferences": true,
        }),
    )
    .await
    .unwrap();

    assert!(text.contains("Deleted 'greet'"), "{text}");
    let a = project.read("a.ts").unwrap();
    assert!(!a.contains("function greet"), "definition gone: {a}");
    assert!(a.contains("function keep"), "unrelated symbol kept: {a}");
    let b = project.read("b.ts").unwrap();
    assert!(!b.contains("greet"), "references gone: {b}");
    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn format_document_previews_without_writing() {
    let original = "function x() {   \n  return 1;\n}\n";
    let project = TestProject::new(&[("a.ts", original)]).unwrap();
    let broker = common::stub_broker();

    let text = tools::dispatch(
        &broker,
        "format_document",
        json!({ "root": project.root(), "filePath": "a.ts" }),
    )
    .await
    .unwrap();

    assert!(text.contains("1 formatting change"), "{text}");
    // preview only: the file itself is untouched
    assert_eq!(project.read("a.ts").unwrap(), original);
    broker.shutdown().await;
}
