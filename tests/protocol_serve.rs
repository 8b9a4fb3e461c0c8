//! The stdio tool-protocol loop end to end: framed requests in, framed
//! responses out.

use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};

use lsmcp::lsp::framing::{FrameDecoder, encode_message};
use serde_json::{Value, json};
use test_utils::TestProject;

struct ServeSession {
    child: Child,
    decoder: FrameDecoder,
}

impl ServeSession {
    fn start() -> Self {
        let child = Command::new(env!("CARGO_BIN_EXE_lsmcp"))
            .arg("--bin")
            .arg(env!("CARGO_BIN_EXE_stub-lsp"))
            .arg("--log-level")
            .arg("error")
            .arg("serve")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to start lsmcp serve");
        Self {
            child,
            decoder: FrameDecoder::new(),
        }
    }

    fn send(&mut self, message: Value) {
        let stdin = self.child.stdin.as_mut().unwrap();
        stdin.write_all(&encode_message(&message)).unwrap();
        stdin.flush().unwrap();
    }

    fn next_response(&mut self) -> Value {
        let stdout = self.child.stdout.as_mut().unwrap();
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(body) = self.decoder.next_frame().unwrap() {
                return serde_json::from_slice(&body).unwrap();
            }
            let n = stdout.read(&mut chunk).unwrap();
            assert!(n > 0, "serve loop closed stdout");
            self.decoder.push(&chunk[..n]);
        }
    }
}

impl Drop for ServeSession {
    fn drop(&mut self) {
        drop(self.child.stdin.take());
        let _ = self.child.wait();
    }
}

#[test]
fn initialize_lists_the_tool_registry() {
    let mut session = ServeSession::start();
    session.send(json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {} }));
    let response = session.next_response();
    assert_eq!(response["id"], 1);
    assert_eq!(response["result"]["serverInfo"]["name"], "lsmcp");
    let tools = response["result"]["tools"].as_array().unwrap();
    assert!(tools.iter().any(|t| t["name"] == "get_hover"));
    assert!(tools.iter().any(|t| t["name"] == "search_symbols"));
}

#[test]
fn unknown_tools_get_method_not_found() {
    let mut session = ServeSession::start();
    session.send(json!({ "jsonrpc": "2.0", "id": 7, "method": "move_file", "params": {} }));
    let response = session.next_response();
    assert_eq!(response["id"], 7);
    assert_eq!(response["error"]["code"], -32601);
}

#[test]
fn tool_requests_run_against_real_servers() {
    let project = TestProject::new(&[(
        "a.ts",
        "export function greet(n: string) {\n  return n;\n}\n",
    )])
    .unwrap();

    let mut session = ServeSession::start();
    session.send(json!({
        "jsonrpc": "2.0",
        "id": 2,
        "method": "get_document_symbols",
        "params": { "root": project.root(), "filePath": "a.ts" },
    }));
    let response = session.next_response();
    assert_eq!(response["id"], 2);
    let text = response["result"].as_str().unwrap();
    assert!(text.contains("greet [Function]"), "{text}");
}

#[test]
fn invalid_arguments_keep_their_taxonomy_code() {
    let mut session = ServeSession::start();
    session.send(json!({
        "jsonrpc": "2.0",
        "id": 3,
        "method": "get_hover",
        "params": { "root": "/tmp" },
    }));
    let response = session.next_response();
    assert_eq!(response["id"], 3);
    // InvalidArgument maps to -32000 and the message names the tool
    assert_eq!(response["error"]["code"], -32000);
    let message = response["error"]["message"].as_str().unwrap();
    assert!(message.contains("get_hover"), "{message}");
}
