//! Shared setup for integration tests: brokers wired to the stub language
//! server.
#![allow(dead_code)]

use std::sync::Arc;

use lsmcp::{Broker, BrokerConfig};

pub fn stub_command(extra: &[&str]) -> Vec<String> {
    let mut command = vec![env!("CARGO_BIN_EXE_stub-lsp").to_string()];
    command.extend(extra.iter().map(|s| s.to_string()));
    command
}

/// A broker whose every server spawn runs the stub.
pub fn stub_broker() -> Arc<Broker> {
    stub_broker_with(&[])
}

pub fn stub_broker_with(extra: &[&str]) -> Arc<Broker> {
    Broker::new(BrokerConfig {
        language: None,
        force_language: None,
        server_command: Some(stub_command(extra)),
    })
}

/// A broker whose server command cannot spawn; anything needing LSP fails.
pub fn broken_broker() -> Arc<Broker> {
    Broker::new(BrokerConfig {
        language: None,
        force_language: None,
        server_command: Some(vec!["/nonexistent/lsmcp-no-such-server".to_string()]),
    })
}
