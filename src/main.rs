use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use lsmcp::broker::Broker;
use lsmcp::config::BrokerConfig;
use lsmcp::logging::init_logger;
use lsmcp::lsp::framing::{FrameDecoder, encode_message};
use lsmcp::tools;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Language server broker",
    long_about = "Accepts framed JSON-RPC tool requests on stdio and answers them by \
                  driving language servers as child processes."
)]
struct Cli {
    #[arg(
        long,
        help = "Set the logging level",
        value_parser = ["error", "warn", "info", "debug", "trace"]
    )]
    log_level: Option<String>,

    #[arg(long, help = "Disable ANSI color output")]
    no_color: bool,

    #[arg(long, help = "Also write logs to this file")]
    log_file: Option<PathBuf>,

    #[arg(long, help = "Explicit language id (wins over detection)")]
    language: Option<String>,

    #[arg(
        long,
        help = "Override the language server command line, e.g. \"typescript-language-server --stdio\""
    )]
    bin: Option<String>,

    #[arg(
        long,
        env = "LSMCP_FORCE_LANGUAGE",
        hide = true,
        help = "Language override from the environment"
    )]
    force_language: Option<String>,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Serve the tool protocol on stdio (the default)
    Serve,
    /// Run diagnostics over files matching a glob; exit 1 if any file has
    /// errors
    Check {
        #[arg(long)]
        root: PathBuf,
        #[arg(long)]
        pattern: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _log_guard = match init_logger(
        cli.no_color,
        cli.log_level.as_deref(),
        cli.log_file.as_deref(),
    ) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("failed to initialize logging: {e}");
            return ExitCode::FAILURE;
        }
    };

    let config = BrokerConfig {
        language: cli.language,
        force_language: cli.force_language,
        server_command: None,
    }
    .with_server_command_line(cli.bin.as_deref());
    let broker = Broker::new(config);

    match cli.command.unwrap_or(CliCommand::Serve) {
        CliCommand::Serve => {
            info!(version = env!("CARGO_PKG_VERSION"), "serving tool protocol on stdio");
            let result = serve(broker.clone()).await;
            broker.shutdown().await;
            match result {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!(error = %e, "serve loop failed");
                    ExitCode::FAILURE
                }
            }
        }
        CliCommand::Check { root, pattern } => {
            let outcome = tools::diagnostics::check_project(&broker, &root, &pattern).await;
            broker.shutdown().await;
            match outcome {
                Ok((report, has_errors)) => {
                    print!("{report}");
                    if has_errors {
                        ExitCode::FAILURE
                    } else {
                        ExitCode::SUCCESS
                    }
                }
                Err(e) => {
                    eprintln!("check failed: {e}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

/// The stdio tool-protocol loop. Requests run concurrently; one writer task
/// keeps responses from interleaving.
async fn serve(broker: Arc<Broker>) -> anyhow::Result<()> {
    let mut stdin = tokio::io::stdin();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(bytes) = out_rx.recv().await {
            if stdout.write_all(&bytes).await.is_err() {
                return;
            }
            let _ = stdout.flush().await;
        }
    });

    let in_flight: Arc<DashMap<i64, tokio::task::JoinHandle<()>>> = Arc::new(DashMap::new());
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; 8192];

    loop {
        let n = stdin.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        decoder.push(&chunk[..n]);

        loop {
            let body = match decoder.next_frame() {
                Ok(Some(body)) => body,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "malformed tool-protocol frame");
                    continue;
                }
            };
            let message: Value = match serde_json::from_slice(&body) {
                Ok(value) => value,
                Err(e) => {
                    warn!(error = %e, "unparseable tool-protocol message");
                    continue;
                }
            };
            handle_message(&broker, &out_tx, &in_flight, message);
        }
    }

    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

fn handle_message(
    broker: &Arc<Broker>,
    out_tx: &mpsc::UnboundedSender<Vec<u8>>,
    in_flight: &Arc<DashMap<i64, tokio::task::JoinHandle<()>>>,
    message: Value,
) {
    let method = message
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let id = message.get("id").cloned();

    // notifications
    let Some(id) = id else {
        if method == "$/cancelRequest" {
            if let Some(cancel_id) = message
                .get("params")
                .and_then(|p| p.get("id"))
                .and_then(Value::as_i64)
            {
                if let Some((_, handle)) = in_flight.remove(&cancel_id) {
                    handle.abort();
                    debug!(id = cancel_id, "cancelled in-flight tool request");
                    let _ = out_tx.send(encode_message(&json!({
                        "jsonrpc": "2.0",
                        "id": cancel_id,
                        "error": { "code": -32800, "message": "request cancelled" },
                    })));
                }
            }
        }
        return;
    };

    // built-in introspection methods answer inline
    if method == "initialize" || method == "tools/list" {
        let tool_list: Vec<Value> = tools::TOOLS
            .iter()
            .map(|tool| json!({ "name": tool.name, "description": tool.summary }))
            .collect();
        let result = if method == "initialize" {
            json!({
                "serverInfo": { "name": "lsmcp", "version": env!("CARGO_PKG_VERSION") },
                "tools": tool_list,
            })
        } else {
            json!({ "tools": tool_list })
        };
        let _ = out_tx.send(encode_message(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": result,
        })));
        return;
    }

    if !tools::is_known_tool(&method) {
        let _ = out_tx.send(encode_message(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": -32601, "message": format!("unknown tool {method:?}") },
        })));
        return;
    }

    let arguments = message.get("params").cloned().unwrap_or(json!({}));
    let broker = broker.clone();
    let out_tx = out_tx.clone();
    let in_flight_map = in_flight.clone();
    let numeric_id = id.as_i64();

    let handle = tokio::spawn(async move {
        debug!(tool = %method, "dispatching");
        let response = match tools::dispatch(&broker, &method, arguments.clone()).await {
            Ok(text) => json!({ "jsonrpc": "2.0", "id": id, "result": text }),
            Err(e) => {
                warn!(tool = %method, error = %e, "tool failed");
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {
                        "code": e.code(),
                        "message": tools::describe_error(&method, &arguments, &e),
                    },
                })
            }
        };
        let _ = out_tx.send(encode_message(&response));
        if let Some(numeric_id) = numeric_id {
            in_flight_map.remove(&numeric_id);
        }
    });

    if let Some(numeric_id) = numeric_id {
        in_flight.insert(numeric_id, handle);
    }
}
