//! Initialization handshake and capability negotiation.
//!
//! The client-capabilities object is static: full-text sync with didSave,
//! publish diagnostics with related information, linked definitions, markdown
//! hover, snippet completions, hierarchical document symbols, and workspace
//! folders. Per-language `initializationOptions` and warm-up behavior come
//! from the language registry profile.

use std::path::Path;

use lsp_types::{
    DiagnosticServerCapabilities, InitializeResult, OneOf, ServerCapabilities, Url,
};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::{LanguageConfig, language_id_for_path};
use crate::error::{BrokerError, Result};
use crate::lsp::client::LspClient;
use crate::lsp::documents::DocumentSession;

/// The capabilities this client declares on every handshake.
pub fn client_capabilities() -> Value {
    json!({
        "textDocument": {
            "synchronization": {
                "didSave": true,
                "dynamicRegistration": false
            },
            "publishDiagnostics": {
                "relatedInformation": true
            },
            "definition": {
                "linkSupport": true
            },
            "hover": {
                "contentFormat": ["markdown", "plaintext"]
            },
            "completion": {
                "completionItem": {
                    "snippetSupport": true
                }
            },
            "documentSymbol": {
                "hierarchicalDocumentSymbolSupport": true
            },
            "signatureHelp": {
                "signatureInformation": {
                    "parameterInformation": { "labelOffsetSupport": true }
                }
            },
            "codeAction": {},
            "formatting": {},
            "rename": {}
        },
        "workspace": {
            "applyEdit": true,
            "workspaceFolders": true,
            "configuration": true,
            "symbol": {}
        },
        "window": {
            "workDoneProgress": true
        }
    })
}

/// Run `initialize`/`initialized` against a freshly spawned server and return
/// its negotiated capabilities.
pub async fn initialize(
    client: &LspClient,
    root: &Path,
    lang: &LanguageConfig,
) -> Result<ServerCapabilities> {
    let root_uri = Url::from_file_path(root).map_err(|()| {
        BrokerError::InvalidArgument(format!("project root is not absolute: {}", root.display()))
    })?;
    let folder_name = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| root.display().to_string());

    let params = json!({
        "processId": std::process::id(),
        "clientInfo": { "name": "lsmcp", "version": env!("CARGO_PKG_VERSION") },
        "rootPath": root.to_string_lossy(),
        "rootUri": root_uri,
        "capabilities": client_capabilities(),
        "initializationOptions": lang.initialization_options(),
        "workspaceFolders": [{ "uri": root_uri, "name": folder_name }],
    });

    let raw = client
        .request("initialize", params, lang.profile.request_timeout)
        .await?;
    let result: InitializeResult = serde_json::from_value(raw)
        .map_err(|e| BrokerError::Transport(format!("malformed initialize result: {e}")))?;

    client.notify("initialized", json!({}))?;

    if let Some(server_info) = &result.server_info {
        info!(
            server = %server_info.name,
            version = server_info.version.as_deref().unwrap_or("?"),
            language = lang.id,
            "handshake complete"
        );
    } else {
        info!(language = lang.id, "handshake complete");
    }

    Ok(result.capabilities)
}

/// Post-initialization hook: briefly open key project files for servers that
/// load projects lazily. Failures here degrade startup latency, not
/// correctness, so they are logged and swallowed.
pub async fn warm_up(session: &DocumentSession, root: &Path, lang: &LanguageConfig) {
    for name in lang.profile.preopen_project_files {
        let path = root.join(name);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(_) => continue,
        };
        let Ok(uri) = Url::from_file_path(&path) else {
            continue;
        };
        debug!(file = %path.display(), "pre-opening project file");
        let opened = session.open(&uri, &text, language_id_for_path(&path));
        match opened {
            Ok(()) => {
                if let Err(e) = session.close(&uri) {
                    warn!(file = %path.display(), error = %e, "warm-up close failed");
                }
            }
            Err(e) => warn!(file = %path.display(), error = %e, "warm-up open failed"),
        }
    }
}

/// Whether the server advertises pull diagnostics (`textDocument/diagnostic`).
pub fn supports_pull_diagnostics(capabilities: &ServerCapabilities) -> bool {
    matches!(
        capabilities.diagnostic_provider,
        Some(DiagnosticServerCapabilities::Options(_))
            | Some(DiagnosticServerCapabilities::RegistrationOptions(_))
    )
}

/// Whether the server advertises rename support.
pub fn supports_rename(capabilities: &ServerCapabilities) -> bool {
    match &capabilities.rename_provider {
        Some(OneOf::Left(enabled)) => *enabled,
        Some(OneOf::Right(_)) => true,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_declare_the_advertised_features() {
        let caps = client_capabilities();
        assert_eq!(
            caps["textDocument"]["documentSymbol"]["hierarchicalDocumentSymbolSupport"],
            json!(true)
        );
        assert_eq!(caps["workspace"]["applyEdit"], json!(true));
        assert_eq!(
            caps["textDocument"]["hover"]["contentFormat"][0],
            json!("markdown")
        );
    }

    #[test]
    fn rename_support_detection() {
        let mut caps = ServerCapabilities::default();
        assert!(!supports_rename(&caps));
        caps.rename_provider = Some(OneOf::Left(true));
        assert!(supports_rename(&caps));
        caps.rename_provider = Some(OneOf::Left(false));
        assert!(!supports_rename(&caps));
    }
}
