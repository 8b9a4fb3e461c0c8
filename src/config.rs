//! Language registry and broker configuration.
//!
//! The registry maps a language id to its default server command, the file
//! extensions it claims, and the capability profile used during handshake and
//! request scheduling. An explicit `--language` selector, a `--bin` command
//! override, and the `LSMCP_FORCE_LANGUAGE` environment variable can override
//! detection.

use std::path::Path;
use std::time::Duration;

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use serde_json::{Value, json};

use crate::error::{BrokerError, Result};

/// Per-language scheduling and warm-up parameters.
///
/// `open_delay` is how long the orchestrator settles after the first document
/// open on a fresh server; `request_timeout` bounds every request on that
/// server's connection.
#[derive(Debug, Clone, Copy)]
pub struct LanguageProfile {
    pub open_delay: Duration,
    pub request_timeout: Duration,
    /// Await the first `publishDiagnostics` after opening a document as the
    /// readiness signal (rust-analyzer indexes lazily).
    pub wait_for_diagnostics_on_open: bool,
    /// Project files briefly opened after `initialized` so servers that load
    /// projects lazily start resolving before the first real request.
    pub preopen_project_files: &'static [&'static str],
}

pub const DEFAULT_PROFILE: LanguageProfile = LanguageProfile {
    open_delay: Duration::from_millis(500),
    request_timeout: Duration::from_millis(30_000),
    wait_for_diagnostics_on_open: false,
    preopen_project_files: &[],
};

/// A registered language: id, spawn command, extensions, profile.
#[derive(Debug, Clone, Copy)]
pub struct LanguageConfig {
    pub id: &'static str,
    pub command: &'static [&'static str],
    pub extensions: &'static [&'static str],
    pub profile: LanguageProfile,
}

impl LanguageConfig {
    /// `initializationOptions` payload for this language, if any.
    pub fn initialization_options(&self) -> Option<Value> {
        match self.id {
            "typescript" | "javascript" => Some(json!({
                "preferences": { "includeCompletionsForModuleExports": true },
                "hostInfo": "lsmcp"
            })),
            _ => None,
        }
    }
}

static LANGUAGES: &[LanguageConfig] = &[
    LanguageConfig {
        id: "typescript",
        command: &["typescript-language-server", "--stdio"],
        extensions: &["ts", "tsx", "mts", "cts"],
        profile: LanguageProfile {
            open_delay: Duration::from_millis(500),
            request_timeout: Duration::from_millis(30_000),
            wait_for_diagnostics_on_open: false,
            preopen_project_files: &["tsconfig.json", "jsconfig.json", "package.json"],
        },
    },
    LanguageConfig {
        id: "javascript",
        command: &["typescript-language-server", "--stdio"],
        extensions: &["js", "jsx", "mjs", "cjs"],
        profile: LanguageProfile {
            open_delay: Duration::from_millis(500),
            request_timeout: Duration::from_millis(30_000),
            wait_for_diagnostics_on_open: false,
            preopen_project_files: &["jsconfig.json", "package.json"],
        },
    },
    LanguageConfig {
        id: "rust",
        command: &["rust-analyzer"],
        extensions: &["rs"],
        profile: LanguageProfile {
            open_delay: Duration::from_millis(1500),
            request_timeout: Duration::from_millis(60_000),
            wait_for_diagnostics_on_open: true,
            preopen_project_files: &[],
        },
    },
    LanguageConfig {
        id: "python",
        command: &["pyright-langserver", "--stdio"],
        extensions: &["py", "pyi"],
        profile: LanguageProfile {
            open_delay: Duration::from_millis(1000),
            request_timeout: Duration::from_millis(30_000),
            wait_for_diagnostics_on_open: false,
            preopen_project_files: &[],
        },
    },
    LanguageConfig {
        id: "pylsp",
        command: &["pylsp"],
        extensions: &[],
        profile: LanguageProfile {
            open_delay: Duration::from_millis(1000),
            request_timeout: Duration::from_millis(30_000),
            wait_for_diagnostics_on_open: false,
            preopen_project_files: &[],
        },
    },
    LanguageConfig {
        id: "go",
        command: &["gopls"],
        extensions: &["go"],
        profile: DEFAULT_PROFILE,
    },
    LanguageConfig {
        id: "json",
        command: &["vscode-json-language-server", "--stdio"],
        extensions: &["json", "jsonc"],
        profile: DEFAULT_PROFILE,
    },
];

static EXTENSION_MAP: Lazy<FxHashMap<&'static str, &'static LanguageConfig>> = Lazy::new(|| {
    let mut map = FxHashMap::default();
    for lang in LANGUAGES {
        for ext in lang.extensions {
            map.insert(*ext, lang);
        }
    }
    map
});

pub fn language_by_id(id: &str) -> Option<&'static LanguageConfig> {
    LANGUAGES.iter().find(|l| l.id == id)
}

pub fn language_for_path(path: &Path) -> Option<&'static LanguageConfig> {
    let ext = path.extension()?.to_str()?;
    EXTENSION_MAP.get(ext).copied()
}

/// LSP `languageId` for a path, independent of whether a server is registered
/// for it. Unknown extensions map to `plaintext`.
pub fn language_id_for_path(path: &Path) -> &'static str {
    match language_for_path(path) {
        Some(lang) => lang.id,
        None => match path.extension().and_then(|e| e.to_str()) {
            Some("md") => "markdown",
            Some("toml") => "toml",
            Some("yaml") | Some("yml") => "yaml",
            _ => "plaintext",
        },
    }
}

/// Process-wide broker configuration assembled from CLI flags and environment.
#[derive(Debug, Clone, Default)]
pub struct BrokerConfig {
    /// Explicit `--language` selector; wins over everything.
    pub language: Option<String>,
    /// `LSMCP_FORCE_LANGUAGE`; wins over extension detection.
    pub force_language: Option<String>,
    /// `--bin` override: replaces the registry's spawn command for every
    /// server this process starts.
    pub server_command: Option<Vec<String>>,
}

impl BrokerConfig {
    /// Resolve the language to talk about `path` with, honoring overrides.
    pub fn resolve_language(&self, path: &Path) -> Result<&'static LanguageConfig> {
        if let Some(id) = &self.language {
            return language_by_id(id)
                .ok_or_else(|| BrokerError::InvalidArgument(format!("unknown language {id:?}")));
        }
        if let Some(id) = &self.force_language {
            return language_by_id(id)
                .ok_or_else(|| BrokerError::InvalidArgument(format!("unknown language {id:?}")));
        }
        language_for_path(path).ok_or_else(|| {
            BrokerError::InvalidArgument(format!(
                "no language server registered for {}",
                path.display()
            ))
        })
    }

    /// The command line used to spawn a server for `lang`.
    pub fn server_command_for(&self, lang: &LanguageConfig) -> Vec<String> {
        match &self.server_command {
            Some(cmd) if !cmd.is_empty() => cmd.clone(),
            _ => lang.command.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Parse a `--bin "cmd arg arg"` override.
    pub fn with_server_command_line(mut self, line: Option<&str>) -> Self {
        self.server_command = line.map(|l| l.split_whitespace().map(str::to_string).collect());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_language_from_extension() {
        assert_eq!(
            language_for_path(Path::new("src/app.ts")).unwrap().id,
            "typescript"
        );
        assert_eq!(language_for_path(Path::new("lib.rs")).unwrap().id, "rust");
        assert!(language_for_path(Path::new("notes.txt")).is_none());
    }

    #[test]
    fn force_language_loses_to_explicit_selector() {
        let config = BrokerConfig {
            language: Some("rust".into()),
            force_language: Some("go".into()),
            server_command: None,
        };
        let lang = config.resolve_language(Path::new("whatever.ts")).unwrap();
        assert_eq!(lang.id, "rust");
    }

    #[test]
    fn server_command_override_wins() {
        let config =
            BrokerConfig::default().with_server_command_line(Some("/usr/bin/stub --stdio"));
        let lang = language_by_id("typescript").unwrap();
        assert_eq!(
            config.server_command_for(lang),
            vec!["/usr/bin/stub".to_string(), "--stdio".to_string()]
        );
    }

    #[test]
    fn rust_profile_waits_for_diagnostics() {
        let lang = language_by_id("rust").unwrap();
        assert!(lang.profile.wait_for_diagnostics_on_open);
        assert_eq!(lang.profile.request_timeout, Duration::from_millis(60_000));
    }
}
