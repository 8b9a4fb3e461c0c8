//! Structured error taxonomy for the broker core.
//!
//! Every fallible core API returns [`BrokerError`]. The tool layer attaches
//! invocation context before formatting an error for the wire; the kind is
//! preserved as a JSON-RPC application error code.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = BrokerError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("no line matching {needle:?} in {file}")]
    LineNotFound { file: String, needle: String },

    #[error("symbol {symbol:?} not found on line {line} of {file}")]
    SymbolNotFoundOnLine {
        symbol: String,
        /// One-based, as the caller supplied it.
        line: u32,
        file: String,
    },

    #[error("language server is not initialized")]
    NotInitialized,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("{method} timed out after {after:?}")]
    Timeout { method: String, after: Duration },

    #[error("language server error {code}: {message}")]
    ServerError { code: i64, message: String },

    #[error("{0}")]
    Unsupported(String),

    #[error("edit conflict: {0}")]
    EditConflict(String),

    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// Manual Clone: io::Error is not Clone, so it is reconstructed from its kind
// and message. Needed because single-flight initialization hands one failure
// to every concurrent waiter.
impl Clone for BrokerError {
    fn clone(&self) -> Self {
        match self {
            BrokerError::InvalidArgument(m) => BrokerError::InvalidArgument(m.clone()),
            BrokerError::FileNotFound(p) => BrokerError::FileNotFound(p.clone()),
            BrokerError::LineNotFound { file, needle } => BrokerError::LineNotFound {
                file: file.clone(),
                needle: needle.clone(),
            },
            BrokerError::SymbolNotFoundOnLine { symbol, line, file } => {
                BrokerError::SymbolNotFoundOnLine {
                    symbol: symbol.clone(),
                    line: *line,
                    file: file.clone(),
                }
            }
            BrokerError::NotInitialized => BrokerError::NotInitialized,
            BrokerError::Transport(m) => BrokerError::Transport(m.clone()),
            BrokerError::Timeout { method, after } => BrokerError::Timeout {
                method: method.clone(),
                after: *after,
            },
            BrokerError::ServerError { code, message } => BrokerError::ServerError {
                code: *code,
                message: message.clone(),
            },
            BrokerError::Unsupported(m) => BrokerError::Unsupported(m.clone()),
            BrokerError::EditConflict(m) => BrokerError::EditConflict(m.clone()),
            BrokerError::Io { path, source } => BrokerError::Io {
                path: path.clone(),
                source: std::io::Error::new(source.kind(), source.to_string()),
            },
        }
    }
}

impl BrokerError {
    /// Map an io error on `path`, folding the common not-found case into the
    /// taxonomy kind callers match on.
    pub fn from_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            BrokerError::FileNotFound(path)
        } else {
            BrokerError::Io { path, source }
        }
    }

    /// JSON-RPC application error code for this kind (-32000..-32099 range).
    pub fn code(&self) -> i64 {
        match self {
            BrokerError::InvalidArgument(_) => -32000,
            BrokerError::FileNotFound(_) => -32001,
            BrokerError::LineNotFound { .. } => -32002,
            BrokerError::SymbolNotFoundOnLine { .. } => -32003,
            BrokerError::NotInitialized => -32004,
            BrokerError::Transport(_) => -32005,
            BrokerError::Timeout { .. } => -32006,
            BrokerError::ServerError { .. } => -32007,
            BrokerError::Unsupported(_) => -32008,
            BrokerError::EditConflict(_) => -32009,
            BrokerError::Io { .. } => -32010,
        }
    }

    /// True for kinds that indicate the server entry itself is unusable.
    pub fn is_fatal_to_server(&self) -> bool {
        matches!(self, BrokerError::Transport(_))
    }
}
