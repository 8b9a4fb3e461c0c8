//! LSP client runtime: framing, request correlation, document lifecycle,
//! diagnostics, handshake, and the server pool.

pub mod capabilities;
pub mod client;
pub mod diagnostics;
pub mod documents;
pub mod framing;
pub mod pool;

pub use client::LspClient;
pub use diagnostics::DiagnosticsStore;
pub use documents::DocumentSession;
pub use pool::{PoolKey, ServerEntry, ServerPool, ServerState};
