//! Boundary error type.
//!
//! Everything a handler needs to *match on structurally* lives here; every
//! other failure is propagated as an opaque `anyhow::Error` with `.context`,
//! the way the teacher's `lamport_mutex.rs` uses `anyhow::ensure!`/`bail!`
//! for its invariant checks.

use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub enum MutexError {
    #[error("dial {addr} failed: {source}")]
    Dial {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}
