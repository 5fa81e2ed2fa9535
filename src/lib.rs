//! A teaching-grade laboratory comparing three distributed mutual-exclusion
//! algorithms — Fair-Ring, the Lamport shared priority queue, and
//! Maekawa-style voting — over a length-framed TCP RPC transport.
//!
//! See `SPEC_FULL.md` for the full module breakdown and `DESIGN.md` for the
//! grounding ledger.

pub mod cli;
pub mod clock;
pub mod error;
pub mod membership;
pub mod pqueue;
pub mod ring;
pub mod spq;
pub mod voting;
pub mod wire;

/// Base port for the `127.0.0.1:(8000 + id)` address convention (spec.md §6).
pub const BASE_PORT: u16 = 8000;

/// Artificial delay applied on every message receipt, to make traces
/// observable (spec.md §5).
pub const RECV_DELAY: std::time::Duration = std::time::Duration::from_secs(1);

/// Artificial delay simulating work inside the critical section (spec.md §5).
pub const CS_DELAY: std::time::Duration = std::time::Duration::from_secs(2);
