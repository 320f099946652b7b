//! Error types for the recovery core.
//!
//! Failures coming from the ledger source or key chain are carried as
//! `anyhow::Error` and surface to the caller unchanged; the variants here
//! cover the core's own invariants.

use thiserror::Error;

use crate::scanner::ScanState;

/// Errors raised by the recovery core itself.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// A scan state change that the state machine does not allow.
    #[error("illegal scan state transition: {from:?} -> {to:?}")]
    InvalidTransition { from: ScanState, to: ScanState },

    /// The gap limit must leave room for at least one unused address.
    #[error("gap limit must be at least 1, got {0}")]
    InvalidGapLimit(u32),

    /// Start height lies beyond the end height.
    #[error("invalid height range: {start}..={end}")]
    InvalidRange { start: u64, end: u64 },

    /// The key chain could not produce an address for an index.
    #[error("failed to derive address at index {index}: {reason}")]
    Derivation { index: u32, reason: String },

    /// Two derived indices produced the same address string.
    #[error("address {address} derived at index {index} already watched at index {existing}")]
    DuplicateAddress {
        address: String,
        index: u32,
        existing: u32,
    },

    /// The ledger returned data the core cannot interpret.
    #[error("malformed ledger data: {0}")]
    MalformedLedgerData(String),
}
