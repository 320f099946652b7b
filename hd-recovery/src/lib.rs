//! HD Wallet Recovery
//!
//! Rediscovers which addresses of a hierarchical deterministic wallet have
//! been used, and which of their outputs are still unspent, from raw block
//! data alone. This library provides:
//!
//! - Gap-limit address windows that grow as used addresses are found
//! - A block scanner state machine with linear and reentrant modes
//! - Idempotent receive/spend accumulation, safe under height reprocessing
//! - Single-branch and multi-branch recovery in pull or push style
//! - A bitcoind JSON-RPC ledger source and an in-memory one for tests
//!
//! # Architecture
//!
//! A [`BlockScanner`] walks heights of a [`LedgerSource`] and emits ordered
//! [`ScanEvent`]s. An [`AccountRecovery`] consumes them for one derivation
//! branch: it watches an [`AddressWindow`] derived from a [`KeyChain`] and
//! records payments and spends in a [`ScanAccumulator`]. When every watched
//! address has been used at some height, the window grows and that height
//! is scanned again so newly watched addresses are not missed. The
//! [`WalletOrchestrator`] runs several branches over one pass of the chain.
//!
//! Everything runs on a single logical thread of control; the only
//! suspension points are ledger fetches.

pub mod accumulator;
pub mod config;
pub mod error;
pub mod keychain;
pub mod ledger;
pub mod orchestrator;
pub mod recovery;
pub mod report;
pub mod scanner;
pub mod types;
pub mod window;

pub use accumulator::{FoundAddress, OutpointEntry, ScanAccumulator, SpendConflict};
pub use config::{AccountConfig, RecoveryConfig};
pub use error::RecoveryError;
pub use keychain::{Chain, KeyChain, Purpose, StaticKeyChain, XpubKeyChain};
pub use ledger::{BitcoindClient, BitcoindConfig, LedgerSource, MemoryLedger};
pub use orchestrator::{Branch, WalletOrchestrator};
pub use recovery::{AccountRecovery, RecoveryMode, RecoveryResult, ScanStats};
pub use report::RecoveryReport;
pub use scanner::{
    BlockScanner, CancelHandle, Continuation, ScanEvent, ScanObserver, ScanOutcome, ScanState,
};
pub use types::{Block, DerivedAddress, Inpoint, Outpoint, Transaction, TxInput, TxOutput};
pub use window::AddressWindow;
