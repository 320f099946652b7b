//! Gap-limit recovery for a single derivation branch.
//!
//! [`AccountRecovery`] ties an [`AddressWindow`] to a [`ScanAccumulator`] and
//! drives discovery in one of two equivalent ways:
//!
//! - pull: [`AccountRecovery::recover_pull`] owns the loop, re-reading the
//!   chain tip before every height and reprocessing a height whenever the
//!   window ran out of margin on it.
//! - push: the recovery is a [`ScanObserver`] on a reentrant
//!   [`BlockScanner`]. The block handler grows the window before the block's
//!   observations arrive and the receive handler halts the scanner once the
//!   margin is gone; [`AccountRecovery::recover_push`] re-invokes the scanner
//!   from the returned height.
//!
//! Both produce the same found addresses and outpoint ledger for the same
//! chain and gap limit.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::accumulator::{FoundAddress, OutpointEntry, ScanAccumulator, SpendConflict};
use crate::error::RecoveryError;
use crate::keychain::KeyChain;
use crate::ledger::LedgerSource;
use crate::scanner::{
    observe_block, BlockScanner, CancelHandle, Continuation, ScanEvent, ScanObserver, ScanOutcome,
    ScanState,
};
use crate::types::Outpoint;
use crate::window::AddressWindow;

/// How a recovery drives the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryMode {
    /// Observer on a reentrant scanner
    #[default]
    Push,
    /// Self-driven block loop
    Pull,
}

impl std::str::FromStr for RecoveryMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(RecoveryMode::Push),
            "pull" => Ok(RecoveryMode::Pull),
            other => anyhow::bail!("unknown recovery mode {:?} (expected push or pull)", other),
        }
    }
}

/// Counters kept while recovering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScanStats {
    /// Blocks delivered, including reprocessed ones
    pub blocks_processed: u64,
    /// Heights reprocessed after the window ran out of margin
    pub rescans: u64,
    /// Window expansions that added addresses
    pub expansions: u64,
    /// Addresses derived across all expansions
    pub addresses_derived: u64,
}

/// Snapshot of a branch's recovery state, handed to the caller for
/// persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryResult {
    /// Found addresses ordered by child index
    pub found: Vec<FoundAddress>,
    /// Outpoints paying found addresses and their spend status
    pub ledger: BTreeMap<Outpoint, OutpointEntry>,
    /// Rejected second spends
    pub conflicts: Vec<SpendConflict>,
    /// Addresses watched when the snapshot was taken
    pub window_size: usize,
    pub stats: ScanStats,
    /// Last height delivered
    pub last_height: Option<u64>,
    pub complete: bool,
}

impl RecoveryResult {
    pub fn unspent(&self) -> impl Iterator<Item = (&Outpoint, &OutpointEntry)> {
        self.ledger.iter().filter(|(_, e)| !e.is_spent())
    }

    pub fn spent(&self) -> impl Iterator<Item = (&Outpoint, &OutpointEntry)> {
        self.ledger.iter().filter(|(_, e)| e.is_spent())
    }

    /// Sum of unspent values in satoshis.
    pub fn balance(&self) -> u64 {
        self.unspent().map(|(_, e)| e.value).sum()
    }

    pub fn total_received(&self) -> u64 {
        self.ledger.values().map(|e| e.value).sum()
    }

    /// Index the wallet should hand out next on this branch.
    pub fn next_index(&self) -> u32 {
        self.found.last().map_or(0, |f| f.index + 1)
    }
}

/// Control surface shared by single-branch and multi-branch recovery, so the
/// push and pull loops are written once.
pub(crate) trait RecoveryTarget: ScanObserver + Send {
    /// Record a rescan if the margin ran out, then expand the window(s).
    fn prepare(&mut self) -> anyhow::Result<()>;

    /// Whether every window still has unused margin.
    fn has_margin(&self) -> bool;

    /// Failure raised inside an event handler, if any.
    fn take_failure(&mut self) -> Option<anyhow::Error>;
}

/// Re-invoke a reentrant scanner until the range is exhausted or canceled.
///
/// The chain tip is re-read before each invocation and caps `end_height`.
pub(crate) async fn drive_push<T, L>(
    target: &mut T,
    scanner: &mut BlockScanner<L>,
    start_height: u64,
    end_height: Option<u64>,
) -> anyhow::Result<ScanOutcome>
where
    T: RecoveryTarget,
    L: LedgerSource,
{
    let mut height = start_height;
    loop {
        let tip = scanner.ledger().chain_tip_height().await?;
        let end = end_height.map_or(tip, |end| end.min(tip));

        let outcome = scanner.scan_reentrant(height, end, target).await;
        if let Some(e) = target.take_failure() {
            return Err(e);
        }

        match outcome? {
            ScanOutcome::Halted { resume_height } => {
                debug!("Window exhausted at height {}, rescanning", resume_height);
                height = resume_height;
            }
            other => return Ok(other),
        }
    }
}

/// Fetch and deliver blocks directly, reprocessing a height until the
/// window has margin on it.
///
/// A supplied `cancel` handle follows the same states as a scanner's:
/// `Scanning` while the loop runs, then `Complete` or `Canceled`.
pub(crate) async fn drive_pull<T, L>(
    target: &mut T,
    ledger: &L,
    start_height: u64,
    end_height: Option<u64>,
    cancel: Option<&CancelHandle>,
) -> anyhow::Result<ScanOutcome>
where
    T: RecoveryTarget,
    L: LedgerSource + ?Sized,
{
    let Some(handle) = cancel else {
        return pull_blocks(target, ledger, start_height, end_height, None).await;
    };

    handle.set_state(ScanState::Scanning)?;
    let result = pull_blocks(target, ledger, start_height, end_height, Some(handle)).await;
    let state = match result {
        Ok(ScanOutcome::Complete) => ScanState::Complete,
        _ => ScanState::Canceled,
    };
    handle.set_state(state)?;
    result
}

async fn pull_blocks<T, L>(
    target: &mut T,
    ledger: &L,
    start_height: u64,
    end_height: Option<u64>,
    cancel: Option<&CancelHandle>,
) -> anyhow::Result<ScanOutcome>
where
    T: RecoveryTarget,
    L: LedgerSource + ?Sized,
{
    target.on_event(&ScanEvent::Start);

    let mut height = start_height;
    loop {
        // the tip can move while we scan
        let tip = ledger.chain_tip_height().await?;
        let end = end_height.map_or(tip, |end| end.min(tip));
        if height > end {
            break;
        }

        target.prepare()?;
        let block = ledger.block_at(height).await?;
        observe_block(&block, target);
        if let Some(e) = target.take_failure() {
            return Err(e);
        }

        if target.has_margin() {
            height += 1;
        } else {
            debug!("Window exhausted at height {}, rescanning", height);
        }

        if cancel.is_some_and(|c| c.take_request()) {
            info!("Recovery canceled, resume from height {}", height);
            return Ok(ScanOutcome::Canceled {
                resume_height: height,
            });
        }
    }

    target.on_event(&ScanEvent::Complete);
    Ok(ScanOutcome::Complete)
}

/// Recovery state for one derivation branch.
pub struct AccountRecovery {
    key_chain: Box<dyn KeyChain + Send + Sync>,
    gap_limit: u32,
    window: AddressWindow,
    accumulator: ScanAccumulator,
    stats: ScanStats,
    last_height: Option<u64>,
    complete: bool,
    failure: Option<anyhow::Error>,
}

impl AccountRecovery {
    pub fn new<K>(key_chain: K, gap_limit: u32) -> Result<Self, RecoveryError>
    where
        K: KeyChain + Send + Sync + 'static,
    {
        if gap_limit == 0 {
            return Err(RecoveryError::InvalidGapLimit(gap_limit));
        }
        Ok(Self {
            key_chain: Box::new(key_chain),
            gap_limit,
            window: AddressWindow::new(),
            accumulator: ScanAccumulator::new(),
            stats: ScanStats::default(),
            last_height: None,
            complete: false,
            failure: None,
        })
    }

    pub fn gap_limit(&self) -> u32 {
        self.gap_limit
    }

    pub fn window(&self) -> &AddressWindow {
        &self.window
    }

    pub fn accumulator(&self) -> &ScanAccumulator {
        &self.accumulator
    }

    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    pub fn last_height(&self) -> Option<u64> {
        self.last_height
    }

    /// Whether a scan ran to the end of its range.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Grow the window to `found + gap_limit` addresses.
    pub fn expand_window(&mut self) -> anyhow::Result<usize> {
        let added = self.window.expand(
            &self.key_chain,
            self.accumulator.found_count(),
            self.gap_limit,
        )?;
        if added > 0 {
            self.stats.expansions += 1;
            self.stats.addresses_derived += added as u64;
        }
        Ok(added)
    }

    /// Run recovery by fetching blocks from `ledger` directly.
    ///
    /// Scans `start_height` up to `end_height`, or up to the chain tip (read
    /// again before every height) when `end_height` is `None`.
    pub async fn recover_pull<L: LedgerSource + ?Sized>(
        &mut self,
        ledger: &L,
        start_height: u64,
        end_height: Option<u64>,
        cancel: Option<&CancelHandle>,
    ) -> anyhow::Result<ScanOutcome> {
        drive_pull(self, ledger, start_height, end_height, cancel).await
    }

    /// Run recovery as an observer of `scanner`, re-invoking it from the
    /// halted height each time the window runs out of margin.
    pub async fn recover_push<L: LedgerSource>(
        &mut self,
        scanner: &mut BlockScanner<L>,
        start_height: u64,
        end_height: Option<u64>,
    ) -> anyhow::Result<ScanOutcome> {
        drive_push(self, scanner, start_height, end_height).await
    }

    pub fn result(&self) -> RecoveryResult {
        RecoveryResult {
            found: self.accumulator.found().cloned().collect(),
            ledger: self.accumulator.ledger().clone(),
            conflicts: self.accumulator.conflicts().to_vec(),
            window_size: self.window.len(),
            stats: self.stats,
            last_height: self.last_height,
            complete: self.complete,
        }
    }

    pub fn into_result(self) -> RecoveryResult {
        let window_size = self.window.len();
        let (found, ledger, conflicts) = self.accumulator.into_parts();
        RecoveryResult {
            found: found.into_values().collect(),
            ledger,
            conflicts,
            window_size,
            stats: self.stats,
            last_height: self.last_height,
            complete: self.complete,
        }
    }
}

impl RecoveryTarget for AccountRecovery {
    fn prepare(&mut self) -> anyhow::Result<()> {
        if !self.window.is_empty() && !self.has_margin() {
            self.stats.rescans += 1;
        }
        self.expand_window()?;
        Ok(())
    }

    fn has_margin(&self) -> bool {
        self.accumulator.has_margin(&self.window)
    }

    fn take_failure(&mut self) -> Option<anyhow::Error> {
        self.failure.take()
    }
}

impl ScanObserver for AccountRecovery {
    fn on_event(&mut self, event: &ScanEvent<'_>) -> Continuation {
        match event {
            ScanEvent::Start => {
                self.complete = false;
                Continuation::Continue
            }
            ScanEvent::Block { height, .. } => {
                self.stats.blocks_processed += 1;
                self.last_height = Some(*height);
                if let Err(e) = self.prepare() {
                    self.failure = Some(e);
                }
                Continuation::from_continue(self.failure.is_none())
            }
            ScanEvent::Receive {
                address,
                outpoint,
                value,
            } => {
                if self.failure.is_some() {
                    return Continuation::Halt;
                }
                self.accumulator
                    .on_receive(&self.window, address, outpoint, *value);
                Continuation::from_continue(self.has_margin())
            }
            ScanEvent::Spend { outpoint, inpoint } => {
                if self.failure.is_some() {
                    return Continuation::Halt;
                }
                self.accumulator.on_spend(outpoint, inpoint);
                Continuation::Continue
            }
            ScanEvent::Complete => {
                if self.failure.is_none() {
                    self.complete = true;
                    info!(
                        "Recovery complete: {} addresses found, {} outpoints, balance {} sats ({} blocks, {} rescans)",
                        self.accumulator.found_count(),
                        self.accumulator.ledger().len(),
                        self.accumulator.balance(),
                        self.stats.blocks_processed,
                        self.stats.rescans
                    );
                }
                Continuation::Continue
            }
        }
    }
}
