//! Multi-branch wallet recovery.
//!
//! A wallet exposes several derivation branches (address formats times
//! receive/change chains). The orchestrator runs one [`AccountRecovery`] per
//! branch over a single pass of the chain: every block is fetched once and
//! delivered to all branches, and a height is reprocessed when any branch ran
//! out of window margin on it.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::keychain::{Chain, Purpose};
use crate::ledger::LedgerSource;
use crate::recovery::{drive_pull, drive_push, AccountRecovery, RecoveryResult, RecoveryTarget};
use crate::scanner::{BlockScanner, CancelHandle, Continuation, ScanEvent, ScanObserver, ScanOutcome};

/// A derivation branch: address format plus chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Branch {
    pub purpose: Purpose,
    pub chain: Chain,
}

impl Branch {
    pub fn new(purpose: Purpose, chain: Chain) -> Self {
        Self { purpose, chain }
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.purpose, self.chain)
    }
}

/// Runs recovery for several branches in lockstep.
#[derive(Default)]
pub struct WalletOrchestrator {
    branches: Vec<(Branch, AccountRecovery)>,
}

impl WalletOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a branch. Each branch may only be added once.
    pub fn add_branch(&mut self, branch: Branch, recovery: AccountRecovery) -> anyhow::Result<()> {
        if self.branches.iter().any(|(b, _)| *b == branch) {
            anyhow::bail!("branch {} already registered", branch);
        }
        self.branches.push((branch, recovery));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    pub fn branch(&self, branch: &Branch) -> Option<&AccountRecovery> {
        self.branches
            .iter()
            .find(|(b, _)| b == branch)
            .map(|(_, r)| r)
    }

    /// True once every branch has completed a scan to the end of its range.
    pub fn is_complete(&self) -> bool {
        !self.branches.is_empty() && self.branches.iter().all(|(_, r)| r.is_complete())
    }

    /// Recover all branches as observers of a reentrant scanner.
    pub async fn recover_push<L: LedgerSource>(
        &mut self,
        scanner: &mut BlockScanner<L>,
        start_height: u64,
        end_height: Option<u64>,
    ) -> anyhow::Result<ScanOutcome> {
        self.ensure_branches()?;
        info!("Recovering {} branches from height {}", self.len(), start_height);
        let outcome = drive_push(self, scanner, start_height, end_height).await?;
        self.log_summary(&outcome);
        Ok(outcome)
    }

    /// Recover all branches by fetching blocks from `ledger` directly.
    pub async fn recover_pull<L: LedgerSource + ?Sized>(
        &mut self,
        ledger: &L,
        start_height: u64,
        end_height: Option<u64>,
        cancel: Option<&CancelHandle>,
    ) -> anyhow::Result<ScanOutcome> {
        self.ensure_branches()?;
        info!("Recovering {} branches from height {}", self.len(), start_height);
        let outcome = drive_pull(self, ledger, start_height, end_height, cancel).await?;
        self.log_summary(&outcome);
        Ok(outcome)
    }

    /// Per-branch results.
    pub fn results(&self) -> BTreeMap<Branch, RecoveryResult> {
        self.branches
            .iter()
            .map(|(b, r)| (*b, r.result()))
            .collect()
    }

    pub fn into_results(self) -> BTreeMap<Branch, RecoveryResult> {
        self.branches
            .into_iter()
            .map(|(b, r)| (b, r.into_result()))
            .collect()
    }

    fn ensure_branches(&self) -> anyhow::Result<()> {
        if self.branches.is_empty() {
            anyhow::bail!("no branches registered");
        }
        Ok(())
    }

    fn log_summary(&self, outcome: &ScanOutcome) {
        for (branch, recovery) in &self.branches {
            let acc = recovery.accumulator();
            info!(
                "{}: {} addresses, {} outpoints, balance {} sats",
                branch,
                acc.found_count(),
                acc.ledger().len(),
                acc.balance()
            );
        }
        if let Some(height) = outcome.resume_height() {
            info!("Recovery stopped early, resume from height {}", height);
        }
    }
}

impl RecoveryTarget for WalletOrchestrator {
    fn prepare(&mut self) -> anyhow::Result<()> {
        for (_, recovery) in &mut self.branches {
            recovery.prepare()?;
        }
        Ok(())
    }

    fn has_margin(&self) -> bool {
        self.branches.iter().all(|(_, r)| r.has_margin())
    }

    fn take_failure(&mut self) -> Option<anyhow::Error> {
        self.branches
            .iter_mut()
            .find_map(|(_, r)| r.take_failure())
    }
}

impl ScanObserver for WalletOrchestrator {
    fn on_event(&mut self, event: &ScanEvent<'_>) -> Continuation {
        // every branch sees every event, even after one asked to halt
        self.branches
            .iter_mut()
            .fold(Continuation::Continue, |flow, (_, r)| flow.and(r.on_event(event)))
    }
}
