//! Recovery report.
//!
//! A JSON rendering of the per-branch results for persistence by the
//! caller. The recovery core itself persists nothing.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::accumulator::SpendConflict;
use crate::orchestrator::Branch;
use crate::recovery::{RecoveryResult, ScanStats};
use crate::scanner::ScanOutcome;
use crate::types::{Inpoint, Outpoint};

/// A found address as reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressReport {
    pub index: u32,
    pub address: String,
    pub outpoints: Vec<String>,
}

/// An outpoint ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutpointReport {
    pub outpoint: String,
    pub address_index: u32,
    pub value: u64,
    pub spent_by: Option<String>,
}

impl OutpointReport {
    pub fn parse_outpoint(&self) -> anyhow::Result<Outpoint> {
        self.outpoint.parse()
    }

    pub fn parse_spent_by(&self) -> anyhow::Result<Option<Inpoint>> {
        self.spent_by.as_deref().map(str::parse).transpose()
    }
}

/// Results for one branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchReport {
    pub branch: Branch,
    pub addresses: Vec<AddressReport>,
    pub outpoints: Vec<OutpointReport>,
    pub conflicts: Vec<SpendConflict>,
    /// Next unused child index
    pub next_index: u32,
    pub balance: u64,
    pub total_received: u64,
    pub stats: ScanStats,
    pub complete: bool,
}

impl BranchReport {
    pub fn new(branch: Branch, result: &RecoveryResult) -> Self {
        Self {
            branch,
            addresses: result
                .found
                .iter()
                .map(|f| AddressReport {
                    index: f.index,
                    address: f.address.clone(),
                    outpoints: f.outpoints.iter().map(Outpoint::to_string).collect(),
                })
                .collect(),
            outpoints: result
                .ledger
                .iter()
                .map(|(outpoint, entry)| OutpointReport {
                    outpoint: outpoint.to_string(),
                    address_index: entry.address_index,
                    value: entry.value,
                    spent_by: entry.spent_by.as_ref().map(Inpoint::to_string),
                })
                .collect(),
            conflicts: result.conflicts.clone(),
            next_index: result.next_index(),
            balance: result.balance(),
            total_received: result.total_received(),
            stats: result.stats,
            complete: result.complete,
        }
    }
}

/// Full recovery report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// RFC 3339 generation time
    pub generated_at: String,
    pub network: String,
    pub gap_limit: u32,
    pub start_height: u64,
    /// Last height delivered to any branch
    pub last_height: Option<u64>,
    /// Height to resume from when the scan stopped early
    pub resume_height: Option<u64>,
    pub branches: Vec<BranchReport>,
}

impl RecoveryReport {
    pub fn new(
        network: impl Into<String>,
        gap_limit: u32,
        start_height: u64,
        outcome: &ScanOutcome,
        results: &BTreeMap<Branch, RecoveryResult>,
    ) -> Self {
        Self {
            generated_at: chrono::Utc::now().to_rfc3339(),
            network: network.into(),
            gap_limit,
            start_height,
            last_height: results.values().filter_map(|r| r.last_height).max(),
            resume_height: outcome.resume_height(),
            branches: results
                .iter()
                .map(|(branch, result)| BranchReport::new(*branch, result))
                .collect(),
        }
    }

    /// Sum of branch balances in satoshis.
    pub fn total_balance(&self) -> u64 {
        self.branches.iter().map(|b| b.balance).sum()
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the report as pretty JSON.
    ///
    /// Writes to a temp file first, then renames over `path`.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = self.to_json()?;

        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;

        tracing::debug!("Saved recovery report to {}", path.display());
        Ok(())
    }

    /// Read a saved report, rejecting malformed outpoint references.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let report: Self = serde_json::from_str(&content)?;

        for branch in &report.branches {
            for address in &branch.addresses {
                for outpoint in &address.outpoints {
                    outpoint.parse::<Outpoint>().map_err(|e| {
                        anyhow::anyhow!("{} address {}: {}", branch.branch, address.index, e)
                    })?;
                }
            }
            for row in &branch.outpoints {
                row.parse_outpoint()
                    .and_then(|_| row.parse_spent_by())
                    .map_err(|e| anyhow::anyhow!("{} outpoint row: {}", branch.branch, e))?;
            }
        }

        Ok(report)
    }

    /// One line per branch, for terminal output.
    pub fn summary(&self) -> String {
        let mut lines = Vec::with_capacity(self.branches.len() + 1);
        for b in &self.branches {
            lines.push(format!(
                "{:<16} {:>4} addresses  {:>5} outpoints  next index {:>5}  balance {} sats",
                b.branch.to_string(),
                b.addresses.len(),
                b.outpoints.len(),
                b.next_index,
                b.balance
            ));
        }
        lines.push(format!("Total balance: {} sats", self.total_balance()));
        lines.join("\n")
    }
}
