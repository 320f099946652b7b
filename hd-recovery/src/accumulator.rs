//! Found addresses and the outpoint ledger for one derivation branch.
//!
//! The accumulator is fed receive and spend observations in scan order. Both
//! handlers are idempotent so a height can be reprocessed after the address
//! window grows without duplicating anything.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::types::{Inpoint, Outpoint};
use crate::window::AddressWindow;

/// A watched address that has received at least one payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundAddress {
    pub index: u32,
    pub address: String,
    /// Outpoints paying this address
    pub outpoints: BTreeSet<Outpoint>,
}

/// Outpoint ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutpointEntry {
    /// Child index of the receiving address
    pub address_index: u32,
    /// Value in satoshis
    pub value: u64,
    /// Input that consumed the output; `None` while unspent
    pub spent_by: Option<Inpoint>,
}

impl OutpointEntry {
    pub fn is_spent(&self) -> bool {
        self.spent_by.is_some()
    }
}

/// A second, different spend observed for an already resolved outpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendConflict {
    pub outpoint: Outpoint,
    /// The resolution that was kept
    pub recorded: Inpoint,
    /// The resolution that was rejected
    pub observed: Inpoint,
}

/// Result of a receive observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Address not in the window
    Ignored,
    /// Outpoint already recorded for this address
    Duplicate,
    /// Outpoint recorded; `new_address` is set the first time the address is found
    Recorded { new_address: bool },
}

/// Result of a spend observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpendOutcome {
    /// Outpoint not in the ledger
    Untracked,
    Resolved,
    /// Same inpoint already recorded
    AlreadyResolved,
    /// A different inpoint is already recorded; the entry is unchanged
    Conflict { existing: Inpoint },
}

/// FoundAddress set and OutpointLedger for one branch.
#[derive(Debug, Clone, Default)]
pub struct ScanAccumulator {
    found: BTreeMap<u32, FoundAddress>,
    ledger: BTreeMap<Outpoint, OutpointEntry>,
    conflicts: Vec<SpendConflict>,
}

impl ScanAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a payment to `address` if it is watched by `window`.
    pub fn on_receive(
        &mut self,
        window: &AddressWindow,
        address: &str,
        outpoint: &Outpoint,
        value: u64,
    ) -> ReceiveOutcome {
        let Some(index) = window.index_of(address) else {
            return ReceiveOutcome::Ignored;
        };

        let new_address = !self.found.contains_key(&index);
        let found = self.found.entry(index).or_insert_with(|| FoundAddress {
            index,
            address: address.to_string(),
            outpoints: BTreeSet::new(),
        });

        if !found.outpoints.insert(outpoint.clone()) {
            return ReceiveOutcome::Duplicate;
        }

        // an output listing several watched addresses keeps its first entry
        self.ledger
            .entry(outpoint.clone())
            .or_insert(OutpointEntry {
                address_index: index,
                value,
                spent_by: None,
            });

        if new_address {
            info!("Found address {} at index {}", address, index);
        }
        debug!("Received {} sats at {} ({})", value, address, outpoint);

        ReceiveOutcome::Recorded { new_address }
    }

    /// Resolve `outpoint` as spent by `inpoint`.
    ///
    /// The first resolution wins. Replaying it is a no-op; a different
    /// inpoint leaves the entry unchanged and is recorded as a conflict.
    pub fn on_spend(&mut self, outpoint: &Outpoint, inpoint: &Inpoint) -> SpendOutcome {
        let Some(entry) = self.ledger.get_mut(outpoint) else {
            return SpendOutcome::Untracked;
        };

        match &entry.spent_by {
            None => {
                entry.spent_by = Some(inpoint.clone());
                debug!("Outpoint {} spent by {}", outpoint, inpoint);
                SpendOutcome::Resolved
            }
            Some(existing) if existing == inpoint => SpendOutcome::AlreadyResolved,
            Some(existing) => {
                let existing = existing.clone();
                warn!(
                    "Outpoint {} already spent by {}, ignoring spend by {}",
                    outpoint, existing, inpoint
                );
                let conflict = SpendConflict {
                    outpoint: outpoint.clone(),
                    recorded: existing.clone(),
                    observed: inpoint.clone(),
                };
                if !self.conflicts.contains(&conflict) {
                    self.conflicts.push(conflict);
                }
                SpendOutcome::Conflict { existing }
            }
        }
    }

    /// Whether the window still has unused margin at the current height.
    pub fn has_margin(&self, window: &AddressWindow) -> bool {
        self.found_count() < window.len()
    }

    pub fn found_count(&self) -> usize {
        self.found.len()
    }

    /// Found addresses ordered by child index.
    pub fn found(&self) -> impl Iterator<Item = &FoundAddress> {
        self.found.values()
    }

    pub fn found_address(&self, index: u32) -> Option<&FoundAddress> {
        self.found.get(&index)
    }

    /// The full outpoint ledger.
    pub fn ledger(&self) -> &BTreeMap<Outpoint, OutpointEntry> {
        &self.ledger
    }

    pub fn entry(&self, outpoint: &Outpoint) -> Option<&OutpointEntry> {
        self.ledger.get(outpoint)
    }

    pub fn conflicts(&self) -> &[SpendConflict] {
        &self.conflicts
    }

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

    /// Sum of all received values in satoshis.
    pub fn total_received(&self) -> u64 {
        self.ledger.values().map(|e| e.value).sum()
    }

    /// Split into the found addresses, ledger and conflicts.
    pub fn into_parts(
        self,
    ) -> (
        BTreeMap<u32, FoundAddress>,
        BTreeMap<Outpoint, OutpointEntry>,
        Vec<SpendConflict>,
    ) {
        (self.found, self.ledger, self.conflicts)
    }
}
