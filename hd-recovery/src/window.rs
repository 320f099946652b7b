//! Address window with gap-limit expansion.
//!
//! The window is the set of addresses currently watched on one derivation
//! branch. It is stored as a vector indexed by child index (so iteration
//! order is the derivation order) plus a lookup table for O(1) membership
//! checks when outputs are scanned.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::error::RecoveryError;
use crate::keychain::KeyChain;
use crate::types::DerivedAddress;

/// Watched addresses for a single derivation branch.
///
/// Indices are contiguous from zero and only ever grow; nothing is removed.
#[derive(Debug, Clone, Default)]
pub struct AddressWindow {
    /// Derived addresses, position == child index
    addresses: Vec<DerivedAddress>,

    /// Address string -> child index
    lookup: HashMap<String, u32>,
}

impl AddressWindow {
    /// Create an empty window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of watched addresses.
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Child index of `address`, if it is watched.
    pub fn index_of(&self, address: &str) -> Option<u32> {
        self.lookup.get(address).copied()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.lookup.contains_key(address)
    }

    /// The watched address at `index`.
    pub fn get(&self, index: u32) -> Option<&DerivedAddress> {
        self.addresses.get(index as usize)
    }

    /// The index the next expansion would derive first.
    pub fn next_unused_index(&self) -> u32 {
        self.addresses.len() as u32
    }

    /// Watched addresses in derivation order.
    pub fn iter(&self) -> impl Iterator<Item = &DerivedAddress> {
        self.addresses.iter()
    }

    /// Whether the window already covers `found_count + gap_limit` addresses.
    pub fn has_room(&self, found_count: usize, gap_limit: u32) -> bool {
        self.len() >= found_count + gap_limit as usize
    }

    /// Grow the window so it holds at least `found_count + gap_limit`
    /// addresses, deriving indices `[next_unused_index, found_count +
    /// gap_limit)`.
    ///
    /// Returns the number of addresses added; zero when the window already
    /// has room.
    pub fn expand<K: KeyChain + ?Sized>(
        &mut self,
        key_chain: &K,
        found_count: usize,
        gap_limit: u32,
    ) -> anyhow::Result<usize> {
        if gap_limit == 0 {
            return Err(RecoveryError::InvalidGapLimit(gap_limit).into());
        }
        if self.has_room(found_count, gap_limit) {
            return Ok(0);
        }

        let start_index = self.next_unused_index();
        let end_index = u32::try_from(found_count + gap_limit as usize)
            .map_err(|_| RecoveryError::InvalidGapLimit(gap_limit))?;

        self.addresses.reserve((end_index - start_index) as usize);
        for index in start_index..end_index {
            let derived = key_chain
                .derive(index)
                .map_err(|e| RecoveryError::Derivation {
                    index,
                    reason: e.to_string(),
                })?;
            self.insert(derived)?;
        }

        let added = (end_index - start_index) as usize;
        info!(
            "Added {} addresses to scan list (indices {} to {})",
            added,
            start_index,
            end_index - 1
        );

        Ok(added)
    }

    fn insert(&mut self, derived: DerivedAddress) -> Result<(), RecoveryError> {
        if let Some(existing) = self.lookup.get(&derived.address) {
            return Err(RecoveryError::DuplicateAddress {
                address: derived.address,
                index: derived.index,
                existing: *existing,
            });
        }
        debug!("Watching address {} at index {}", derived.address, derived.index);
        self.lookup.insert(derived.address.clone(), derived.index);
        self.addresses.push(derived);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keychain::StaticKeyChain;

    struct FailingKeyChain;

    impl KeyChain for FailingKeyChain {
        fn derive_address(&self, index: u32) -> anyhow::Result<String> {
            if index >= 3 {
                anyhow::bail!("hardware wallet disconnected");
            }
            Ok(format!("ok{}", index))
        }
    }

    struct ConstantKeyChain;

    impl KeyChain for ConstantKeyChain {
        fn derive_address(&self, _index: u32) -> anyhow::Result<String> {
            Ok("same".to_string())
        }
    }

    #[test]
    fn test_expand_empty_window() {
        let chain = StaticKeyChain::new("a");
        let mut window = AddressWindow::new();

        let added = window.expand(&chain, 0, 2).unwrap();

        assert_eq!(added, 2);
        assert_eq!(window.len(), 2);
        assert_eq!(window.index_of("a0"), Some(0));
        assert_eq!(window.index_of("a1"), Some(1));
        assert!(!window.contains("a2"));
    }

    #[test]
    fn test_expand_is_noop_with_room() {
        let chain = StaticKeyChain::new("a");
        let mut window = AddressWindow::new();
        window.expand(&chain, 0, 5).unwrap();

        assert_eq!(window.expand(&chain, 3, 2).unwrap(), 0);
        assert_eq!(window.len(), 5);
    }

    #[test]
    fn test_expand_continues_from_next_index() {
        let chain = StaticKeyChain::new("a");
        let mut window = AddressWindow::new();
        window.expand(&chain, 0, 2).unwrap();

        // both addresses used -> window must reach 2 + 2
        let added = window.expand(&chain, 2, 2).unwrap();

        assert_eq!(added, 2);
        assert_eq!(window.len(), 4);
        let indices: Vec<u32> = window.iter().map(|d| d.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert_eq!(window.get(3).unwrap().address, "a3");
    }

    #[test]
    fn test_expand_is_deterministic() {
        let chain = StaticKeyChain::new("a");
        let mut first = AddressWindow::new();
        let mut second = AddressWindow::new();

        for found in [0, 1, 3, 3, 7] {
            first.expand(&chain, found, 3).unwrap();
            second.expand(&chain, found, 3).unwrap();
        }

        let a: Vec<_> = first.iter().cloned().collect();
        let b: Vec<_> = second.iter().cloned().collect();
        assert_eq!(a, b);
        assert_eq!(first.len(), 10);
    }

    #[test]
    fn test_zero_gap_limit_rejected() {
        let chain = StaticKeyChain::new("a");
        let mut window = AddressWindow::new();
        let err = window.expand(&chain, 0, 0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RecoveryError>(),
            Some(RecoveryError::InvalidGapLimit(0))
        ));
    }

    #[test]
    fn test_derivation_failure_surfaces() {
        let mut window = AddressWindow::new();
        let err = window.expand(&FailingKeyChain, 0, 5).unwrap_err();
        match err.downcast_ref::<RecoveryError>() {
            Some(RecoveryError::Derivation { index, reason }) => {
                assert_eq!(*index, 3);
                assert!(reason.contains("disconnected"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        // addresses derived before the failure stay watched
        assert_eq!(window.len(), 3);
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let mut window = AddressWindow::new();
        let err = window.expand(&ConstantKeyChain, 0, 2).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RecoveryError>(),
            Some(RecoveryError::DuplicateAddress { index: 1, existing: 0, .. })
        ));
    }
}
