//! In-memory ledger.
//!
//! Holds a contiguous chain of blocks starting at a genesis block at height
//! zero. Blocks can be appended while a recovery is running, which is how
//! tests exercise a growing chain tip.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;

use super::LedgerSource;
use crate::types::{Block, BlockHeader, Transaction};

#[derive(Debug, Default)]
struct Inner {
    blocks: Vec<Block>,
    failing_heights: HashSet<u64>,
    blocks_served: u64,
}

/// Ledger backed by a vector of blocks.
#[derive(Debug)]
pub struct MemoryLedger {
    inner: Mutex<Inner>,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedger {
    /// Create a ledger containing only an empty genesis block.
    pub fn new() -> Self {
        let genesis = Block::new(block_hash_for(0), 0, Vec::new());
        Self {
            inner: Mutex::new(Inner {
                blocks: vec![genesis],
                ..Default::default()
            }),
        }
    }

    /// Append a block containing `transactions`; returns its height.
    pub fn push_block(&self, transactions: Vec<Transaction>) -> u64 {
        let mut inner = self.lock();
        let height = inner.blocks.len() as u64;
        inner
            .blocks
            .push(Block::new(block_hash_for(height), height, transactions));
        height
    }

    /// Append empty blocks until the tip reaches `height`.
    pub fn extend_to(&self, height: u64) {
        while self.tip_height() < height {
            self.push_block(Vec::new());
        }
    }

    /// Height of the last block.
    pub fn tip_height(&self) -> u64 {
        (self.lock().blocks.len() as u64).saturating_sub(1)
    }

    /// Make every fetch of the block at `height` fail.
    pub fn fail_at(&self, height: u64) {
        self.lock().failing_heights.insert(height);
    }

    /// Number of full blocks handed out so far.
    pub fn blocks_served(&self) -> u64 {
        self.lock().blocks_served
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // a poisoned lock only means a test panicked mid-push; the data is still usable
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn block_hash_for(height: u64) -> String {
    format!("{:064x}", height)
}

fn height_for(hash: &str) -> anyhow::Result<u64> {
    u64::from_str_radix(hash, 16).map_err(|_| anyhow::anyhow!("unknown block hash {}", hash))
}

#[async_trait]
impl LedgerSource for MemoryLedger {
    async fn best_block_hash(&self) -> anyhow::Result<String> {
        Ok(block_hash_for(self.tip_height()))
    }

    async fn header(&self, hash: &str) -> anyhow::Result<BlockHeader> {
        let height = height_for(hash)?;
        let inner = self.lock();
        let block = inner
            .blocks
            .get(height as usize)
            .ok_or_else(|| anyhow::anyhow!("unknown block hash {}", hash))?;
        Ok(BlockHeader {
            hash: block.hash.clone(),
            height: block.height,
        })
    }

    async fn block_hash(&self, height: u64) -> anyhow::Result<String> {
        let inner = self.lock();
        inner
            .blocks
            .get(height as usize)
            .map(|b| b.hash.clone())
            .ok_or_else(|| anyhow::anyhow!("block height {} out of range", height))
    }

    async fn block(&self, hash: &str) -> anyhow::Result<Block> {
        let height = height_for(hash)?;
        let mut inner = self.lock();
        if inner.failing_heights.contains(&height) {
            anyhow::bail!("injected failure fetching block {}", height);
        }
        let block = inner
            .blocks
            .get(height as usize)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown block hash {}", hash))?;
        inner.blocks_served += 1;
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TxInput, TxOutput};

    #[tokio::test]
    async fn test_genesis_only() {
        let ledger = MemoryLedger::new();
        assert_eq!(ledger.chain_tip_height().await.unwrap(), 0);
        let genesis = ledger.block_at(0).await.unwrap();
        assert!(genesis.transactions.is_empty());
    }

    #[tokio::test]
    async fn test_push_and_fetch() {
        let ledger = MemoryLedger::new();
        let tx = Transaction::new(
            "cb1",
            vec![TxInput::Coinbase],
            vec![TxOutput::to_address(50, "a0")],
        );
        let height = ledger.push_block(vec![tx.clone()]);
        assert_eq!(height, 1);
        assert_eq!(ledger.chain_tip_height().await.unwrap(), 1);

        let block = ledger.block_at(1).await.unwrap();
        assert_eq!(block.height, 1);
        assert_eq!(block.transactions, vec![tx]);
        assert_eq!(ledger.blocks_served(), 1);
    }

    #[tokio::test]
    async fn test_out_of_range() {
        let ledger = MemoryLedger::new();
        assert!(ledger.block_hash(5).await.is_err());
        assert!(ledger.block("zz").await.is_err());
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let ledger = MemoryLedger::new();
        ledger.extend_to(3);
        ledger.fail_at(2);
        assert!(ledger.block_at(1).await.is_ok());
        let err = ledger.block_at(2).await.unwrap_err();
        assert!(err.to_string().contains("injected failure"));
    }
}
