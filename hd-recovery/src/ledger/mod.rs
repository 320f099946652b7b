//! Ledger sources.
//!
//! A ledger source supplies headers and blocks by hash or height. The core
//! never retries a failed call; sources that talk to a remote node own their
//! retry policy and surface hard failures through `anyhow::Error`.

mod bitcoind;
mod memory;

pub use bitcoind::{BitcoindClient, BitcoindConfig};
pub use memory::MemoryLedger;

use async_trait::async_trait;

use crate::types::{Block, BlockHeader};

/// Supplier of block data.
#[async_trait]
pub trait LedgerSource: Send + Sync {
    /// Hash of the current chain tip.
    async fn best_block_hash(&self) -> anyhow::Result<String>;

    /// Header for a block hash.
    async fn header(&self, hash: &str) -> anyhow::Result<BlockHeader>;

    /// Hash of the block at `height` on the active chain.
    async fn block_hash(&self, height: u64) -> anyhow::Result<String>;

    /// Full block with transactions.
    async fn block(&self, hash: &str) -> anyhow::Result<Block>;

    /// Height of the current chain tip.
    async fn chain_tip_height(&self) -> anyhow::Result<u64> {
        let hash = self.best_block_hash().await?;
        Ok(self.header(&hash).await?.height)
    }

    /// Block at `height` on the active chain.
    async fn block_at(&self, height: u64) -> anyhow::Result<Block> {
        let hash = self.block_hash(height).await?;
        self.block(&hash).await
    }
}

#[async_trait]
impl<L: LedgerSource + ?Sized> LedgerSource for &L {
    async fn best_block_hash(&self) -> anyhow::Result<String> {
        (**self).best_block_hash().await
    }

    async fn header(&self, hash: &str) -> anyhow::Result<BlockHeader> {
        (**self).header(hash).await
    }

    async fn block_hash(&self, height: u64) -> anyhow::Result<String> {
        (**self).block_hash(height).await
    }

    async fn block(&self, hash: &str) -> anyhow::Result<Block> {
        (**self).block(hash).await
    }
}
