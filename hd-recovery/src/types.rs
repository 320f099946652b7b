//! Block, transaction and output reference types.
//!
//! These are the shapes the scanner consumes from a ledger source and the
//! identifiers the accumulator records. Transaction ids are kept as the hex
//! strings the node reports; nothing here interprets them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// An address derived from a key chain at a given child index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DerivedAddress {
    /// Child index on the derivation branch
    pub index: u32,
    /// Encoded address string
    pub address: String,
}

impl DerivedAddress {
    pub fn new(index: u32, address: impl Into<String>) -> Self {
        Self {
            index,
            address: address.into(),
        }
    }
}

/// Reference to a specific output of a specific transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Outpoint {
    /// Transaction id (hex)
    pub txid: String,
    /// Output index within the transaction
    pub vout: u32,
}

impl Outpoint {
    pub fn new(txid: impl Into<String>, vout: u32) -> Self {
        Self {
            txid: txid.into(),
            vout,
        }
    }
}

impl fmt::Display for Outpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

impl FromStr for Outpoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (txid, vout) = split_point(s)?;
        Ok(Self::new(txid, vout))
    }
}

/// Reference to the specific input of a specific transaction that consumes
/// an outpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Inpoint {
    /// Spending transaction id (hex)
    pub txid: String,
    /// Input index within the spending transaction
    pub vin: u32,
}

impl Inpoint {
    pub fn new(txid: impl Into<String>, vin: u32) -> Self {
        Self {
            txid: txid.into(),
            vin,
        }
    }
}

impl fmt::Display for Inpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vin)
    }
}

impl FromStr for Inpoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (txid, vin) = split_point(s)?;
        Ok(Self::new(txid, vin))
    }
}

fn split_point(s: &str) -> anyhow::Result<(&str, u32)> {
    let (txid, index) = s
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("expected <txid>:<index>, got {:?}", s))?;
    if txid.is_empty() {
        anyhow::bail!("empty txid in {:?}", s);
    }
    let index = index
        .parse::<u32>()
        .map_err(|e| anyhow::anyhow!("invalid index in {:?}: {}", s, e))?;
    Ok((txid, index))
}

/// Minimal header data needed to locate the chain tip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub hash: String,
    pub height: u64,
}

/// A transaction input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxInput {
    /// Block reward input with no previous-output reference
    Coinbase,
    /// Spend of a previous output
    Spend { prev_txid: String, prev_vout: u32 },
}

impl TxInput {
    pub fn spend(prev_txid: impl Into<String>, prev_vout: u32) -> Self {
        TxInput::Spend {
            prev_txid: prev_txid.into(),
            prev_vout,
        }
    }

    /// The outpoint this input consumes, if it is not a coinbase input.
    pub fn prev_outpoint(&self) -> Option<Outpoint> {
        match self {
            TxInput::Coinbase => None,
            TxInput::Spend {
                prev_txid,
                prev_vout,
            } => Some(Outpoint::new(prev_txid.clone(), *prev_vout)),
        }
    }
}

/// A transaction output.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TxOutput {
    /// Value in satoshis
    pub value: u64,
    /// Decoded destination addresses; empty for non-standard scripts
    pub addresses: Vec<String>,
}

impl TxOutput {
    pub fn new(value: u64, addresses: Vec<String>) -> Self {
        Self { value, addresses }
    }

    /// An output paying a single address.
    pub fn to_address(value: u64, address: impl Into<String>) -> Self {
        Self::new(value, vec![address.into()])
    }
}

/// A transaction with ordered inputs and outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub txid: String,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    pub fn new(txid: impl Into<String>, inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        Self {
            txid: txid.into(),
            inputs,
            outputs,
        }
    }

    pub fn is_coinbase(&self) -> bool {
        matches!(self.inputs.first(), Some(TxInput::Coinbase))
    }
}

/// A block as supplied by a ledger source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub hash: String,
    pub height: u64,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(hash: impl Into<String>, height: u64, transactions: Vec<Transaction>) -> Self {
        Self {
            hash: hash.into(),
            height,
            transactions,
        }
    }
}
