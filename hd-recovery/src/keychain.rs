//! Key-chain collaborators.
//!
//! The recovery core only needs one capability from a key chain: turn a
//! child index into an address string, deterministically. [`XpubKeyChain`]
//! does this from an account-level extended public key; [`StaticKeyChain`]
//! produces synthetic addresses for tests and dry runs.

use std::fmt;
use std::str::FromStr;

use bitcoin::bip32::{ChildNumber, Xpub};
use bitcoin::secp256k1::{Secp256k1, VerifyOnly};
use bitcoin::{Address, Network};
use serde::{Deserialize, Serialize};

use crate::types::DerivedAddress;

/// Derives the address for a child index on a single branch.
pub trait KeyChain {
    /// Derive the address at `index`. Must be deterministic and pure.
    fn derive_address(&self, index: u32) -> anyhow::Result<String>;

    /// Derive the address at `index` together with its index.
    fn derive(&self, index: u32) -> anyhow::Result<DerivedAddress> {
        Ok(DerivedAddress::new(index, self.derive_address(index)?))
    }
}

impl<K: KeyChain + ?Sized> KeyChain for Box<K> {
    fn derive_address(&self, index: u32) -> anyhow::Result<String> {
        (**self).derive_address(index)
    }
}

impl<K: KeyChain + ?Sized> KeyChain for &K {
    fn derive_address(&self, index: u32) -> anyhow::Result<String> {
        (**self).derive_address(index)
    }
}

/// Derivation purpose, which also fixes the address format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Purpose {
    /// Legacy pay-to-pubkey-hash (m/44')
    Bip44,
    /// Nested segwit pay-to-witness-pubkey-hash (m/49')
    Bip49,
    /// Native segwit pay-to-witness-pubkey-hash (m/84')
    Bip84,
}

impl Purpose {
    /// The hardened purpose number in the derivation path.
    pub fn number(&self) -> u32 {
        match self {
            Purpose::Bip44 => 44,
            Purpose::Bip49 => 49,
            Purpose::Bip84 => 84,
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bip{}", self.number())
    }
}

/// Which chain under an account: receiving or change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    External,
    Internal,
}

impl Chain {
    pub fn index(&self) -> u32 {
        match self {
            Chain::External => 0,
            Chain::Internal => 1,
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chain::External => write!(f, "external"),
            Chain::Internal => write!(f, "internal"),
        }
    }
}

impl FromStr for Chain {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "external" | "receive" | "0" => Ok(Chain::External),
            "internal" | "change" | "1" => Ok(Chain::Internal),
            other => anyhow::bail!("unknown chain {:?}", other),
        }
    }
}

/// Key chain backed by an account-level extended public key.
///
/// Addresses are derived at `<chain>/<index>` below the account key, so the
/// xpub must be the one exported at `m/<purpose>'/<coin>'/<account>'`.
pub struct XpubKeyChain {
    account: Xpub,
    purpose: Purpose,
    chain: Chain,
    network: Network,
    secp: Secp256k1<VerifyOnly>,
}

impl XpubKeyChain {
    pub fn new(account: Xpub, purpose: Purpose, chain: Chain, network: Network) -> Self {
        Self {
            account,
            purpose,
            chain,
            network,
            secp: Secp256k1::verification_only(),
        }
    }

    /// Parse the account xpub from its base58 encoding.
    pub fn from_xpub_str(
        xpub: &str,
        purpose: Purpose,
        chain: Chain,
        network: Network,
    ) -> anyhow::Result<Self> {
        let account = Xpub::from_str(xpub)
            .map_err(|e| anyhow::anyhow!("invalid extended public key: {}", e))?;
        Ok(Self::new(account, purpose, chain, network))
    }

    pub fn purpose(&self) -> Purpose {
        self.purpose
    }

    pub fn chain(&self) -> Chain {
        self.chain
    }
}

impl KeyChain for XpubKeyChain {
    fn derive_address(&self, index: u32) -> anyhow::Result<String> {
        let path = [
            ChildNumber::from_normal_idx(self.chain.index())?,
            ChildNumber::from_normal_idx(index)?,
        ];
        let child = self.account.derive_pub(&self.secp, &path)?;
        let pubkey = child.to_pub();

        let address = match self.purpose {
            Purpose::Bip44 => Address::p2pkh(pubkey.pubkey_hash(), self.network),
            Purpose::Bip49 => Address::p2shwpkh(&pubkey, self.network),
            Purpose::Bip84 => Address::p2wpkh(&pubkey, self.network),
        };

        Ok(address.to_string())
    }
}

/// Deterministic synthetic key chain: index `i` maps to `<prefix><i>`.
#[derive(Debug, Clone)]
pub struct StaticKeyChain {
    prefix: String,
}

impl StaticKeyChain {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The address this chain yields at `index`.
    pub fn address(&self, index: u32) -> String {
        format!("{}{}", self.prefix, index)
    }
}

impl KeyChain for StaticKeyChain {
    fn derive_address(&self, index: u32) -> anyhow::Result<String> {
        Ok(self.address(index))
    }
}
