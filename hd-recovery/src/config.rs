//! Configuration for wallet recovery.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use bitcoin::bip32::Xpub;
use bitcoin::Network;

use crate::error::RecoveryError;
use crate::keychain::{Chain, Purpose, XpubKeyChain};
use crate::ledger::BitcoindConfig;
use crate::recovery::RecoveryMode;

/// One account to recover.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountConfig {
    /// Derivation purpose, which fixes the address format
    pub purpose: Purpose,

    /// Account-level extended public key (`m/<purpose>'/<coin>'/<account>'`)
    pub xpub: String,

    /// Chains to scan under the account
    #[serde(default = "default_chains")]
    pub chains: Vec<Chain>,
}

impl AccountConfig {
    /// Key chain for `chain` under this account.
    pub fn key_chain(&self, chain: Chain, network: Network) -> anyhow::Result<XpubKeyChain> {
        XpubKeyChain::from_xpub_str(&self.xpub, self.purpose, chain, network)
    }
}

/// Recovery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Network the addresses are encoded for (bitcoin, testnet, signet, regtest)
    #[serde(default = "default_network")]
    pub network: String,

    /// bitcoind RPC endpoint
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,

    /// RPC user (basic auth)
    pub rpc_user: Option<String>,

    /// RPC password (basic auth)
    pub rpc_password: Option<String>,

    /// Per-request RPC timeout in seconds
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,

    /// Retries after an RPC transport failure
    #[serde(default = "default_rpc_max_retries")]
    pub rpc_max_retries: u32,

    /// Consecutive unused addresses watched past the last found one
    #[serde(default = "default_gap_limit")]
    pub gap_limit: u32,

    /// First height to scan
    #[serde(default = "default_start_height")]
    pub start_height: u64,

    /// Last height to scan (defaults to the chain tip)
    pub end_height: Option<u64>,

    /// How recovery drives the scan
    #[serde(default)]
    pub mode: RecoveryMode,

    /// Where to write the JSON report (stdout if unset)
    pub report_file: Option<PathBuf>,

    /// Accounts to recover
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

fn default_network() -> String {
    "bitcoin".to_string()
}

fn default_rpc_url() -> String {
    "http://127.0.0.1:8332".to_string()
}

fn default_rpc_timeout() -> u64 {
    30
}

fn default_rpc_max_retries() -> u32 {
    3
}

fn default_gap_limit() -> u32 {
    20
}

fn default_start_height() -> u64 {
    1
}

fn default_chains() -> Vec<Chain> {
    vec![Chain::External, Chain::Internal]
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            rpc_url: default_rpc_url(),
            rpc_user: None,
            rpc_password: None,
            rpc_timeout_secs: default_rpc_timeout(),
            rpc_max_retries: default_rpc_max_retries(),
            gap_limit: default_gap_limit(),
            start_height: default_start_height(),
            end_height: None,
            mode: RecoveryMode::default(),
            report_file: None,
            accounts: Vec::new(),
        }
    }
}

impl RecoveryConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {}", path.display(), e))?;
        let config: RecoveryConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.network()?;

        if self.gap_limit == 0 {
            return Err(RecoveryError::InvalidGapLimit(self.gap_limit).into());
        }
        if self.gap_limit > 10_000 {
            tracing::warn!(
                "Large gap limit ({}) means deriving many addresses per branch",
                self.gap_limit
            );
        }

        if let Some(end) = self.end_height {
            if end < self.start_height {
                return Err(RecoveryError::InvalidRange {
                    start: self.start_height,
                    end,
                }
                .into());
            }
        }

        if self.rpc_url.is_empty() {
            anyhow::bail!("rpc_url must not be empty");
        }

        if self.accounts.is_empty() {
            anyhow::bail!("At least one account must be configured");
        }

        let mut seen = Vec::new();
        for (i, account) in self.accounts.iter().enumerate() {
            Xpub::from_str(&account.xpub)
                .map_err(|e| anyhow::anyhow!("accounts[{}].xpub is not a valid xpub: {}", i, e))?;

            if account.chains.is_empty() {
                anyhow::bail!("accounts[{}] must list at least one chain", i);
            }
            for chain in &account.chains {
                let branch = (account.purpose, *chain);
                if seen.contains(&branch) {
                    anyhow::bail!(
                        "branch {}/{} is configured more than once",
                        account.purpose,
                        chain
                    );
                }
                seen.push(branch);
            }
        }

        Ok(())
    }

    /// The configured network.
    pub fn network(&self) -> anyhow::Result<Network> {
        Network::from_str(&self.network)
            .map_err(|_| anyhow::anyhow!("unknown network {:?}", self.network))
    }

    /// Connection settings for the bitcoind ledger source.
    pub fn bitcoind(&self) -> BitcoindConfig {
        BitcoindConfig {
            url: self.rpc_url.clone(),
            user: self.rpc_user.clone(),
            password: self.rpc_password.clone(),
            timeout: Duration::from_secs(self.rpc_timeout_secs),
            max_retries: self.rpc_max_retries,
            ..Default::default()
        }
    }

    /// Number of branches that will be recovered.
    pub fn branch_count(&self) -> usize {
        self.accounts.iter().map(|a| a.chains.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_XPUB: &str = "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8";

    fn account(purpose: Purpose) -> AccountConfig {
        AccountConfig {
            purpose,
            xpub: TEST_XPUB.to_string(),
            chains: default_chains(),
        }
    }

    #[test]
    fn test_default_config() {
        let config = RecoveryConfig::default();
        assert_eq!(config.gap_limit, 20);
        assert_eq!(config.start_height, 1);
        assert_eq!(config.mode, RecoveryMode::Push);
        assert_eq!(config.network().unwrap(), Network::Bitcoin);
        // no accounts yet
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_toml() {
        let toml = format!(
            r#"
network = "regtest"
rpc_url = "http://127.0.0.1:18443"
rpc_user = "user"
rpc_password = "pass"
gap_limit = 5
start_height = 100
mode = "pull"

[[accounts]]
purpose = "bip84"
xpub = "{xpub}"

[[accounts]]
purpose = "bip44"
xpub = "{xpub}"
chains = ["external"]
"#,
            xpub = TEST_XPUB
        );

        let config: RecoveryConfig = toml::from_str(&toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.network().unwrap(), Network::Regtest);
        assert_eq!(config.mode, RecoveryMode::Pull);
        assert_eq!(config.accounts[0].chains, vec![Chain::External, Chain::Internal]);
        assert_eq!(config.accounts[1].purpose, Purpose::Bip44);
        assert_eq!(config.branch_count(), 3);

        let rpc = config.bitcoind();
        assert_eq!(rpc.user.as_deref(), Some("user"));
        assert_eq!(rpc.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recovery.toml");
        std::fs::write(
            &path,
            format!("[[accounts]]\npurpose = \"bip49\"\nxpub = \"{}\"\n", TEST_XPUB),
        )
        .unwrap();

        let config = RecoveryConfig::from_file(&path).unwrap();
        assert_eq!(config.accounts.len(), 1);

        assert!(RecoveryConfig::from_file(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_validate_gap_limit() {
        let config = RecoveryConfig {
            gap_limit: 0,
            accounts: vec![account(Purpose::Bip84)],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RecoveryError>(),
            Some(RecoveryError::InvalidGapLimit(0))
        ));
    }

    #[test]
    fn test_validate_invalid_range() {
        let config = RecoveryConfig {
            start_height: 100,
            end_height: Some(50),
            accounts: vec![account(Purpose::Bip84)],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RecoveryError>(),
            Some(RecoveryError::InvalidRange { start: 100, end: 50 })
        ));
    }

    #[test]
    fn test_validate_bad_xpub_and_network() {
        let mut config = RecoveryConfig {
            accounts: vec![AccountConfig {
                xpub: "zpub-nonsense".to_string(),
                ..account(Purpose::Bip84)
            }],
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.accounts = vec![account(Purpose::Bip84)];
        config.network = "moonnet".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_duplicate_branch() {
        let config = RecoveryConfig {
            accounts: vec![account(Purpose::Bip84), account(Purpose::Bip84)],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("bip84/external"));
    }
}
