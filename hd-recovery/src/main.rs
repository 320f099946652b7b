//! HD wallet recovery CLI
//!
//! Rediscovers used addresses and unspent outputs of HD wallet accounts by
//! scanning a bitcoind node.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hd_recovery::{
    config::RecoveryConfig,
    keychain::{Chain, KeyChain},
    ledger::BitcoindClient,
    orchestrator::{Branch, WalletOrchestrator},
    recovery::{AccountRecovery, RecoveryMode},
    report::RecoveryReport,
    scanner::{BlockScanner, CancelHandle},
};

#[derive(Parser)]
#[command(name = "hd-recovery")]
#[command(about = "Recover used addresses and unspent outputs of HD wallet accounts")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "recovery.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan the chain and recover every configured branch
    Recover {
        /// First height to scan (overrides start_height)
        #[arg(long)]
        from_height: Option<u64>,

        /// Last height to scan (overrides end_height; default chain tip)
        #[arg(long)]
        to_height: Option<u64>,

        /// Scan driver: push or pull (overrides mode)
        #[arg(long)]
        mode: Option<RecoveryMode>,

        /// Write the JSON report here (overrides report_file)
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Print addresses of a configured account
    Derive {
        /// Account position in the configuration
        #[arg(short, long, default_value = "0")]
        account: usize,

        /// Chain: external or internal
        #[arg(long, default_value = "external")]
        chain: Chain,

        /// Starting index
        #[arg(short, long, default_value = "0")]
        start: u32,

        /// Number of addresses to derive
        #[arg(short = 'n', long, default_value = "10")]
        count: u32,
    },

    /// Validate configuration file
    ValidateConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    let config = match RecoveryConfig::from_file(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            if matches!(cli.command, Commands::ValidateConfig) {
                eprintln!("Configuration validation failed: {}", e);
                std::process::exit(1);
            }
            anyhow::bail!("Failed to load config from {:?}: {}", cli.config, e);
        }
    };

    match cli.command {
        Commands::Recover {
            from_height,
            to_height,
            mode,
            report,
        } => {
            let start_height = from_height.unwrap_or(config.start_height);
            let end_height = to_height.or(config.end_height);
            let mode = mode.unwrap_or(config.mode);
            let report_file = report.or_else(|| config.report_file.clone());
            run_recovery(&config, start_height, end_height, mode, report_file).await
        }
        Commands::Derive {
            account,
            chain,
            start,
            count,
        } => derive_addresses(&config, account, chain, start, count),
        Commands::ValidateConfig => {
            println!("Configuration is valid.");
            println!("  Network: {}", config.network);
            println!("  RPC URL: {}", config.rpc_url);
            println!("  Gap limit: {}", config.gap_limit);
            match config.end_height {
                Some(end) => println!("  Heights: {} - {}", config.start_height, end),
                None => println!("  Heights: {} - chain tip", config.start_height),
            }
            println!("  Mode: {:?}", config.mode);
            println!(
                "  Accounts: {} ({} branches)",
                config.accounts.len(),
                config.branch_count()
            );
            Ok(())
        }
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}

fn build_orchestrator(config: &RecoveryConfig) -> Result<WalletOrchestrator> {
    let network = config.network()?;
    let mut orchestrator = WalletOrchestrator::new();

    for account in &config.accounts {
        for chain in &account.chains {
            let key_chain = account.key_chain(*chain, network)?;
            let recovery = AccountRecovery::new(key_chain, config.gap_limit)?;
            orchestrator.add_branch(Branch::new(account.purpose, *chain), recovery)?;
        }
    }

    Ok(orchestrator)
}

/// Request cancellation on Ctrl-C; the scan stops at the next block boundary.
fn cancel_on_ctrl_c(handle: CancelHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, stopping after the current block");
            if let Err(e) = handle.cancel() {
                tracing::warn!("Could not cancel scan: {}", e);
            }
        }
    });
}

async fn run_recovery(
    config: &RecoveryConfig,
    start_height: u64,
    end_height: Option<u64>,
    mode: RecoveryMode,
    report_file: Option<PathBuf>,
) -> Result<()> {
    tracing::info!("Starting wallet recovery ({:?} mode)", mode);

    let mut orchestrator = build_orchestrator(config)?;
    let client = BitcoindClient::new(config.bitcoind())?;
    tracing::info!(
        "Recovering {} branches from {} with gap limit {}",
        orchestrator.len(),
        client.url(),
        config.gap_limit
    );

    let outcome = match mode {
        RecoveryMode::Push => {
            let mut scanner = BlockScanner::new(client);
            cancel_on_ctrl_c(scanner.cancel_handle());
            orchestrator
                .recover_push(&mut scanner, start_height, end_height)
                .await?
        }
        RecoveryMode::Pull => {
            let cancel = CancelHandle::new();
            cancel_on_ctrl_c(cancel.clone());
            orchestrator
                .recover_pull(&client, start_height, end_height, Some(&cancel))
                .await?
        }
    };

    let results = orchestrator.into_results();
    let report = RecoveryReport::new(
        config.network.clone(),
        config.gap_limit,
        start_height,
        &outcome,
        &results,
    );

    eprintln!("{}", report.summary());
    if let Some(height) = report.resume_height {
        eprintln!("Recovery interrupted; rerun with --from-height {}", height);
    }

    match report_file {
        Some(path) => {
            report.save(&path)?;
            tracing::info!("Report written to {}", path.display());
        }
        None => println!("{}", report.to_json()?),
    }

    Ok(())
}

fn derive_addresses(
    config: &RecoveryConfig,
    account: usize,
    chain: Chain,
    start: u32,
    count: u32,
) -> Result<()> {
    let account_config = config.accounts.get(account).ok_or_else(|| {
        anyhow::anyhow!(
            "account {} not configured ({} accounts)",
            account,
            config.accounts.len()
        )
    })?;
    let key_chain = account_config.key_chain(chain, config.network()?)?;

    println!(
        "Deriving {} {} addresses for account {} starting from index {}:",
        count,
        Branch::new(account_config.purpose, chain),
        account,
        start
    );
    println!();

    for i in 0..count {
        let index = start
            .checked_add(i)
            .ok_or_else(|| anyhow::anyhow!("index overflow"))?;
        println!("{}: {}", index, key_chain.derive_address(index)?);
    }

    Ok(())
}
