mod broker;
mod cli;
mod config;
mod error;
mod ipfs;
mod ledger;
mod orchestrator;
mod pipeline;
mod state_machine;
mod synchronizer;
mod telemetry;
mod vault;

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use broker::{Submission, TransactionBroker};
use cli::{Cli, Command, VaultCommand};
use config::NodeConfig;
use ipfs::IpfsClient;
use ledger::{JsonRpcClient, Ledger};
use orchestrator::{Exit, Orchestrator};
use pipeline::CommandPipeline;
use telemetry::{NodeStatus, StatusBoard};
use vault::Vault;

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

fn load_config(path: &Path, password: Option<String>) -> Result<NodeConfig> {
    let mut config = NodeConfig::load(path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    if let Some(password) = password {
        config.vault.passphrase = password;
    }
    Ok(config)
}

async fn log_status(mut status: watch::Receiver<NodeStatus>) {
    while status.changed().await.is_ok() {
        let snapshot = status.borrow_and_update().clone();
        match serde_json::to_string(&snapshot) {
            Ok(json) => debug!(status = %json, "node status"),
            Err(e) => warn!(error = %e, "cannot serialize node status"),
        }
    }
}

/// Starts a fresh copy of this process with the same arguments.
fn relaunch() -> Result<()> {
    let exe = std::env::current_exe().context("cannot locate own executable")?;
    let child = std::process::Command::new(&exe)
        .args(std::env::args_os().skip(1))
        .spawn()
        .with_context(|| format!("cannot relaunch {}", exe.display()))?;
    info!(pid = child.id(), "relaunched node");
    Ok(())
}

async fn run_node(config: NodeConfig, no_restart: bool) -> Result<ExitCode> {
    let ledger = Arc::new(JsonRpcClient::new(config.ledger.rpc_url.clone())?);
    let wallet = Vault::open(&config.vault.path, &config.vault.passphrase, config.vault.account)
        .with_context(|| format!("cannot open vault {}", config.vault.path.display()))?;
    let pipeline = Arc::new(CommandPipeline::new(config.pipeline.clone()));
    let store = Arc::new(IpfsClient::with_base_url(config.content.ipfs_url.clone())?);
    let board = Arc::new(StatusBoard::new());
    tokio::spawn(log_status(board.subscribe()));

    info!(
        rpc = %config.ledger.rpc_url,
        worker = %config.ledger.worker_contract,
        "starting worker node"
    );
    let exit = match Orchestrator::start(config, ledger, wallet, pipeline, store, board).await {
        Ok(orchestrator) => orchestrator.run().await,
        Err(e) => Err(e),
    };

    match exit {
        Ok(Exit::Shutdown) => Ok(ExitCode::SUCCESS),
        Ok(Exit::Restart) if no_restart => {
            warn!("relaunch disabled, exiting");
            Ok(ExitCode::FAILURE)
        }
        Ok(Exit::Restart) => {
            relaunch()?;
            Ok(ExitCode::FAILURE)
        }
        Err(e) => {
            error!(kind = %e.kind(), error = %e, "worker node stopped");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn transact(config: NodeConfig, name: &str, arg: Option<&str>) -> Result<ExitCode> {
    config.validate()?;
    let ledger = Arc::new(JsonRpcClient::new(config.ledger.rpc_url.clone())?);
    let wallet = Vault::open(&config.vault.path, &config.vault.passphrase, config.vault.account)?;
    let chain_id = match config.ledger.chain_id {
        Some(id) => id,
        None => ledger.chain_id().await?,
    };
    let mut broker = TransactionBroker::new(
        ledger,
        wallet,
        chain_id,
        config.ledger.worker_contract,
        config.ledger.market_contract,
        config.broker,
    );
    match broker.submit_named(name, arg).await? {
        Submission::Confirmed(receipt) => {
            info!(tx = %receipt.transaction_hash, success = receipt.success, "transaction mined");
            Ok(if receipt.success { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Submission::Sent(hash) => {
            info!(tx = %hash, "transaction sent");
            Ok(ExitCode::SUCCESS)
        }
        Submission::Skipped => {
            warn!(name, "unknown action, nothing sent");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Command::Run { password, no_restart } => {
            run_node(load_config(&cli.config, password)?, no_restart).await
        }
        Command::Vault {
            command: VaultCommand::Seal { account, private_key, password },
        } => {
            let config = load_config(&cli.config, password)?;
            Vault::seal(&config.vault.path, &config.vault.passphrase, account, &private_key)?;
            info!(%account, path = %config.vault.path.display(), "vault sealed");
            Ok(ExitCode::SUCCESS)
        }
        Command::Transact { name, arg, password } => {
            transact(load_config(&cli.config, password)?, &name, arg.as_deref()).await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
