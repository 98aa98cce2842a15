//! Interface de linha de comando do nó worker baseada em clap.

use std::path::PathBuf;

use alloy_primitives::Address;
use clap::{Parser, Subcommand};

use crate::config::DEFAULT_PATH;

/// Worker node of a ledger-based cognitive computing market.
#[derive(Debug, Parser)]
#[command(name = "cognode", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração TOML.
    #[arg(long, short, global = true, default_value = DEFAULT_PATH)]
    pub config: PathBuf,

    /// Habilita logs em nível debug, a menos que RUST_LOG diga outra coisa.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Executa o nó worker até ser interrompido.
    Run {
        /// Vault passphrase; falls back to config and COGNODE_VAULT_PASSPHRASE.
        #[arg(long)]
        password: Option<String>,

        /// Exit instead of relaunching after an unrecoverable compute failure.
        #[arg(long, default_value_t = false)]
        no_restart: bool,
    },

    /// Gerencia o vault de chaves criptografado.
    Vault {
        #[command(subcommand)]
        command: VaultCommand,
    },

    /// Sends a single worker transaction and waits for its receipt.
    Transact {
        /// Contract method, e.g. `alive` or `reportProgress`.
        name: String,

        /// Argument for methods that take one.
        #[arg(long)]
        arg: Option<String>,

        #[arg(long)]
        password: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum VaultCommand {
    /// Encrypts a private key into the configured vault file.
    Seal {
        #[arg(long)]
        account: Address,

        /// Hex private key, with or without 0x.
        #[arg(long)]
        private_key: String,

        #[arg(long)]
        password: Option<String>,
    },
}
