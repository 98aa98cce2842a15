use std::sync::Arc;

use alloy_primitives::{Address, B256, U256};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::action::{Action, ActionError, Target};
use super::nonce::NonceTracker;
use super::tx::{LegacyTransaction, SignedTransaction};
use crate::config::BrokerConfig;
use crate::ledger::{CallRequest, Ledger, Receipt, RpcError, RpcErrorKind};
use crate::vault::Wallet;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// The request can never succeed as built; retrying is pointless.
    #[error("critical transaction error in {action}: {reason}")]
    Critical { action: String, reason: String },

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// Mined with success status.
    Confirmed(Receipt),
    /// Accepted by the node; not waited for.
    Sent(B256),
    /// Nothing to send for this action name.
    Skipped,
}

/// A nonce whose transactions did not confirm in time. Every hash sent at
/// that nonce stays here, since any one of them may be the one that is mined.
#[derive(Debug, Clone)]
struct Stuck {
    nonce: u64,
    gas_price: u128,
    hashes: Vec<B256>,
}

enum Attempt {
    Confirmed(Receipt),
    Retry,
}

enum AttemptError {
    Critical(String),
    Transient(RpcError),
}

impl From<RpcError> for AttemptError {
    fn from(e: RpcError) -> Self {
        match e.kind() {
            RpcErrorKind::Reverted | RpcErrorKind::Malformed => {
                AttemptError::Critical(e.to_string())
            }
            _ => AttemptError::Transient(e),
        }
    }
}

/// Sole sender of transactions for the worker account.
///
/// Holding it by `&mut` is what keeps nonces from colliding, so the process
/// owns exactly one.
pub struct TransactionBroker<L> {
    ledger: Arc<L>,
    wallet: Wallet,
    chain_id: u64,
    worker: Address,
    market: Address,
    config: BrokerConfig,
    nonces: NonceTracker,
}

impl<L: Ledger> TransactionBroker<L> {
    pub fn new(
        ledger: Arc<L>,
        wallet: Wallet,
        chain_id: u64,
        worker: Address,
        market: Address,
        config: BrokerConfig,
    ) -> Self {
        Self {
            ledger,
            wallet,
            chain_id,
            worker,
            market,
            config,
            nonces: NonceTracker::new(),
        }
    }

    pub fn account(&self) -> Address {
        self.wallet.address()
    }

    fn target(&self, action: &Action) -> Address {
        match action.target() {
            Target::WorkerNode => self.worker,
            Target::Market => self.market,
        }
    }

    /// Submits `action` and waits until it is mined successfully, retrying
    /// through transient failures for as long as it takes. A confirmed
    /// `provideResults` is followed by `checkJobQueue`.
    pub async fn submit(&mut self, action: Action) -> Result<Submission, BrokerError> {
        let receipt = self.submit_confirmed(&action).await?;
        if let Some(next) = action.follow_up() {
            self.submit_confirmed(&next).await?;
        }
        Ok(Submission::Confirmed(receipt))
    }

    /// Like [`submit`](Self::submit) for an action given by name. Unknown
    /// names are skipped.
    pub async fn submit_named(
        &mut self,
        name: &str,
        arg: Option<&str>,
    ) -> Result<Submission, BrokerError> {
        match Action::parse(name, arg) {
            Ok(action) => self.submit(action).await,
            Err(ActionError::Unknown(name)) => {
                warn!(action = %name, "unknown state transaction, skipped");
                Ok(Submission::Skipped)
            }
            Err(e) => Err(BrokerError::Critical {
                action: name.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Sends `action` once without waiting for a receipt.
    pub async fn submit_unconfirmed(&mut self, action: Action) -> Result<Submission, BrokerError> {
        let pending = self.ledger.pending_nonce(self.account()).await?;
        let nonce = self.nonces.assign(pending);
        let signed = match self.prepare(&action, nonce, None).await {
            Ok((signed, _)) => signed,
            Err(AttemptError::Critical(reason)) => return Err(self.critical(&action, reason)),
            Err(AttemptError::Transient(e)) => return Err(e.into()),
        };
        let hash = self
            .ledger
            .send_raw_transaction(signed.raw)
            .await
            .map_err(|e| match AttemptError::from(e) {
                AttemptError::Critical(reason) => self.critical(&action, reason),
                AttemptError::Transient(e) => e.into(),
            })?;
        self.nonces.commit(nonce);
        debug!(action = action.method(), nonce, %hash, "transaction sent without waiting");
        Ok(Submission::Sent(hash))
    }

    fn critical(&self, action: &Action, reason: String) -> BrokerError {
        error!(action = action.method(), %reason, "critical transaction error");
        BrokerError::Critical {
            action: action.method().to_string(),
            reason,
        }
    }

    async fn submit_confirmed(&mut self, action: &Action) -> Result<Receipt, BrokerError> {
        let mut stuck = None;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.attempt(action, &mut stuck).await {
                Ok(Attempt::Confirmed(receipt)) => return Ok(receipt),
                Ok(Attempt::Retry) => {}
                Err(AttemptError::Critical(reason)) => return Err(self.critical(action, reason)),
                Err(AttemptError::Transient(e)) => {
                    warn!(
                        action = action.method(),
                        attempt,
                        error = %e,
                        "transaction attempt failed"
                    )
                }
            }
            tokio::time::sleep(self.config.delay_for_attempt(attempt)).await;
        }
    }

    /// One pass of nonce, gas, sign, send and wait.
    async fn attempt(
        &mut self,
        action: &Action,
        stuck: &mut Option<Stuck>,
    ) -> Result<Attempt, AttemptError> {
        if let Some(previous) = stuck.clone()
            && let Some(receipt) = self.find_receipt(&previous.hashes).await?
        {
            // Mined after we stopped waiting.
            *stuck = None;
            self.nonces.commit(previous.nonce);
            if receipt.success {
                info!(
                    action = action.method(),
                    nonce = previous.nonce,
                    tx = %receipt.transaction_hash,
                    "late receipt confirmed transaction"
                );
                return Ok(Attempt::Confirmed(receipt));
            }
            warn!(action = action.method(), nonce = previous.nonce, "late receipt reports failure");
        }

        let pending = self.ledger.pending_nonce(self.account()).await?;
        let (nonce, replacing) = match stuck.clone() {
            Some(previous) if pending < previous.nonce => {
                warn!(
                    action = action.method(),
                    stuck_nonce = previous.nonce,
                    pending,
                    "stuck transaction evicted, following the ledger count"
                );
                self.nonces.reset(pending);
                *stuck = None;
                (pending, None)
            }
            Some(previous) if pending > previous.nonce => {
                // None of our hashes has a receipt, so another transaction used it.
                warn!(
                    action = action.method(),
                    stuck_nonce = previous.nonce,
                    pending,
                    "stuck nonce consumed elsewhere, moving on"
                );
                self.nonces.commit(previous.nonce);
                *stuck = None;
                (self.nonces.assign(pending), None)
            }
            Some(previous) => (previous.nonce, Some(previous)),
            None => (self.nonces.assign(pending), None),
        };

        let previous_price = replacing.as_ref().map(|p| p.gas_price);
        let (signed, gas_price) = self.prepare(action, nonce, previous_price).await?;
        info!(
            action = action.method(),
            nonce,
            gas_price,
            replacement = replacing.is_some(),
            "sending transaction"
        );
        let hash = self.ledger.send_raw_transaction(signed.raw).await?;
        let mut hashes = replacing.map(|p| p.hashes).unwrap_or_default();
        hashes.push(hash);

        match self.wait_for_receipt(&hashes).await {
            Some(receipt) if receipt.success => {
                *stuck = None;
                self.nonces.commit(nonce);
                info!(
                    action = action.method(),
                    nonce,
                    tx = %receipt.transaction_hash,
                    block = receipt.block_number,
                    "transaction confirmed"
                );
                Ok(Attempt::Confirmed(receipt))
            }
            Some(receipt) => {
                *stuck = None;
                self.nonces.commit(nonce);
                warn!(
                    action = action.method(),
                    nonce,
                    gas_price,
                    tx = %receipt.transaction_hash,
                    "transaction mined with failure status"
                );
                Ok(Attempt::Retry)
            }
            None => {
                warn!(
                    action = action.method(),
                    nonce,
                    gas_price,
                    %hash,
                    timeout_secs = self.config.receipt_timeout_secs,
                    "no receipt in time, will replace"
                );
                *stuck = Some(Stuck {
                    nonce,
                    gas_price,
                    hashes,
                });
                Ok(Attempt::Retry)
            }
        }
    }

    /// First receipt found among `hashes`.
    async fn find_receipt(&self, hashes: &[B256]) -> Result<Option<Receipt>, RpcError> {
        for hash in hashes {
            if let Some(receipt) = self.ledger.transaction_receipt(*hash).await? {
                return Ok(Some(receipt));
            }
        }
        Ok(None)
    }

    /// Prices, estimates and signs `action` at `nonce`.
    async fn prepare(
        &self,
        action: &Action,
        nonce: u64,
        replacing: Option<u128>,
    ) -> Result<(SignedTransaction, u128), AttemptError> {
        let percent = u128::from(self.config.gas_price_percent);
        let mut gas_price = self.ledger.gas_price().await?.saturating_mul(percent) / 100;
        if let Some(previous) = replacing {
            gas_price = gas_price.max(previous.saturating_mul(percent) / 100);
        }

        let to = self.target(action);
        let data = action.calldata();
        let request = CallRequest::new(to, data.clone()).from(self.account());
        let gas_limit = self.ledger.estimate_gas(&request).await?;

        let tx = LegacyTransaction {
            nonce,
            gas_price,
            gas_limit,
            to,
            value: U256::ZERO,
            data,
            chain_id: self.chain_id,
        };
        let signed = tx
            .sign(self.wallet.signing_key())
            .map_err(|e| AttemptError::Critical(format!("signing failed: {e}")))?;
        Ok((signed, gas_price))
    }

    /// Polls every hash sent at one nonce. `None` when the timeout passes
    /// without a receipt for any of them.
    async fn wait_for_receipt(&self, hashes: &[B256]) -> Option<Receipt> {
        let deadline = Instant::now() + self.config.receipt_timeout();
        loop {
            match self.find_receipt(hashes).await {
                Ok(Some(receipt)) => return Some(receipt),
                Ok(None) => {}
                Err(e) => debug!(error = %e, "receipt poll failed"),
            }
            if Instant::now() + self.config.receipt_poll() > deadline {
                return None;
            }
            tokio::time::sleep(self.config.receipt_poll()).await;
        }
    }
}
