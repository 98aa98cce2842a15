mod action;
mod nonce;
mod submit;
pub(crate) mod tx;

pub use action::{Action, ActionError, Target};
pub use nonce::NonceTracker;
pub use submit::{BrokerError, Submission, TransactionBroker};
pub use tx::{LegacyTransaction, SignedTransaction};
