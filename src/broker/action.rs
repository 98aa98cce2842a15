use std::fmt;

use alloy_primitives::{Bytes, U256};
use thiserror::Error;

use crate::ledger::abi::{self, Token};

/// Contract a transaction is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    WorkerNode,
    Market,
}

/// Every state-advancing call this node ever sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Alive,
    AcceptAssignment,
    ProcessToDataValidation,
    AcceptValidData,
    ReportInvalidData,
    ProcessToCognition,
    /// Content reference of the uploaded result.
    ProvideResults(String),
    /// Percent complete, `0..=100`.
    ReportProgress(u8),
    CheckJobQueue,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error("unknown action {0:?}")]
    Unknown(String),

    #[error("action {action} needs an argument")]
    MissingArgument { action: &'static str },

    #[error("invalid argument {value:?} for {action}")]
    InvalidArgument { action: &'static str, value: String },
}

impl Action {
    /// Contract method name, as used on the command line and in logs.
    pub fn method(&self) -> &'static str {
        match self {
            Action::Alive => "alive",
            Action::AcceptAssignment => "acceptAssignment",
            Action::ProcessToDataValidation => "processToDataValidation",
            Action::AcceptValidData => "acceptValidData",
            Action::ReportInvalidData => "reportInvalidData",
            Action::ProcessToCognition => "processToCognition",
            Action::ProvideResults(_) => "provideResults",
            Action::ReportProgress(_) => "reportProgress",
            Action::CheckJobQueue => "checkJobQueue",
        }
    }

    pub fn signature(&self) -> &'static str {
        match self {
            Action::Alive => "alive()",
            Action::AcceptAssignment => "acceptAssignment()",
            Action::ProcessToDataValidation => "processToDataValidation()",
            Action::AcceptValidData => "acceptValidData()",
            Action::ReportInvalidData => "reportInvalidData()",
            Action::ProcessToCognition => "processToCognition()",
            Action::ProvideResults(_) => "provideResults(bytes)",
            Action::ReportProgress(_) => "reportProgress(uint8)",
            Action::CheckJobQueue => "checkJobQueue()",
        }
    }

    pub fn target(&self) -> Target {
        match self {
            Action::CheckJobQueue => Target::Market,
            _ => Target::WorkerNode,
        }
    }

    pub fn calldata(&self) -> Bytes {
        let args = match self {
            Action::ProvideResults(reference) => vec![Token::Bytes(reference.as_bytes().to_vec())],
            Action::ReportProgress(percent) => vec![Token::Uint(U256::from(*percent))],
            _ => Vec::new(),
        };
        abi::encode_call(self.signature(), &args)
    }

    /// The transaction that must follow a confirmed `self`, if any.
    pub fn follow_up(&self) -> Option<Action> {
        match self {
            Action::ProvideResults(_) => Some(Action::CheckJobQueue),
            _ => None,
        }
    }

    /// Builds an action from its method name and optional argument.
    pub fn parse(name: &str, arg: Option<&str>) -> Result<Action, ActionError> {
        let action = match name {
            "alive" => Action::Alive,
            "acceptAssignment" => Action::AcceptAssignment,
            "processToDataValidation" => Action::ProcessToDataValidation,
            "acceptValidData" => Action::AcceptValidData,
            "reportInvalidData" => Action::ReportInvalidData,
            "processToCognition" => Action::ProcessToCognition,
            "checkJobQueue" => Action::CheckJobQueue,
            "provideResults" => {
                let reference = arg.ok_or(ActionError::MissingArgument {
                    action: "provideResults",
                })?;
                Action::ProvideResults(reference.to_string())
            }
            "reportProgress" => {
                let value = arg.ok_or(ActionError::MissingArgument {
                    action: "reportProgress",
                })?;
                let percent = value
                    .parse::<u8>()
                    .ok()
                    .filter(|p| *p <= 100)
                    .ok_or_else(|| ActionError::InvalidArgument {
                        action: "reportProgress",
                        value: value.to_string(),
                    })?;
                Action::ReportProgress(percent)
            }
            other => return Err(ActionError::Unknown(other.to_string())),
        };
        Ok(action)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::ProvideResults(reference) => write!(f, "provideResults({reference})"),
            Action::ReportProgress(percent) => write!(f, "reportProgress({percent})"),
            other => write!(f, "{}()", other.method()),
        }
    }
}
