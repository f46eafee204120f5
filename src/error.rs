//! Error taxonomy of the engine
//!
//! Every failure a caller can observe maps onto one `EngineError` kind, so an
//! API layer can tell "your code does not compile" (a `CompilationOutcome`,
//! not an error) apart from "there is no evaluator test" and from "the store
//! is unavailable".

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Connection-class failure that survived every reconnect attempt
    #[error("record store unavailable after {attempts} reconnect attempts: {source}")]
    Unavailable {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },
    #[error("record store error: {0}")]
    Query(#[from] sqlx::Error),
    #[error("malformed stored record: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to create workspace at {path}: {source}")]
    WorkspaceCreateFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no source files were provided")]
    NoSourceProvided,
    #[error("could not determine the contract name from the submission")]
    NoContractName,
    #[error("invalid file name: {0}")]
    InvalidFileName(String),
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("no evaluator test registered for lesson {0}")]
    TestSpecNotFound(i64),
    #[error("toolchain did not finish within {0:?}")]
    Timeout(Duration),
    #[error("failed to launch `{program}`: {source}")]
    Toolchain {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Stable machine-readable kind, used as the `reason` of API responses
    pub fn reason(&self) -> &'static str {
        match self {
            Self::WorkspaceCreateFailed { .. } => "ERR_WORKSPACE_CREATE_FAILED",
            Self::NoSourceProvided => "ERR_NO_SOURCE_PROVIDED",
            Self::NoContractName => "ERR_NO_CONTRACT_NAME",
            Self::InvalidFileName(_) | Self::InvalidIdentifier(_) => "ERR_INVALID_ARGUMENT",
            Self::TestSpecNotFound(_) => "ERR_TEST_SPEC_NOT_FOUND",
            Self::Timeout(_) => "ERR_TIMEOUT",
            Self::Store(StoreError::Unavailable { .. }) => "ERR_STORE_UNAVAILABLE",
            Self::Store(_) => "ERR_EXTERNAL",
            Self::Toolchain { .. } | Self::Io(_) => "ERR_INTERNAL",
        }
    }

    /// Whether the error was caused by the request rather than the service
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::NoSourceProvided
                | Self::NoContractName
                | Self::InvalidFileName(_)
                | Self::InvalidIdentifier(_)
        )
    }
}
