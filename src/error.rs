use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::transfer::{FailureKind, TransferFailure};

#[derive(Debug, Error, Diagnostic)]
pub enum CatalogError {
    #[error("invalid satellite '{value}'; supported values are {supported}")]
    InvalidSatellite { value: String, supported: String },

    #[error("invalid band code: {0}")]
    InvalidBand(String),

    #[error("invalid date: {0}")]
    InvalidDate(String),

    #[error("invalid zoom range: {0}")]
    InvalidZoomRange(String),

    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("invalid scene id: {0}")]
    InvalidSceneId(String),

    #[error("{0}")]
    Transfer(#[from] TransferFailure),

    #[error("request canceled")]
    Canceled,

    #[error("unexpected catalog response: {0}")]
    CatalogResponse(String),

    #[error(
        "exceeded the limit for request (returned {returned} of {found} scenes); select a smaller area"
    )]
    ExceededLimit { returned: usize, found: u64 },

    #[error("tile not available: {0}")]
    TileUnavailable(String),

    #[error("invalid key(s): {0}")]
    InvalidApiKeys(String),

    #[error("catalog: have invalid key: {0}")]
    InvalidKey(String),

    #[error("catalog: the last key is invalid: {0}")]
    InvalidTerminalKey(String),

    #[error("catalog: missing key: {0}")]
    MissingPath(String),

    #[error("catalog: invalid key expression: {0}")]
    InvalidKeyExpression(String),

    #[error("no scenes to process")]
    NothingToProcess,

    #[error("a scan is already running on this pipeline")]
    RunInProgress,

    #[error("scene not found in catalog: {0}")]
    SceneNotFound(String),

    #[error("missing config file catalog-tms.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl CatalogError {
    /// Folds a transfer failure into the crate error, keeping cancellation distinct.
    pub fn from_transfer(failure: TransferFailure) -> Self {
        match failure.kind {
            FailureKind::Canceled => CatalogError::Canceled,
            _ => CatalogError::Transfer(failure),
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, CatalogError::Canceled)
    }
}
