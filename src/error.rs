use std::path::PathBuf;

use thiserror::Error;

use crate::db::check::CheckStatus;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database connection lock poisoned")]
    LockPoisoned,

    #[error("Space not found: {0}")]
    SpaceNotFound(String),

    #[error("Version {version} not found in space {space}")]
    VersionNotFound { space: String, version: String },

    #[error("Resource config not found: {0}")]
    ResourceConfigNotFound(i64),

    #[error("Resource config scope not found: {0}")]
    ResourceConfigScopeNotFound(i64),

    #[error("Check not found: {0}")]
    CheckNotFound(i64),

    #[error("Check {id} cannot move from {from} to {to}")]
    InvalidCheckTransition {
        id: i64,
        from: CheckStatus,
        to: CheckStatus,
    },
}

impl StoreError {
    /// True for misconfiguration the operator has to fix, as opposed to
    /// storage failures that may go away on retry.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            StoreError::SpaceNotFound(_)
                | StoreError::VersionNotFound { .. }
                | StoreError::InvalidCheckTransition { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("Check failed: {0}")]
    Failed(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Why a check run did not complete
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error("checking lock lost")]
    LockLost,

    #[error("interrupted")]
    Interrupted,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(StoreError::SpaceNotFound("space".to_string()), true)]
    #[case(
        StoreError::VersionNotFound {
            space: "space".to_string(),
            version: r#"{"ref":"v1"}"#.to_string(),
        },
        true
    )]
    #[case(StoreError::LockPoisoned, false)]
    #[case(StoreError::Database(rusqlite::Error::QueryReturnedNoRows), false)]
    fn is_configuration_separates_misconfiguration_from_storage_failures(
        #[case] error: StoreError,
        #[case] expected: bool,
    ) {
        assert_eq!(error.is_configuration(), expected);
    }
}
