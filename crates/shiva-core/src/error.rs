// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types and classification for storage and provider failures.
//!
//! Storage backends and provider adapters report failures in their native
//! shape ([`RawDbError`], [`RawProviderError`]). The functions in this module
//! map those into a closed set of typed errors so task handlers can decide
//! between retrying, skipping and failing permanently. Classification is pure:
//! nothing here performs I/O or logs.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

/// SQLSTATE reported for unique constraint violations.
pub const UNIQUE_VIOLATION: &str = "23505";

/// SQLSTATE reported for foreign key violations.
pub const FOREIGN_KEY_VIOLATION: &str = "23503";

/// SQLSTATE reported for NOT NULL violations.
pub const NOT_NULL_VIOLATION: &str = "23502";

/// Storage codes are SQLSTATE values, always five characters.
const STORAGE_CODE_LEN: usize = 5;

/// Message used when a storage error carries neither a message nor a detail.
pub const DEFAULT_DATABASE_MESSAGE: &str = "an unknown database error occurred";

// ============================================================================
// Storage errors
// ============================================================================

/// A storage failure exactly as the backend reported it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawDbError {
    /// Backend error code (SQLSTATE for Postgres, normalized for SQLite).
    pub code: Option<String>,
    /// Primary message.
    pub message: Option<String>,
    /// Secondary detail, when the backend provides one.
    pub detail: Option<String>,
    /// Table involved, when known.
    pub table: Option<String>,
    /// Constraint involved, when known.
    pub constraint: Option<String>,
}

impl RawDbError {
    /// Create a raw error with only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }

    /// Attach a backend error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attach a detail string.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// The message a classified error will carry: message, else detail,
    /// else [`DEFAULT_DATABASE_MESSAGE`].
    pub fn preferred_message(&self) -> String {
        self.message
            .as_deref()
            .filter(|m| !m.is_empty())
            .or_else(|| self.detail.as_deref().filter(|d| !d.is_empty()))
            .unwrap_or(DEFAULT_DATABASE_MESSAGE)
            .to_string()
    }
}

impl fmt::Display for RawDbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} (code {})", self.preferred_message(), code),
            None => write!(f, "{}", self.preferred_message()),
        }
    }
}

/// A classified storage failure. Keeps every field of the raw error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbFailure {
    /// Message chosen by [`RawDbError::preferred_message`].
    pub message: String,
    /// The original error.
    pub raw: RawDbError,
}

impl fmt::Display for DbFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Errors returned by [`crate::persistence::Store`] implementations.
///
/// Backends only ever produce [`StoreError::Raw`]; the other variants are
/// produced by [`classify_storage_error`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum StoreError {
    /// Unclassified backend failure.
    #[error("database error: {0}")]
    Raw(RawDbError),

    /// A unique constraint rejected the write.
    #[error("unique violation: {0}")]
    UniqueViolation(DbFailure),

    /// A foreign key constraint rejected the write.
    #[error("foreign key violation: {0}")]
    ForeignKeyViolation(DbFailure),

    /// A NOT NULL constraint rejected the write.
    #[error("not null violation: {0}")]
    NotNullViolation(DbFailure),

    /// Any other coded database error.
    #[error("database error: {0}")]
    Database(DbFailure),
}

impl StoreError {
    /// Whether redelivering the job could plausibly succeed.
    ///
    /// Constraint violations are deterministic; uncoded failures (pool
    /// exhaustion, dropped connections) and generic coded errors are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Raw(_) | Self::Database(_))
    }

    /// The raw error underneath, classified or not.
    pub fn raw(&self) -> &RawDbError {
        match self {
            Self::Raw(raw) => raw,
            Self::UniqueViolation(f)
            | Self::ForeignKeyViolation(f)
            | Self::NotNullViolation(f)
            | Self::Database(f) => &f.raw,
        }
    }

    /// The backend error code, if any.
    pub fn code(&self) -> Option<&str> {
        self.raw().code.as_deref()
    }
}

impl From<RawDbError> for StoreError {
    fn from(raw: RawDbError) -> Self {
        Self::Raw(raw)
    }
}

/// Classify a raw storage error by its five-character code.
///
/// Errors without a code, with a code of the wrong length, or that are
/// already classified are returned unchanged.
pub fn classify_storage_error(err: StoreError) -> StoreError {
    let StoreError::Raw(raw) = err else {
        return err;
    };

    let code = match raw.code.as_deref() {
        Some(code) if code.chars().count() == STORAGE_CODE_LEN => code.to_string(),
        _ => return StoreError::Raw(raw),
    };

    let failure = DbFailure {
        message: raw.preferred_message(),
        raw,
    };

    match code.as_str() {
        UNIQUE_VIOLATION => StoreError::UniqueViolation(failure),
        FOREIGN_KEY_VIOLATION => StoreError::ForeignKeyViolation(failure),
        NOT_NULL_VIOLATION => StoreError::NotNullViolation(failure),
        _ => StoreError::Database(failure),
    }
}

/// Convenience for classifying the error side of a store call.
pub trait ClassifyStoreResult<T> {
    /// Apply [`classify_storage_error`] to the error, if any.
    fn classified(self) -> Result<T, StoreError>;
}

impl<T> ClassifyStoreResult<T> for Result<T, StoreError> {
    fn classified(self) -> Result<T, StoreError> {
        self.map_err(classify_storage_error)
    }
}

// ============================================================================
// Provider errors
// ============================================================================

/// A provider failure as reported by the cloud API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawProviderError {
    /// Short machine code (e.g. `Throttling`, `InvalidInstanceID.NotFound`).
    pub code: Option<String>,
    /// Human readable message.
    pub message: String,
}

impl RawProviderError {
    /// Create a raw provider error.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// Create a raw provider error without a code (transport failures).
    pub fn uncoded(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    /// Whether the provider says the target resource does not exist.
    pub fn is_not_found(&self) -> bool {
        match self.code.as_deref() {
            Some(code) => {
                code.ends_with(".NotFound") || code == "NotFound" || code == "NoSuchEntity"
            }
            None => false,
        }
    }

    /// Whether the provider rejected an identifier as syntactically invalid.
    pub fn is_malformed(&self) -> bool {
        self.code
            .as_deref()
            .is_some_and(|code| code.ends_with(".Malformed"))
    }
}

impl fmt::Display for RawProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{}: {}", code, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for RawProviderError {}

/// Classified provider failures.
///
/// Typed variants keep the original error as their source along with any
/// context the caller attached.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum ProviderError {
    /// The resource being created already exists.
    #[error("resource already exists: {source}")]
    AlreadyExists {
        /// Original error.
        source: RawProviderError,
        /// Caller supplied context.
        data: Option<Value>,
    },

    /// The provider throttled the request.
    #[error("provider rate exceeded: {source}")]
    RateExceeded {
        /// Original error.
        source: RawProviderError,
        /// Caller supplied context.
        data: Option<Value>,
    },

    /// A parameter had the wrong type.
    #[error("invalid parameter type: {source}")]
    InvalidParameterType {
        /// Original error.
        source: RawProviderError,
        /// Caller supplied context.
        data: Option<Value>,
    },

    /// The provider rejected the request as invalid.
    #[error("provider validation failure: {source}")]
    ValidationFailure {
        /// Original error.
        source: RawProviderError,
        /// Caller supplied context.
        data: Option<Value>,
    },

    /// The resource is still in use and cannot be deleted yet.
    #[error("delete conflict: {source}")]
    DeleteConflict {
        /// Original error.
        source: RawProviderError,
        /// Caller supplied context.
        data: Option<Value>,
    },

    /// A code this layer does not recognize.
    #[error("provider error: {0}")]
    Unclassified(RawProviderError),
}

impl ProviderError {
    /// Whether redelivering the job could plausibly succeed.
    ///
    /// A malformed identifier is rejected the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateExceeded { .. } | Self::DeleteConflict { .. } => true,
            Self::Unclassified(raw) => !raw.is_malformed(),
            _ => false,
        }
    }

    /// Whether the desired resource is already present.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Whether the target resource is already gone.
    pub fn is_not_found(&self) -> bool {
        self.raw().is_not_found()
    }

    /// The original error.
    pub fn raw(&self) -> &RawProviderError {
        match self {
            Self::AlreadyExists { source, .. }
            | Self::RateExceeded { source, .. }
            | Self::InvalidParameterType { source, .. }
            | Self::ValidationFailure { source, .. }
            | Self::DeleteConflict { source, .. } => source,
            Self::Unclassified(raw) => raw,
        }
    }

    /// Context attached at classification time.
    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::AlreadyExists { data, .. }
            | Self::RateExceeded { data, .. }
            | Self::InvalidParameterType { data, .. }
            | Self::ValidationFailure { data, .. }
            | Self::DeleteConflict { data, .. } => data.as_ref(),
            Self::Unclassified(_) => None,
        }
    }
}

/// Map a raw provider error to its typed form.
///
/// Unrecognized codes come back as [`ProviderError::Unclassified`] with the
/// raw error untouched; `data` is dropped in that case.
pub fn classify_provider_error(raw: RawProviderError, data: Option<Value>) -> ProviderError {
    let Some(code) = raw.code.as_deref() else {
        return ProviderError::Unclassified(raw);
    };

    match code {
        "AlreadyExists" | "AlreadyExistsFault" | "EntityAlreadyExists" => {
            ProviderError::AlreadyExists { source: raw, data }
        }
        "Throttling" | "ThrottlingException" | "RequestLimitExceeded" => {
            ProviderError::RateExceeded { source: raw, data }
        }
        "InvalidParameterType" => ProviderError::InvalidParameterType { source: raw, data },
        "ValidationError" => ProviderError::ValidationFailure { source: raw, data },
        "DeleteConflict" | "ResourceInUse" | "ResourceInUseFault" => {
            ProviderError::DeleteConflict { source: raw, data }
        }
        _ => ProviderError::Unclassified(raw),
    }
}
