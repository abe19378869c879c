use strata_core::StorageError;
use strata_integrations::ErrorStatus;
use strata_integrations::ids::{
    DBUS_ERROR_CANCELLED, DBUS_ERROR_CONFLICT, DBUS_ERROR_INVALID_PATH, DBUS_ERROR_NOT_FOUND,
    DBUS_ERROR_PERSISTENCE, DBUS_ERROR_STORAGE, DBUS_ERROR_VALIDATION,
};
use thiserror::Error;

use crate::filter::FilterError;
use crate::registry::RegistryError;
use crate::resolver::ResolveError;
use crate::storage::CipherError;
use crate::store::StoreError;
use crate::sync::EngineError;
use crate::vfs::VfsError;

/// Error taxonomy every control operation reports in.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    InvalidPath(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Storage(String),
    #[error("{0}")]
    Persistence(String),
    #[error("{0}")]
    Cancelled(String),
}

impl CoreError {
    pub fn status(&self) -> ErrorStatus {
        match self {
            CoreError::NotFound(_) => ErrorStatus::NotFound,
            CoreError::InvalidPath(_) | CoreError::Validation(_) | CoreError::Conflict(_) => {
                ErrorStatus::ClientError
            }
            CoreError::Storage(_) | CoreError::Persistence(_) | CoreError::Cancelled(_) => {
                ErrorStatus::ServerError
            }
        }
    }

    pub fn dbus_error_name(&self) -> &'static str {
        match self {
            CoreError::NotFound(_) => DBUS_ERROR_NOT_FOUND,
            CoreError::InvalidPath(_) => DBUS_ERROR_INVALID_PATH,
            CoreError::Validation(_) => DBUS_ERROR_VALIDATION,
            CoreError::Conflict(_) => DBUS_ERROR_CONFLICT,
            CoreError::Storage(_) => DBUS_ERROR_STORAGE,
            CoreError::Persistence(_) => DBUS_ERROR_PERSISTENCE,
            CoreError::Cancelled(_) => DBUS_ERROR_CANCELLED,
        }
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate(_) => CoreError::Validation(err.to_string()),
            other => CoreError::Persistence(other.to_string()),
        }
    }
}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(key) => CoreError::NotFound(format!("object '{key}' not found")),
            StorageError::InvalidConnection(_) | StorageError::Url(_) => {
                CoreError::Validation(err.to_string())
            }
            other => CoreError::Storage(other.to_string()),
        }
    }
}

impl From<CipherError> for CoreError {
    fn from(err: CipherError) -> Self {
        CoreError::Persistence(format!("stored credentials are unreadable: {err}"))
    }
}

impl From<ResolveError> for CoreError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::InvalidPath { .. } => CoreError::InvalidPath(err.to_string()),
            ResolveError::BackendNotFound(_) | ResolveError::FilterNotFound(_) => {
                CoreError::NotFound(err.to_string())
            }
            ResolveError::Store(err) => err.into(),
        }
    }
}

impl From<RegistryError> for CoreError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::InvalidId(err) => err.into(),
            RegistryError::NotFound(_) => CoreError::NotFound(err.to_string()),
            RegistryError::Validation(_) => CoreError::Validation(err.to_string()),
            RegistryError::Cipher(err) => err.into(),
            RegistryError::Storage(err) => err.into(),
            RegistryError::Store(err) => err.into(),
        }
    }
}

impl From<FilterError> for CoreError {
    fn from(err: FilterError) -> Self {
        match err {
            FilterError::Validation { .. } => CoreError::Validation(err.to_string()),
            FilterError::Path(err) => err.into(),
            FilterError::NotFound(_) => CoreError::NotFound(err.to_string()),
            FilterError::Cancelled | FilterError::TimedOut(_) => {
                CoreError::Cancelled(err.to_string())
            }
            FilterError::Store(err) => err.into(),
        }
    }
}

impl From<EngineError> for CoreError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Store(err) => err.into(),
            EngineError::Resolve(err) => err.into(),
            EngineError::Registry(err) => err.into(),
            EngineError::Filter(err) => err.into(),
            EngineError::Storage(err) => err.into(),
            EngineError::Conflict(_) | EngineError::Transition(_) => {
                CoreError::Conflict(err.to_string())
            }
            EngineError::InvalidConfig(_) | EngineError::Glob(_) => {
                CoreError::Validation(err.to_string())
            }
            EngineError::NotFound(_) => CoreError::NotFound(err.to_string()),
            EngineError::Cancelled => CoreError::Cancelled(err.to_string()),
            EngineError::Io(_) => CoreError::Storage(err.to_string()),
        }
    }
}

impl From<VfsError> for CoreError {
    fn from(err: VfsError) -> Self {
        match err {
            VfsError::Resolve(err) => err.into(),
            VfsError::Registry(err) => err.into(),
            VfsError::Filter(err) => err.into(),
            VfsError::Storage(err) => err.into(),
            VfsError::Store(err) => err.into(),
            VfsError::NotFound(_) => CoreError::NotFound(err.to_string()),
            VfsError::InvalidPath { .. } => CoreError::InvalidPath(err.to_string()),
            VfsError::Validation(_)
            | VfsError::ConfirmationRequired(_)
            | VfsError::NotEmpty(_) => CoreError::Validation(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_statuses() {
        let not_found: CoreError = ResolveError::BackendNotFound("x".into()).into();
        assert_eq!(not_found.status(), ErrorStatus::NotFound);
        assert_eq!(not_found.dbus_error_name(), DBUS_ERROR_NOT_FOUND);

        let invalid: CoreError = ResolveError::InvalidPath {
            segment: ".x".into(),
            reason: "bad",
        }
        .into();
        assert_eq!(invalid.status(), ErrorStatus::ClientError);
        assert!(invalid.to_string().contains(".x"));

        let query: CoreError = FilterError::Validation {
            position: 4,
            message: "unknown field".into(),
        }
        .into();
        assert_eq!(query.dbus_error_name(), DBUS_ERROR_VALIDATION);
        assert!(query.to_string().contains("position 4"));

        let storage: CoreError = StorageError::Unreachable("down".into()).into();
        assert_eq!(storage.status(), ErrorStatus::ServerError);

        let persistence: CoreError = StoreError::MissingDataDir.into();
        assert_eq!(persistence.dbus_error_name(), DBUS_ERROR_PERSISTENCE);
    }

    #[test]
    fn duplicates_are_client_errors() {
        let err: CoreError = StoreError::Duplicate("backend 'b'".into()).into();
        assert_eq!(err.status(), ErrorStatus::ClientError);
        assert_eq!(err.to_string(), "backend 'b' already exists");
    }

    #[test]
    fn status_names_round_trip_through_the_shared_mapping() {
        for err in [
            CoreError::NotFound("a".into()),
            CoreError::InvalidPath("a".into()),
            CoreError::Validation("a".into()),
            CoreError::Conflict("a".into()),
            CoreError::Storage("a".into()),
            CoreError::Persistence("a".into()),
            CoreError::Cancelled("a".into()),
        ] {
            assert_eq!(ErrorStatus::from_error_name(err.dbus_error_name()), err.status());
        }
    }
}
