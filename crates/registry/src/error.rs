use kstore_core::{CodecError, ConversionError, FieldErrors};
use kstore_store::StoreError;
use thiserror::Error;

/// Per-request failures of a registry verb. None of them are fatal to the process.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{resource} \"{key}\" not found")]
    NotFound { resource: String, key: String },

    #[error("{resource} is namespaced but the request carries no namespace")]
    NamespaceNotFound { resource: String },

    #[error("{resource} \"{key}\" already exists")]
    AlreadyExists { resource: String, key: String },

    #[error("{resource}: {source}")]
    Conversion {
        resource: String,
        #[source]
        source: ConversionError,
    },

    #[error("{resource} \"{key}\" is invalid: {errors}")]
    Invalid { resource: String, key: String, errors: FieldErrors },

    #[error("{resource} \"{key}\": {source}")]
    Encode {
        resource: String,
        key: String,
        #[source]
        source: CodecError,
    },

    #[error("{resource} \"{key}\": {source}")]
    Decode {
        resource: String,
        key: String,
        #[source]
        source: CodecError,
    },

    #[error("{op} {resource} \"{key}\": {source}")]
    Storage {
        op: &'static str,
        resource: String,
        key: String,
        #[source]
        source: StoreError,
    },
}

pub type RegistryResult<T> = Result<T, RegistryError>;

impl RegistryError {
    /// Conventional REST status for this failure.
    pub fn status_code(&self) -> u16 {
        match self {
            RegistryError::NotFound { .. } => 404,
            RegistryError::AlreadyExists { .. } => 409,
            RegistryError::NamespaceNotFound { .. } | RegistryError::Invalid { .. } => 400,
            RegistryError::Conversion { .. }
            | RegistryError::Encode { .. }
            | RegistryError::Decode { .. }
            | RegistryError::Storage { .. } => 500,
        }
    }

    /// Kubernetes `Status.reason` string.
    pub fn reason(&self) -> &'static str {
        match self {
            RegistryError::NotFound { .. } => "NotFound",
            RegistryError::AlreadyExists { .. } => "AlreadyExists",
            RegistryError::NamespaceNotFound { .. } => "BadRequest",
            RegistryError::Invalid { .. } => "Invalid",
            _ => "InternalError",
        }
    }

    pub fn is_not_found(&self) -> bool { matches!(self, RegistryError::NotFound { .. }) }
    pub fn is_already_exists(&self) -> bool { matches!(self, RegistryError::AlreadyExists { .. }) }
    pub fn is_invalid(&self) -> bool { matches!(self, RegistryError::Invalid { .. }) }
}
