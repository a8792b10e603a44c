//! Configuration parsing errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("KDL parse error: {0}")]
    Parse(#[from] kdl::KdlError),

    #[error("TOML parse error in {file}: {source}")]
    Toml {
        file: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("duplicate definition: {0}")]
    Duplicate(String),

    #[error("inconsistent manifest pair: {0}")]
    Inconsistent(String),

    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<ConfigError> for layerkit_core::Error {
    fn from(err: ConfigError) -> Self {
        layerkit_core::Error::Manifest(err.to_string())
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
