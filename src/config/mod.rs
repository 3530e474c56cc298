//! The optional user config file holding API credentials.
//!
//! The file is TOML, e.g. [`DEFAULT_CONFIG_STR`]:
//!
//! ```toml
//! api_key = "..."
//! user_id = "..."
//! ```
//!
//! A key that is present but empty explicitly disables that credential,
//! a key that is absent leaves it unset, see [`Credentials::resolve`].

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
pub use validator::Validate;
use validator::ValidationError;

pub const DEFAULT_CONFIG_STR: &str = include_str!("default.toml");

/// The file name of the config file in the home directory.
pub const CONFIG_FILE_NAME: &str = ".booru-mirror.toml";

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ConfigFileError {
    #[error("failed to read config file {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config file {}", .path.display())]
    Invalid {
        path: PathBuf,
        #[source]
        source: validator::ValidationErrors,
    },
}

#[non_exhaustive]
#[derive(Debug, Default, Deserialize, Clone, PartialEq, Eq, Validate)]
pub struct Config {
    #[validate(custom(function = "validate_api_key"))]
    pub api_key: Option<String>,
    #[validate(custom(function = "validate_user_id"))]
    pub user_id: Option<String>,
}

fn validate_api_key(api_key: &str) -> Result<(), ValidationError> {
    if api_key
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '&' | '=' | '#'))
    {
        let mut err = ValidationError::new("api_key");
        err.message = Some("api_key must not contain whitespace, `&`, `=` or `#`".into());
        return Err(err);
    }
    Ok(())
}

fn validate_user_id(user_id: &str) -> Result<(), ValidationError> {
    if !user_id.chars().all(|c| c.is_ascii_digit()) {
        let mut err = ValidationError::new("user_id");
        err.message = Some("user_id must be a number".into());
        return Err(err);
    }
    Ok(())
}

impl Config {
    /// The default location, `$HOME/.booru-mirror.toml` (`%USERPROFILE%` on Windows).
    pub fn default_path() -> Option<PathBuf> {
        std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .filter(|home| !home.is_empty())
            .map(|home| PathBuf::from(home).join(CONFIG_FILE_NAME))
    }

    /// Parse and validate the config file at `path`.
    ///
    /// If `path` does not exist, `Ok(None)` is returned unless `required` is `true`.
    ///
    /// # Errors
    ///
    /// If the file cannot be read, is not valid TOML, or fails validation.
    pub fn load(path: impl AsRef<Path>, required: bool) -> Result<Option<Self>, ConfigFileError> {
        let path = path.as_ref();
        let config = match std::fs::read_to_string(path) {
            Ok(config) => config,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound && !required => {
                return Ok(None)
            }
            Err(source) => {
                return Err(ConfigFileError::Read {
                    path: path.to_owned(),
                    source,
                })
            }
        };
        Self::parse(&config)
            .map(Some)
            .map_err(|err| err.with_path(path))
    }

    fn parse(config: &str) -> Result<Self, ConfigFileError> {
        let config = toml::from_str::<Config>(config).map_err(|source| ConfigFileError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config
            .validate()
            .map_err(|source| ConfigFileError::Invalid {
                path: PathBuf::new(),
                source,
            })?;
        Ok(config)
    }
}

impl ConfigFileError {
    fn with_path(mut self, file: &Path) -> Self {
        match &mut self {
            ConfigFileError::Read { path, .. }
            | ConfigFileError::Parse { path, .. }
            | ConfigFileError::Invalid { path, .. } => *path = file.to_owned(),
        }
        self
    }
}

/// The credentials to send, resolved from the command line and the config file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: Option<String>,
    pub user_id: Option<String>,
    /// `true` if some credential was set nowhere, not even to an empty value.
    /// The caller should then print a hint about the config file.
    pub unset: bool,
}

impl Credentials {
    /// Command line values win over the file. Empty values disable the credential.
    pub fn resolve(
        config: Option<&Config>,
        api_key: Option<String>,
        user_id: Option<String>,
    ) -> Self {
        let file_api_key = config.and_then(|config| config.api_key.clone());
        let file_user_id = config.and_then(|config| config.user_id.clone());

        let api_key = api_key.or(file_api_key);
        let user_id = user_id.or(file_user_id);
        let unset = api_key.is_none() || user_id.is_none();

        let non_empty = |value: Option<String>| value.filter(|value| !value.is_empty());
        Self {
            api_key: non_empty(api_key),
            user_id: non_empty(user_id),
            unset,
        }
    }
}
