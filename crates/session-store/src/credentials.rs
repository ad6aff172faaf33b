use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

const DEFAULT_USERNAME: &str = "admin";
const DEFAULT_PASSWORD: &str = "admin123";

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("failed to read credentials file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write credentials file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse credentials file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yml::Error,
    },

    #[error("failed to serialize credentials: {0}")]
    Serialize(#[from] serde_yml::Error),
}

/// The single username/password pair allowed to log in.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            username: DEFAULT_USERNAME.to_string(),
            password: DEFAULT_PASSWORD.to_string(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Load credentials from a YAML file, creating it with the default
    /// `admin` / `admin123` pair if it does not exist yet.
    pub fn load_or_init(path: &Path) -> Result<Self, CredentialsError> {
        if !path.exists() {
            let credentials = Self::default();
            credentials.save(path)?;
            warn!(
                path = %path.display(),
                "credentials file not found; wrote default credentials, change them before exposing this server"
            );
            return Ok(credentials);
        }

        let contents = std::fs::read_to_string(path).map_err(|source| CredentialsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let credentials: Self =
            serde_yml::from_str(&contents).map_err(|source| CredentialsError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        info!(path = %path.display(), username = %credentials.username, "loaded credentials");
        Ok(credentials)
    }

    /// Write the credentials as YAML, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), CredentialsError> {
        let write_err = |source| CredentialsError::Write {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let yaml = serde_yml::to_string(self)?;
        std::fs::write(path, yaml).map_err(write_err)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(write_err)?;
        }
        Ok(())
    }

    /// Constant-time check of both fields. Both comparisons always run.
    pub fn verify(&self, username: &str, password: &str) -> bool {
        let user_ok = timing_safe_eq(&self.username, username);
        let pass_ok = timing_safe_eq(&self.password, password);
        user_ok & pass_ok
    }
}

/// Timing-safe string equality.
pub fn timing_safe_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut out = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        out |= x ^ y;
    }
    out == 0
}
