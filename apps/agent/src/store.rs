//! Credential storage
//!
//! Keeps the session token, the registered server id and the relay URL as one
//! small file per key under `<config dir>/relay-agent/`.

use anyhow::{Context, Result};
use relay_agent_common::constants::CONFIG_DIR_NAME;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Keys the agent persists between runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKey {
    SessionToken,
    ServerId,
    RelayUrl,
}

impl ConfigKey {
    /// File name the value is stored under
    pub fn file_name(self) -> &'static str {
        match self {
            Self::SessionToken => "session",
            Self::ServerId => "server_id",
            Self::RelayUrl => "url",
        }
    }
}

/// File-per-key credential store
#[derive(Debug, Clone)]
pub struct CredentialStore {
    base_dir: PathBuf,
}

impl CredentialStore {
    /// Store rooted at the user's config directory
    pub fn new() -> Result<Self> {
        Ok(Self {
            base_dir: Self::get_base_dir()?.join(CONFIG_DIR_NAME),
        })
    }

    /// Store rooted at a custom directory (for testing)
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// macOS CLIs conventionally use XDG paths rather than ~/Library
    #[cfg(target_os = "macos")]
    fn get_base_dir() -> Result<PathBuf> {
        if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME").filter(|d| !d.is_empty()) {
            return Ok(PathBuf::from(dir));
        }
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home.join(".config"))
    }

    #[cfg(not(target_os = "macos"))]
    fn get_base_dir() -> Result<PathBuf> {
        dirs::config_dir().context("Failed to get user config directory")
    }

    fn path(&self, key: ConfigKey) -> PathBuf {
        self.base_dir.join(key.file_name())
    }

    /// Read a value; a missing file reads as `None`
    pub fn read(&self, key: ConfigKey) -> Result<Option<String>> {
        let path = self.path(key);
        match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value.trim_end().to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context(format!("Failed to read {:?}", path)),
        }
    }

    /// Write a value, creating the directory if needed
    pub fn write(&self, key: ConfigKey, value: &str) -> Result<()> {
        self.ensure_dir()?;

        let path = self.path(key);
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options
            .open(&path)
            .context(format!("Failed to open {:?} for writing", path))?;
        file.write_all(value.as_bytes())
            .context(format!("Failed to write {:?}", path))?;

        Ok(())
    }

    /// Delete a value; deleting a missing key is not an error
    pub fn delete(&self, key: ConfigKey) -> Result<()> {
        let path = self.path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context(format!("Failed to delete {:?}", path)),
        }
    }

    fn ensure_dir(&self) -> Result<()> {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o750);
        }

        builder
            .create(&self.base_dir)
            .context(format!("Failed to create config directory {:?}", self.base_dir))
    }
}
