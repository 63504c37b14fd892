//! Delegated APK signing through the Android SDK tools.

use crate::config::SigningConfig;
use log::debug;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

/// Which external tool signs the patched archive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SigningMode {
    /// `apksigner` (v1 + v2/v3 schemes).
    #[default]
    ApkSigner,
    /// Legacy `jarsigner`, v1 scheme only. Discouraged: newer platforms reject v1-only APKs.
    JarSigner,
}

impl fmt::Display for SigningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SigningMode::ApkSigner => write!(f, "apksigner"),
            SigningMode::JarSigner => write!(f, "jarsigner"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    #[error("keystore {} does not exist", .0.display())]
    MissingKeystore(PathBuf),

    /// The tool could not be started at all (usually: not on `PATH`).
    #[error("failed to launch {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("{tool} exited with {status}: {stderr}")]
    Failed {
        tool: String,
        status: ExitStatus,
        stderr: String,
    },
}

/// Signs an archive in place.
pub trait Signer {
    fn sign(&self, apk: &Path, mode: SigningMode) -> Result<(), SigningError>;
}

/// Runs `apksigner` or `jarsigner` as a child process and waits for it.
#[derive(Clone, Debug)]
pub struct ExternalSigner {
    config: SigningConfig,
}

impl ExternalSigner {
    pub fn new(config: SigningConfig) -> Self {
        ExternalSigner { config }
    }

    fn key_password(&self) -> &str {
        self.config
            .key_password
            .as_deref()
            .unwrap_or(&self.config.store_password)
    }

    pub(crate) fn command(&self, apk: &Path, mode: SigningMode) -> Command {
        let config = &self.config;
        match mode {
            SigningMode::ApkSigner => {
                let mut command = Command::new(&config.apksigner);
                command
                    .arg("sign")
                    .arg("--ks")
                    .arg(&config.keystore)
                    .arg("--ks-key-alias")
                    .arg(&config.key_alias)
                    .arg("--ks-pass")
                    .arg(format!("pass:{}", config.store_password))
                    .arg("--key-pass")
                    .arg(format!("pass:{}", self.key_password()))
                    .arg(apk);
                command
            }
            SigningMode::JarSigner => {
                let mut command = Command::new(&config.jarsigner);
                command
                    .arg("-keystore")
                    .arg(&config.keystore)
                    .arg("-storepass")
                    .arg(&config.store_password)
                    .arg("-keypass")
                    .arg(self.key_password())
                    .arg("-sigalg")
                    .arg("SHA256withRSA")
                    .arg("-digestalg")
                    .arg("SHA-256")
                    .arg(apk)
                    .arg(&config.key_alias);
                command
            }
        }
    }
}

impl Signer for ExternalSigner {
    fn sign(&self, apk: &Path, mode: SigningMode) -> Result<(), SigningError> {
        if !self.config.keystore.is_file() {
            return Err(SigningError::MissingKeystore(self.config.keystore.clone()));
        }

        let mut command = self.command(apk, mode);
        let tool = command.get_program().to_string_lossy().into_owned();
        debug!("running {tool} on {}", apk.display());

        let output = command.output().map_err(|source| SigningError::Spawn {
            tool: tool.clone(),
            source,
        })?;
        if !output.status.success() {
            return Err(SigningError::Failed {
                tool,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}
