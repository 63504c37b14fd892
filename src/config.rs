//! Optional TOML settings, mostly for signing.
//!
//! ```toml
//! [signing]
//! keystore = "/home/me/release.jks"
//! key_alias = "release"
//! store_password = "hunter2"
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Overrides `signing.store_password` when set.
pub const KEYSTORE_PASSWORD_ENV: &str = "APKPATCH_KEYSTORE_PASSWORD";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PatcherConfig {
    pub signing: SigningConfig,
}

/// Tool locations and key material handed to the external signer.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SigningConfig {
    pub apksigner: PathBuf,
    pub jarsigner: PathBuf,
    pub keystore: PathBuf,
    pub key_alias: String,
    pub store_password: String,
    /// Falls back to `store_password`.
    pub key_password: Option<String>,
}

impl Default for SigningConfig {
    fn default() -> Self {
        SigningConfig {
            apksigner: PathBuf::from("apksigner"),
            jarsigner: PathBuf::from("jarsigner"),
            keystore: default_keystore(),
            key_alias: "androiddebugkey".to_string(),
            store_password: "android".to_string(),
            key_password: None,
        }
    }
}

/// `~/.android/debug.keystore`, the keystore Android tooling creates for debug builds.
fn default_keystore() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".android")
        .join("debug.keystore")
}

impl PatcherConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Apply environment overrides; `lookup` is usually `|key| std::env::var(key).ok()`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(password) = lookup(KEYSTORE_PASSWORD_ENV) {
            self.signing.store_password = password;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_gives_debug_defaults() {
        let config = PatcherConfig::parse("").unwrap();
        assert_eq!(config, PatcherConfig::default());
        assert_eq!(config.signing.key_alias, "androiddebugkey");
        assert!(config.signing.keystore.ends_with(".android/debug.keystore"));
    }

    #[test]
    fn partial_signing_table_keeps_other_defaults() {
        let config = PatcherConfig::parse(
            r#"
            [signing]
            keystore = "/keys/release.jks"
            key_password = "k"
            "#,
        )
        .unwrap();
        assert_eq!(config.signing.keystore, PathBuf::from("/keys/release.jks"));
        assert_eq!(config.signing.key_password.as_deref(), Some("k"));
        assert_eq!(config.signing.store_password, "android");
        assert_eq!(config.signing.apksigner, PathBuf::from("apksigner"));
    }

    #[test]
    fn load_reports_path_on_errors() {
        let mut file = tempfile::NamedTempFile::new().expect("temp config");
        write!(file, "[signing\nkeystore = 1").expect("write config");
        let err = PatcherConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains(&file.path().display().to_string()));

        let err = PatcherConfig::load(Path::new("/nonexistent/apkpatch.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn environment_overrides_store_password() {
        let mut config = PatcherConfig::default();
        config.apply_env_overrides(|key| (key == KEYSTORE_PASSWORD_ENV).then(|| "env".to_string()));
        assert_eq!(config.signing.store_password, "env");

        config.apply_env_overrides(|_| None);
        assert_eq!(config.signing.store_password, "env");
    }
}
