use crate::android::binary_xml::BinaryXmlError;
use crate::android::zip::ApkZipError;
use crate::config::ConfigError;
use crate::orchestrator::PatchStage;
use crate::patch::{MalformedManifest, SpecParseError};
use crate::sign::{SigningError, SigningMode};
use std::io;
use std::path::PathBuf;

pub type PatchResult<T> = Result<T, PatchError>;

/// Everything that can stop a patch run.
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("failed to read class file {}: {source}", path.display())]
    ClassRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The path has no file name to use as an entry name (e.g. `..`).
    #[error("class path {} has no file name", .0.display())]
    ClassName(PathBuf),

    #[error("failed to {action} archive {}: {source}", path.display())]
    Archive {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: ApkZipError,
    },

    #[error("failed to process AndroidManifest.xml: {0}")]
    Codec(#[from] BinaryXmlError),

    #[error(transparent)]
    Manifest(#[from] MalformedManifest),

    #[error(transparent)]
    Spec(#[from] SpecParseError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("signing with {mode} failed: {source}")]
    Signing {
        mode: SigningMode,
        #[source]
        source: SigningError,
    },

    /// Writing or renaming the staged archive failed; the original is untouched.
    #[error("failed to replace {}: {source}", path.display())]
    Commit {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cancelled before {0}")]
    Cancelled(&'static str),

    #[error("cannot {operation} once the patcher is {stage:?}")]
    InvalidStage {
        operation: &'static str,
        stage: PatchStage,
    },
}
