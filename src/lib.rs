//! # apkpatch
//!
//! Patch an APK in place: inject dex files, and add or remove permissions, instrumentation,
//! broadcast receivers and other `<application>` children in its binary `AndroidManifest.xml`,
//! then re-sign it.
//!
//! ```no_run
//! use apkpatch::{
//!     run_patch, CancelFlag, ExternalSigner, LogReporter, PatchOptions, PatchRequest, SigningConfig,
//! };
//! use std::path::PathBuf;
//!
//! let options = PatchOptions {
//!     apk_path: PathBuf::from("app.apk"),
//!     request: PatchRequest {
//!         add_permissions: vec!["android.permission.INTERNET".to_string()],
//!         ..PatchRequest::default()
//!     },
//!     ..PatchOptions::default()
//! };
//! let signer = ExternalSigner::new(SigningConfig::default());
//! let summary = run_patch(&options, &signer, &mut LogReporter, &CancelFlag::new()).unwrap();
//! println!("{:?}", summary.manifest);
//! ```

pub mod android;
pub mod cli;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod patch;
pub mod sign;
mod tests;

pub use cli::Cli;
pub use config::{PatcherConfig, SigningConfig};
pub use error::{PatchError, PatchResult};
pub use orchestrator::{
    run_patch, ArchivePatcher, CancelFlag, ManifestOutcome, PatchOptions, PatchStage,
    PatchSummary,
};
pub use patch::{
    apply_patch, LogReporter, PatchEvent, PatchReporter, PatchRequest, ReceiverActions, TagSpec,
};
pub use sign::{ExternalSigner, Signer, SigningMode};
