//! Drives one patch run over an APK: inject classes, patch the manifest, sign, commit.
//!
//! All edits happen on an in-memory copy of the archive. [`ArchivePatcher::finalize`] writes
//! that copy to a temporary file next to the original, signs it, and renames it into place,
//! so a failed run never leaves a half-patched APK behind.

use crate::android::binary_xml::AndroidManifest;
use crate::android::zip::{ApkCompression, ApkFile};
use crate::error::{PatchError, PatchResult};
use crate::patch::{apply_patch, PatchEvent, PatchReporter, PatchRequest};
use crate::sign::{Signer, SigningMode};
use log::debug;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempPath;

pub const MANIFEST_ENTRY: &str = "AndroidManifest.xml";

/// Where an [`ArchivePatcher`] is in its lifecycle. `finalize` consumes the patcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchStage {
    Opened,
    ClassesInjected,
    /// The manifest needs work but has not been patched yet (or patching failed).
    ManifestEvaluated,
    ManifestPatched,
    ManifestUnchanged,
}

/// What happened to `AndroidManifest.xml` during a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManifestOutcome {
    /// No manifest change was requested; the entry was never read.
    Skipped,
    /// Changes were requested but were already in place.
    Unchanged,
    Rewritten,
}

/// Shared flag for aborting a run before it commits.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        CancelFlag::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatchSummary {
    pub archive: PathBuf,
    pub injected: Vec<String>,
    pub manifest: ManifestOutcome,
    pub signing: SigningMode,
    pub stripped_signatures: Vec<String>,
}

pub struct ArchivePatcher {
    path: PathBuf,
    apk: ApkFile,
    stage: PatchStage,
    injected: Vec<String>,
    manifest: ManifestOutcome,
    cancel: CancelFlag,
}

impl ArchivePatcher {
    pub fn open(path: impl AsRef<Path>) -> PatchResult<Self> {
        let path = path.as_ref().to_path_buf();
        let apk = ApkFile::from_file(&path).map_err(|source| PatchError::Archive {
            action: "open",
            path: path.clone(),
            source,
        })?;
        debug!("opened {} ({} entries)", path.display(), apk.entry_names().count());
        Ok(ArchivePatcher {
            path,
            apk,
            stage: PatchStage::Opened,
            injected: Vec::new(),
            manifest: ManifestOutcome::Skipped,
            cancel: CancelFlag::default(),
        })
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn stage(&self) -> PatchStage {
        self.stage
    }

    /// Decode the manifest as it currently stands in the in-memory archive.
    pub fn manifest(&self) -> PatchResult<AndroidManifest> {
        let bytes = self.read_manifest_entry()?;
        Ok(AndroidManifest::from_bytes(&bytes)?)
    }

    /// Store each file under its base name, deflated, in input order. A later path with the
    /// same base name overwrites an earlier one.
    pub fn inject_classes(
        &mut self,
        paths: &[PathBuf],
        reporter: &mut dyn PatchReporter,
    ) -> PatchResult<()> {
        self.expect_stage("inject classes", &[PatchStage::Opened])?;
        self.check_cancelled("injecting classes")?;

        for path in paths {
            let entry = path
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or_else(|| PatchError::ClassName(path.clone()))?
                .to_string();
            let data = fs::read(path).map_err(|source| PatchError::ClassRead {
                path: path.clone(),
                source,
            })?;
            let size = data.len();
            self.apk
                .write_entry(&entry, data, ApkCompression::Deflated)
                .map_err(|source| PatchError::Archive {
                    action: "update",
                    path: self.path.clone(),
                    source,
                })?;
            reporter.report(&PatchEvent::ClassInjected {
                entry: entry.clone(),
                source: path.clone(),
                size,
            });
            if !self.injected.contains(&entry) {
                self.injected.push(entry);
            }
        }
        self.stage = PatchStage::ClassesInjected;
        Ok(())
    }

    /// Decide whether `request` needs the manifest at all. Returns `false` (and settles the
    /// manifest as untouched) when it does not.
    pub fn evaluate_patch(&mut self, request: &PatchRequest) -> PatchResult<bool> {
        self.expect_stage(
            "evaluate the manifest patch",
            &[PatchStage::Opened, PatchStage::ClassesInjected],
        )?;
        self.check_cancelled("evaluating the manifest patch")?;

        if request.touches_manifest() {
            self.stage = PatchStage::ManifestEvaluated;
            Ok(true)
        } else {
            debug!("no manifest changes requested, leaving {MANIFEST_ENTRY} alone");
            self.manifest = ManifestOutcome::Skipped;
            self.stage = PatchStage::ManifestUnchanged;
            Ok(false)
        }
    }

    /// Decode, patch and (only if something changed) re-encode the manifest entry.
    pub fn apply_patch(
        &mut self,
        request: &PatchRequest,
        reporter: &mut dyn PatchReporter,
    ) -> PatchResult<ManifestOutcome> {
        self.expect_stage("apply the manifest patch", &[PatchStage::ManifestEvaluated])?;
        self.check_cancelled("patching the manifest")?;

        let mut manifest = self.manifest()?;
        if !apply_patch(&mut manifest, request, reporter)? {
            reporter.report(&PatchEvent::ManifestUnchanged);
            self.manifest = ManifestOutcome::Unchanged;
            self.stage = PatchStage::ManifestUnchanged;
            return Ok(self.manifest);
        }

        let bytes = manifest.to_bytes()?;
        let size = bytes.len();
        self.apk
            .replace_entry(MANIFEST_ENTRY, bytes)
            .map_err(|source| PatchError::Archive {
                action: "update",
                path: self.path.clone(),
                source,
            })?;
        reporter.report(&PatchEvent::ManifestWritten { size });
        self.manifest = ManifestOutcome::Rewritten;
        self.stage = PatchStage::ManifestPatched;
        Ok(self.manifest)
    }

    /// Evaluate and, when there is work, apply `request`.
    pub fn patch_manifest(
        &mut self,
        request: &PatchRequest,
        reporter: &mut dyn PatchReporter,
    ) -> PatchResult<ManifestOutcome> {
        if self.evaluate_patch(request)? {
            self.apply_patch(request, reporter)
        } else {
            Ok(ManifestOutcome::Skipped)
        }
    }

    /// Write, sign and atomically replace the original archive.
    ///
    /// Not allowed after a failed manifest patch. Cancellation is honoured up to the moment
    /// the staged archive starts being written.
    pub fn finalize(
        mut self,
        signer: &dyn Signer,
        mode: SigningMode,
        reporter: &mut dyn PatchReporter,
    ) -> PatchResult<PatchSummary> {
        self.expect_stage(
            "finalize",
            &[
                PatchStage::Opened,
                PatchStage::ClassesInjected,
                PatchStage::ManifestPatched,
                PatchStage::ManifestUnchanged,
            ],
        )?;
        self.check_cancelled("committing the archive")?;

        let stripped = self.apk.strip_signature_entries();
        for entry in &stripped {
            reporter.report(&PatchEvent::SignatureStripped {
                entry: entry.clone(),
            });
        }
        let bytes = self.apk.to_bytes().map_err(|source| PatchError::Archive {
            action: "serialize",
            path: self.path.clone(),
            source,
        })?;

        let permissions = fs::metadata(&self.path)
            .map_err(|err| self.commit_error(err))?
            .permissions();
        let staged = self.stage_archive(&bytes)?;
        signer
            .sign(&staged, mode)
            .map_err(|source| PatchError::Signing { mode, source })?;
        reporter.report(&PatchEvent::ArchiveSigned { mode });

        // The staged file is created 0600 and the signer may have rewritten it.
        fs::set_permissions(&staged, permissions).map_err(|err| self.commit_error(err))?;
        staged
            .persist(&self.path)
            .map_err(|err| self.commit_error(err.error))?;
        debug!("replaced {}", self.path.display());

        Ok(PatchSummary {
            archive: self.path,
            injected: self.injected,
            manifest: self.manifest,
            signing: mode,
            stripped_signatures: stripped,
        })
    }

    /// Temporary file beside the original so the final rename stays on one filesystem.
    /// Dropping the returned path deletes the file.
    fn stage_archive(&self, bytes: &[u8]) -> PatchResult<TempPath> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut file = tempfile::Builder::new()
            .prefix(".apkpatch-")
            .suffix(".apk")
            .tempfile_in(dir)
            .map_err(|err| self.commit_error(err))?;
        file.write_all(bytes).map_err(|err| self.commit_error(err))?;
        file.as_file()
            .sync_all()
            .map_err(|err| self.commit_error(err))?;
        Ok(file.into_temp_path())
    }

    fn read_manifest_entry(&self) -> PatchResult<Vec<u8>> {
        self.apk
            .read_entry(MANIFEST_ENTRY)
            .map_err(|source| PatchError::Archive {
                action: "read AndroidManifest.xml from",
                path: self.path.clone(),
                source,
            })
    }

    fn commit_error(&self, source: std::io::Error) -> PatchError {
        PatchError::Commit {
            path: self.path.clone(),
            source,
        }
    }

    fn expect_stage(&self, operation: &'static str, allowed: &[PatchStage]) -> PatchResult<()> {
        if allowed.contains(&self.stage) {
            Ok(())
        } else {
            Err(PatchError::InvalidStage {
                operation,
                stage: self.stage,
            })
        }
    }

    fn check_cancelled(&self, before: &'static str) -> PatchResult<()> {
        if self.cancel.is_cancelled() {
            Err(PatchError::Cancelled(before))
        } else {
            Ok(())
        }
    }
}

/// Inputs for a full run, as collected by the command line.
#[derive(Clone, Debug, Default)]
pub struct PatchOptions {
    pub apk_path: PathBuf,
    pub classes: Vec<PathBuf>,
    pub request: PatchRequest,
    pub signing: SigningMode,
}

/// Open, inject, patch and finalize in one go.
pub fn run_patch(
    options: &PatchOptions,
    signer: &dyn Signer,
    reporter: &mut dyn PatchReporter,
    cancel: &CancelFlag,
) -> PatchResult<PatchSummary> {
    let mut patcher = ArchivePatcher::open(&options.apk_path)?.with_cancel_flag(cancel.clone());
    patcher.inject_classes(&options.classes, reporter)?;
    patcher.patch_manifest(&options.request, reporter)?;
    patcher.finalize(signer, options.signing, reporter)
}
