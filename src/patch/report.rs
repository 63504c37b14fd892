use crate::sign::SigningMode;
use log::info;
use std::fmt;
use std::path::PathBuf;

/// Something observable that happened while patching an archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PatchEvent {
    PermissionRemoved { name: String },
    PermissionAbsent { name: String },
    PermissionAdded { name: String },
    /// An existing grant lost its `maxSdkVersion` cap.
    PermissionWidened { name: String },
    InstrumentationAdded { name: String, target_package: String },
    ReceiverAdded { name: String },
    ActionAdded { receiver: String, action: String },
    TagRemoved { tag: String, name: String },
    TagAbsent { tag: String, name: String },
    ClassInjected { entry: String, source: PathBuf, size: usize },
    ManifestWritten { size: usize },
    ManifestUnchanged,
    SignatureStripped { entry: String },
    ArchiveSigned { mode: SigningMode },
}

impl fmt::Display for PatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchEvent::PermissionRemoved { name } => write!(f, "Removed permission: {name}"),
            PatchEvent::PermissionAbsent { name } => {
                write!(f, "Permission not present, nothing to remove: {name}")
            }
            PatchEvent::PermissionAdded { name } => write!(f, "Added permission: {name}"),
            PatchEvent::PermissionWidened { name } => {
                write!(f, "Removed maxSdkVersion from permission: {name}")
            }
            PatchEvent::InstrumentationAdded {
                name,
                target_package,
            } => write!(f, "Added instrumentation: {name} (target {target_package})"),
            PatchEvent::ReceiverAdded { name } => write!(f, "Added receiver: {name}"),
            PatchEvent::ActionAdded { receiver, action } => {
                write!(f, "Added action {action} to receiver {receiver}")
            }
            PatchEvent::TagRemoved { tag, name } => write!(f, "Removed <{tag}> {name}"),
            PatchEvent::TagAbsent { tag, name } => {
                write!(f, "No <{tag}> named {name} under <application>")
            }
            PatchEvent::ClassInjected {
                entry,
                source,
                size,
            } => write!(f, "Injected {entry} from {} ({size} bytes)", source.display()),
            PatchEvent::ManifestWritten { size } => {
                write!(f, "Rewrote AndroidManifest.xml ({size} bytes)")
            }
            PatchEvent::ManifestUnchanged => write!(f, "AndroidManifest.xml already up to date"),
            PatchEvent::SignatureStripped { entry } => {
                write!(f, "Dropped stale signature file {entry}")
            }
            PatchEvent::ArchiveSigned { mode } => write!(f, "Signed archive using {mode}"),
        }
    }
}

/// Sink for [`PatchEvent`]s, so patching code never writes to the console itself.
pub trait PatchReporter {
    fn report(&mut self, event: &PatchEvent);
}

impl<F> PatchReporter for F
where
    F: FnMut(&PatchEvent),
{
    fn report(&mut self, event: &PatchEvent) {
        self(event)
    }
}

impl PatchReporter for Vec<PatchEvent> {
    fn report(&mut self, event: &PatchEvent) {
        self.push(event.clone());
    }
}

/// Forwards events to the `log` facade at `info`, so `--silent` hides all of them.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogReporter;

impl PatchReporter for LogReporter {
    fn report(&mut self, event: &PatchEvent) {
        info!("{event}");
    }
}
