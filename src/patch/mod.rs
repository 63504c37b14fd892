//! Declarative edits to a decoded `AndroidManifest.xml`.

pub mod engine;
pub mod parse;
pub mod report;

pub use engine::{apply_patch, MalformedManifest, ManifestPatch, STORAGE_WRITE_PERMISSION};
pub use parse::{ReceiverActions, SpecKind, SpecParseError, TagSpec};
pub use report::{LogReporter, PatchEvent, PatchReporter};

/// The full set of manifest changes requested for one run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PatchRequest {
    pub add_permissions: Vec<String>,
    pub remove_permissions: Vec<String>,
    pub instrumentation: Option<String>,
    pub receivers: ReceiverActions,
    pub remove_tags: Vec<TagSpec>,
}

impl PatchRequest {
    /// Build a request from raw command-line strings (`class:action`, `tag:name`).
    pub fn from_specs<S: AsRef<str>>(
        add_permissions: Vec<String>,
        remove_permissions: Vec<String>,
        instrumentation: Option<String>,
        receiver_specs: &[S],
        tag_specs: &[S],
    ) -> Result<Self, SpecParseError> {
        let receivers = ReceiverActions::parse(receiver_specs)?;
        let remove_tags = tag_specs
            .iter()
            .map(|spec| spec.as_ref().parse::<TagSpec>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PatchRequest {
            add_permissions,
            remove_permissions,
            instrumentation,
            receivers,
            remove_tags,
        })
    }

    /// False when nothing would touch the manifest, in which case it is neither read nor rewritten.
    pub fn touches_manifest(&self) -> bool {
        !self.add_permissions.is_empty()
            || !self.remove_permissions.is_empty()
            || self.instrumentation.is_some()
            || !self.receivers.is_empty()
            || !self.remove_tags.is_empty()
    }
}
