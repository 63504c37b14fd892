use crate::android::binary_xml::{AndroidManifest, ManifestElement};
use crate::android::zip::{ApkCompression, ApkFile};
use crate::sign::{Signer, SigningError, SigningMode};
use std::cell::RefCell;
use std::path::{Path, PathBuf};

pub const PACKAGE: &str = "pkg.example";

/// A manifest with the android namespace declared and `package="pkg.example"`.
pub fn manifest(body: &str) -> AndroidManifest {
    AndroidManifest::from_string(&format!(
        r#"<manifest xmlns:android="http://schemas.android.com/apk/res/android" package="{PACKAGE}">{body}</manifest>"#
    ))
    .expect("fixture manifest should parse")
}

pub fn android_name(element: &ManifestElement) -> Option<&str> {
    element
        .attributes
        .iter()
        .find(|attr| attr.is_android("name"))
        .and_then(|attr| attr.value.as_str())
}

pub fn names<'a>(parent: &'a ManifestElement, tag: &'a str) -> Vec<&'a str> {
    parent
        .children_named(tag)
        .filter_map(android_name)
        .collect()
}

pub fn application(manifest: &AndroidManifest) -> &ManifestElement {
    manifest.application().expect("fixture has an application")
}

pub fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

pub const FIXTURE_DEX: &[u8] = b"dex\n035\0fixture classes";

/// Writes `app.apk` into `dir`: manifest, dex, resources and a stale v1 signature.
pub fn write_fixture_apk(dir: &Path, manifest: &AndroidManifest) -> PathBuf {
    let mut apk = ApkFile::new();
    let bytes = manifest.to_bytes().expect("fixture manifest encodes");
    apk.write_entry("AndroidManifest.xml", bytes, ApkCompression::Deflated)
        .expect("manifest entry");
    apk.write_entry("classes.dex", FIXTURE_DEX.to_vec(), ApkCompression::Deflated)
        .expect("dex entry");
    apk.write_entry("resources.arsc", vec![0x02, 0x00, 0x0c, 0x00], ApkCompression::Stored)
        .expect("resources entry");
    apk.write_entry("META-INF/MANIFEST.MF", b"Manifest-Version: 1.0\r\n".to_vec(), ApkCompression::Deflated)
        .expect("signature manifest");
    apk.write_entry("META-INF/CERT.SF", b"Signature-Version: 1.0\r\n".to_vec(), ApkCompression::Deflated)
        .expect("signature file");
    apk.write_entry("META-INF/CERT.RSA", vec![0x30, 0x82], ApkCompression::Deflated)
        .expect("signature block");

    let path = dir.join("app.apk");
    apk.write_to_file(&path).expect("fixture apk writes");
    path
}

/// Records every signing request instead of running a tool.
#[derive(Default)]
pub struct RecordingSigner {
    pub calls: RefCell<Vec<(PathBuf, SigningMode)>>,
    pub fail: bool,
}

impl RecordingSigner {
    pub fn failing() -> Self {
        RecordingSigner {
            fail: true,
            ..RecordingSigner::default()
        }
    }
}

impl Signer for RecordingSigner {
    fn sign(&self, apk: &Path, mode: SigningMode) -> Result<(), SigningError> {
        assert!(apk.is_file(), "signer must see a written archive");
        ApkFile::from_file(apk).expect("staged archive should be a readable zip");
        self.calls.borrow_mut().push((apk.to_path_buf(), mode));
        if self.fail {
            Err(SigningError::MissingKeystore(PathBuf::from("/nonexistent/test.keystore")))
        } else {
            Ok(())
        }
    }
}
