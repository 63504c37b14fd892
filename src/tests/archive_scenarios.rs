use crate::android::binary_xml::AndroidManifest;
use crate::android::zip::{ApkEntry, ApkFile};
use crate::error::PatchError;
use crate::orchestrator::{
    run_patch, ArchivePatcher, CancelFlag, ManifestOutcome, PatchOptions, PatchStage,
    MANIFEST_ENTRY,
};
use crate::patch::{PatchEvent, PatchRequest, ReceiverActions};
use crate::sign::SigningMode;
use crate::tests::support::{
    manifest, names, strings, write_fixture_apk, RecordingSigner, FIXTURE_DEX,
};
use std::fs;
use std::path::{Path, PathBuf};

fn scratch() -> tempfile::TempDir {
    tempfile::tempdir().expect("create temp dir")
}

fn default_manifest() -> AndroidManifest {
    manifest(r#"<uses-permission android:name="P0"/><application/>"#)
}

fn write_class(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
    let classes = dir.join("classes");
    fs::create_dir_all(&classes).expect("classes dir");
    let path = classes.join(name);
    fs::write(&path, contents).expect("write class file");
    path
}

fn staged_leftovers(dir: &Path) -> usize {
    fs::read_dir(dir)
        .expect("list temp dir")
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(".apkpatch-"))
        .count()
}

fn manifest_entry(path: &Path) -> Vec<u8> {
    ApkFile::from_file(path)
        .expect("reopen apk")
        .read_entry(MANIFEST_ENTRY)
        .expect("manifest entry")
}

#[test]
fn class_injection_alone_keeps_manifest_bytes() {
    let dir = scratch();
    let apk_path = write_fixture_apk(dir.path(), &default_manifest());
    let manifest_before = manifest_entry(&apk_path);
    let class = write_class(dir.path(), "classes2.dex", b"dex\n035\0injected");

    let signer = RecordingSigner::default();
    let mut events: Vec<PatchEvent> = Vec::new();
    let options = PatchOptions {
        apk_path: apk_path.clone(),
        classes: vec![class.clone()],
        ..PatchOptions::default()
    };
    let summary = run_patch(&options, &signer, &mut events, &CancelFlag::new()).unwrap();

    assert_eq!(summary.manifest, ManifestOutcome::Skipped);
    assert_eq!(summary.injected, ["classes2.dex"]);
    assert_eq!(summary.signing, SigningMode::ApkSigner);
    assert_eq!(summary.stripped_signatures.len(), 3);
    assert_eq!(manifest_entry(&apk_path), manifest_before);

    let apk = ApkFile::from_file(&apk_path).unwrap();
    assert_eq!(
        apk.entry_names().collect::<Vec<_>>(),
        ["AndroidManifest.xml", "classes.dex", "resources.arsc", "classes2.dex"]
    );
    assert_eq!(apk.read_entry("classes2.dex").unwrap(), b"dex\n035\0injected");
    assert_eq!(apk.read_entry("classes.dex").unwrap(), FIXTURE_DEX);

    assert!(events.contains(&PatchEvent::ClassInjected {
        entry: "classes2.dex".into(),
        source: class,
        size: 16,
    }));
    assert!(!events.contains(&PatchEvent::ManifestUnchanged));
}

#[test]
fn same_base_name_overwrites_in_place() {
    let dir = scratch();
    let apk_path = write_fixture_apk(dir.path(), &default_manifest());
    let first = write_class(dir.path(), "classes.dex", b"first");
    let nested = dir.path().join("other");
    let second = write_class(&nested, "classes.dex", b"second");

    let mut patcher = ArchivePatcher::open(&apk_path).unwrap();
    patcher
        .inject_classes(&[first, second], &mut Vec::<PatchEvent>::new())
        .unwrap();
    let summary = patcher
        .finalize(&RecordingSigner::default(), SigningMode::ApkSigner, &mut Vec::<PatchEvent>::new())
        .unwrap();

    assert_eq!(summary.injected, ["classes.dex"]);
    let apk = ApkFile::from_file(&apk_path).unwrap();
    assert_eq!(apk.entry_names().nth(1), Some("classes.dex"));
    assert_eq!(apk.read_entry("classes.dex").unwrap(), b"second");
}

#[test]
fn manifest_is_rewritten_and_signed_via_staged_copy() {
    let dir = scratch();
    let apk_path = write_fixture_apk(dir.path(), &default_manifest());
    let signer = RecordingSigner::default();
    let mut events: Vec<PatchEvent> = Vec::new();
    let options = PatchOptions {
        apk_path: apk_path.clone(),
        request: PatchRequest {
            add_permissions: strings(&["P1"]),
            receivers: ReceiverActions::parse(["R1:A1"]).unwrap(),
            ..PatchRequest::default()
        },
        signing: SigningMode::JarSigner,
        ..PatchOptions::default()
    };

    let summary = run_patch(&options, &signer, &mut events, &CancelFlag::new()).unwrap();
    assert_eq!(summary.manifest, ManifestOutcome::Rewritten);

    let calls = signer.calls.borrow();
    assert_eq!(calls.len(), 1);
    let (staged, mode) = &calls[0];
    assert_eq!(*mode, SigningMode::JarSigner);
    assert_ne!(staged, &apk_path);
    assert_eq!(staged.parent(), apk_path.parent());
    assert!(!staged.exists());
    assert_eq!(staged_leftovers(dir.path()), 0);

    let patched = AndroidManifest::from_bytes(&manifest_entry(&apk_path)).unwrap();
    assert_eq!(names(patched.root(), "uses-permission"), ["P0", "P1"]);
    assert!(events
        .iter()
        .any(|event| matches!(event, PatchEvent::ManifestWritten { .. })));
    assert_eq!(
        events.last(),
        Some(&PatchEvent::ArchiveSigned {
            mode: SigningMode::JarSigner
        })
    );
}

#[test]
fn satisfied_request_leaves_manifest_bytes_alone() {
    let dir = scratch();
    let apk_path = write_fixture_apk(dir.path(), &default_manifest());
    let before = manifest_entry(&apk_path);

    let mut patcher = ArchivePatcher::open(&apk_path).unwrap();
    let mut events: Vec<PatchEvent> = Vec::new();
    let request = PatchRequest {
        add_permissions: strings(&["P0"]),
        remove_permissions: strings(&["GONE"]),
        ..PatchRequest::default()
    };
    let outcome = patcher.patch_manifest(&request, &mut events).unwrap();
    assert_eq!(outcome, ManifestOutcome::Unchanged);
    assert_eq!(patcher.stage(), PatchStage::ManifestUnchanged);
    patcher
        .finalize(&RecordingSigner::default(), SigningMode::ApkSigner, &mut events)
        .unwrap();

    assert_eq!(manifest_entry(&apk_path), before);
    assert!(events.contains(&PatchEvent::ManifestUnchanged));
}

#[test]
fn signing_failure_keeps_original_archive() {
    let dir = scratch();
    let apk_path = write_fixture_apk(dir.path(), &default_manifest());
    let original = fs::read(&apk_path).unwrap();
    let signer = RecordingSigner::failing();
    let options = PatchOptions {
        apk_path: apk_path.clone(),
        classes: vec![write_class(dir.path(), "classes2.dex", b"dex")],
        request: PatchRequest {
            add_permissions: strings(&["P1"]),
            ..PatchRequest::default()
        },
        ..PatchOptions::default()
    };

    let err = run_patch(
        &options,
        &signer,
        &mut Vec::<PatchEvent>::new(),
        &CancelFlag::new(),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        PatchError::Signing {
            mode: SigningMode::ApkSigner,
            ..
        }
    ));
    assert_eq!(signer.calls.borrow().len(), 1);
    assert_eq!(fs::read(&apk_path).unwrap(), original);
    assert_eq!(staged_leftovers(dir.path()), 0);
}

#[test]
fn malformed_manifest_aborts_before_signing() {
    let dir = scratch();
    let apk_path = write_fixture_apk(dir.path(), &manifest(r#"<uses-permission android:name="P0"/>"#));
    let original = fs::read(&apk_path).unwrap();
    let signer = RecordingSigner::default();
    let mut events: Vec<PatchEvent> = Vec::new();
    let options = PatchOptions {
        apk_path: apk_path.clone(),
        request: PatchRequest {
            add_permissions: strings(&["P1"]),
            receivers: ReceiverActions::parse(["R1:A1"]).unwrap(),
            ..PatchRequest::default()
        },
        ..PatchOptions::default()
    };

    let err = run_patch(&options, &signer, &mut events, &CancelFlag::new()).unwrap_err();
    match err {
        PatchError::Manifest(malformed) => assert_eq!(malformed.operation, "add receivers"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(events.is_empty());
    assert!(signer.calls.borrow().is_empty());
    assert_eq!(fs::read(&apk_path).unwrap(), original);
}

#[test]
fn operations_must_follow_stage_order() {
    let dir = scratch();
    let apk_path = write_fixture_apk(dir.path(), &default_manifest());
    let mut sink: Vec<PatchEvent> = Vec::new();

    let mut patcher = ArchivePatcher::open(&apk_path).unwrap();
    assert_eq!(patcher.stage(), PatchStage::Opened);
    patcher
        .patch_manifest(&PatchRequest::default(), &mut sink)
        .unwrap();
    let err = patcher.inject_classes(&[], &mut sink).unwrap_err();
    assert!(matches!(
        err,
        PatchError::InvalidStage {
            operation: "inject classes",
            stage: PatchStage::ManifestUnchanged
        }
    ));
    let err = patcher
        .apply_patch(&PatchRequest::default(), &mut sink)
        .unwrap_err();
    assert!(matches!(err, PatchError::InvalidStage { .. }));
}

#[test]
fn failed_manifest_patch_cannot_be_finalized() {
    let dir = scratch();
    let apk_path = write_fixture_apk(dir.path(), &manifest(""));
    let mut sink: Vec<PatchEvent> = Vec::new();
    let request = PatchRequest {
        remove_tags: vec!["activity:Main".parse().unwrap()],
        ..PatchRequest::default()
    };

    let mut patcher = ArchivePatcher::open(&apk_path).unwrap();
    assert!(patcher.evaluate_patch(&request).unwrap());
    assert!(patcher.apply_patch(&request, &mut sink).is_err());
    assert_eq!(patcher.stage(), PatchStage::ManifestEvaluated);

    let signer = RecordingSigner::default();
    let err = patcher
        .finalize(&signer, SigningMode::ApkSigner, &mut sink)
        .unwrap_err();
    assert!(matches!(
        err,
        PatchError::InvalidStage {
            operation: "finalize",
            stage: PatchStage::ManifestEvaluated
        }
    ));
    assert!(signer.calls.borrow().is_empty());
}

#[test]
fn cancellation_stops_before_commit() {
    let dir = scratch();
    let apk_path = write_fixture_apk(dir.path(), &default_manifest());
    let original = fs::read(&apk_path).unwrap();
    let cancel = CancelFlag::new();
    let mut sink: Vec<PatchEvent> = Vec::new();

    let mut patcher = ArchivePatcher::open(&apk_path)
        .unwrap()
        .with_cancel_flag(cancel.clone());
    patcher
        .inject_classes(&[write_class(dir.path(), "classes2.dex", b"dex")], &mut sink)
        .unwrap();
    cancel.cancel();

    let err = patcher
        .patch_manifest(
            &PatchRequest {
                add_permissions: strings(&["P1"]),
                ..PatchRequest::default()
            },
            &mut sink,
        )
        .unwrap_err();
    assert!(matches!(err, PatchError::Cancelled(_)));

    let signer = RecordingSigner::default();
    let err = patcher
        .finalize(&signer, SigningMode::ApkSigner, &mut sink)
        .unwrap_err();
    assert!(matches!(err, PatchError::Cancelled("committing the archive")));
    assert!(signer.calls.borrow().is_empty());
    assert_eq!(fs::read(&apk_path).unwrap(), original);
}

#[test]
fn unreadable_class_file_is_reported() {
    let dir = scratch();
    let apk_path = write_fixture_apk(dir.path(), &default_manifest());
    let missing = dir.path().join("missing.dex");

    let mut patcher = ArchivePatcher::open(&apk_path).unwrap();
    let err = patcher
        .inject_classes(&[missing.clone()], &mut Vec::<PatchEvent>::new())
        .unwrap_err();
    match err {
        PatchError::ClassRead { path, .. } => assert_eq!(path, missing),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn opening_a_missing_archive_fails() {
    let dir = scratch();
    let err = ArchivePatcher::open(dir.path().join("absent.apk")).err().unwrap();
    assert!(matches!(err, PatchError::Archive { action: "open", .. }));
}

#[test]
fn unusual_entry_names_survive_a_patch() {
    let dir = scratch();
    let apk_path = write_fixture_apk(dir.path(), &default_manifest());
    let mut apk = ApkFile::from_file(&apk_path).unwrap();
    apk.insert("/abs/payload.bin".to_string(), ApkEntry::new(b"payload".to_vec()));
    apk.insert("./assets/x".to_string(), ApkEntry::new(b"x".to_vec()));
    apk.write_to_file(&apk_path).unwrap();

    let mut patcher = ArchivePatcher::open(&apk_path).unwrap();
    let mut sink: Vec<PatchEvent> = Vec::new();
    patcher
        .patch_manifest(
            &PatchRequest {
                add_permissions: strings(&["P1"]),
                ..PatchRequest::default()
            },
            &mut sink,
        )
        .unwrap();
    patcher
        .finalize(&RecordingSigner::default(), SigningMode::ApkSigner, &mut sink)
        .unwrap();

    let patched = ApkFile::from_file(&apk_path).unwrap();
    assert_eq!(patched.read_entry("/abs/payload.bin").unwrap(), b"payload");
    assert_eq!(patched.read_entry("./assets/x").unwrap(), b"x");
    assert!(patched.entry("assets/x").is_none());
}

#[cfg(unix)]
#[test]
fn finalize_keeps_archive_permissions() {
    use std::os::unix::fs::PermissionsExt;

    let dir = scratch();
    let apk_path = write_fixture_apk(dir.path(), &default_manifest());
    fs::set_permissions(&apk_path, fs::Permissions::from_mode(0o644)).unwrap();

    let patcher = ArchivePatcher::open(&apk_path).unwrap();
    patcher
        .finalize(
            &RecordingSigner::default(),
            SigningMode::ApkSigner,
            &mut Vec::<PatchEvent>::new(),
        )
        .unwrap();

    let mode = fs::metadata(&apk_path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o644);
}
