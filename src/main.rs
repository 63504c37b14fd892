use anyhow::{Context, Result};
use apkpatch::android::binary_xml::AndroidManifest;
use apkpatch::android::zip::ApkFile;
use apkpatch::orchestrator::MANIFEST_ENTRY;
use apkpatch::{
    run_patch, CancelFlag, Cli, ExternalSigner, LogReporter, ManifestOutcome, PatchOptions,
    PatcherConfig,
};
use clap::Parser;
use log::info;
use std::path::Path;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_filter());

    let request = cli.patch_request()?;
    let mut config = match &cli.config {
        Some(path) => PatcherConfig::load(path)?,
        None => PatcherConfig::default(),
    };
    config.apply_env_overrides(|key| std::env::var(key).ok());

    log_inputs(&cli);

    let options = PatchOptions {
        apk_path: cli.apk_path.clone(),
        classes: cli.classes.clone(),
        request,
        signing: cli.signing_mode(),
    };
    let signer = ExternalSigner::new(config.signing);
    let summary = run_patch(&options, &signer, &mut LogReporter, &CancelFlag::new())
        .with_context(|| format!("failed to patch {}", cli.apk_path.display()))?;

    let manifest = match summary.manifest {
        ManifestOutcome::Rewritten => "rewritten",
        ManifestOutcome::Unchanged => "already up to date",
        ManifestOutcome::Skipped => "not touched",
    };
    info!(
        "Patched {}: {} class file(s) injected, manifest {}, signed with {}",
        summary.archive.display(),
        summary.injected.len(),
        manifest,
        summary.signing
    );

    if cli.print_manifest {
        print_manifest(&summary.archive)?;
    }
    Ok(())
}

fn init_logging(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

fn log_inputs(cli: &Cli) {
    for class in &cli.classes {
        info!("Class: {}", class.display());
    }
    for permission in &cli.permissions {
        info!("Permission: {permission}");
    }
    for permission in &cli.remove_permissions {
        info!("Remove permission: {permission}");
    }
    if let Some(instrumentation) = &cli.instrumentation {
        info!("Instrumentation: {instrumentation}");
    }
    for receiver in &cli.receivers {
        info!("Receiver: {receiver}");
    }
    for tag in &cli.remove_tags {
        info!("Remove tag: {tag}");
    }
    info!("APK: {}", cli.apk_path.display());
}

fn print_manifest(apk_path: &Path) -> Result<()> {
    let apk = ApkFile::from_file(apk_path)
        .with_context(|| format!("failed to reopen {}", apk_path.display()))?;
    let bytes = apk.read_entry(MANIFEST_ENTRY)?;
    let manifest = AndroidManifest::from_bytes(&bytes).context("failed to decode AndroidManifest.xml")?;
    println!("{}", manifest.to_string()?);
    Ok(())
}
