use crate::patch::{PatchRequest, SpecParseError};
use crate::sign::SigningMode;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "apkpatch")]
#[command(version)]
#[command(about = "Inject dex files into an APK and patch its AndroidManifest.xml in place", long_about = None)]
#[command(after_help = "Examples:\n  \
  apkpatch -a app.apk -c classes5.dex -p android.permission.INTERNET\n  \
  apkpatch -a app.apk -r tool.acv.AcvReceiver:tool.acv.calculate -i tool.acv.AcvInstrumentation\n  \
  apkpatch -a app.apk -T activity:com.example.DebugActivity --jarsigner")]
pub struct Cli {
    /// Class (dex) file to add to the archive, stored under its file name
    #[arg(short = 'c', long = "class", value_name = "DEX")]
    pub classes: Vec<PathBuf>,

    /// Permission to add (no duplicate is created)
    #[arg(short = 'p', long = "permission", value_name = "NAME")]
    pub permissions: Vec<String>,

    /// Permission to remove
    #[arg(short = 'P', long = "remove-permission", value_name = "NAME")]
    pub remove_permissions: Vec<String>,

    /// Instrumentation to add, targeting the manifest's own package
    #[arg(short = 'i', long = "instrumentation", value_name = "NAME")]
    pub instrumentation: Option<String>,

    /// Receiver and intent-filter action to ensure present
    #[arg(short = 'r', long = "receiver", value_name = "CLASS:ACTION")]
    pub receivers: Vec<String>,

    /// Child of <application> to remove, by tag and android:name
    #[arg(short = 'T', long = "remove-tag", value_name = "TAG:NAME")]
    pub remove_tags: Vec<String>,

    /// APK to patch in place
    #[arg(short = 'a', long = "apkpath", value_name = "APK")]
    pub apk_path: PathBuf,

    /// Only print warnings and errors
    #[arg(long)]
    pub silent: bool,

    /// Sign with jarsigner instead of apksigner (v1 signature only, not recommended)
    #[arg(long)]
    pub jarsigner: bool,

    /// TOML file with signing settings
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Print the resulting manifest as XML
    #[arg(long)]
    pub print_manifest: bool,
}

impl Cli {
    pub fn signing_mode(&self) -> SigningMode {
        if self.jarsigner {
            SigningMode::JarSigner
        } else {
            SigningMode::ApkSigner
        }
    }

    pub fn patch_request(&self) -> Result<PatchRequest, SpecParseError> {
        PatchRequest::from_specs(
            self.permissions.clone(),
            self.remove_permissions.clone(),
            self.instrumentation.clone(),
            &self.receivers,
            &self.remove_tags,
        )
    }

    /// Default log filter when `RUST_LOG` is unset.
    pub fn log_filter(&self) -> &'static str {
        if self.silent {
            "warn"
        } else {
            "info"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn parses_repeated_flags() {
        let cli = Cli::try_parse_from([
            "apkpatch",
            "-a",
            "app.apk",
            "-c",
            "a.dex",
            "--class",
            "b.dex",
            "-p",
            "P1",
            "-P",
            "P2",
            "-r",
            "R1:A1",
            "-r",
            "R1:A2",
            "-T",
            "service:S",
            "-i",
            "I1",
            "--jarsigner",
        ])
        .unwrap();

        assert_eq!(cli.classes, [PathBuf::from("a.dex"), PathBuf::from("b.dex")]);
        assert_eq!(cli.signing_mode(), SigningMode::JarSigner);
        assert_eq!(cli.log_filter(), "info");

        let request = cli.patch_request().unwrap();
        assert_eq!(request.add_permissions, ["P1"]);
        assert_eq!(request.remove_permissions, ["P2"]);
        assert_eq!(request.instrumentation.as_deref(), Some("I1"));
        assert_eq!(request.receivers.actions("R1").unwrap(), ["A1", "A2"]);
        assert_eq!(request.remove_tags[0].tag, "service");
    }

    #[test]
    fn apk_path_is_required() {
        let err = Cli::try_parse_from(["apkpatch", "-p", "P1"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn bad_receiver_spec_is_a_parse_error() {
        let cli = Cli::try_parse_from(["apkpatch", "-a", "app.apk", "-r", "NoColon", "--silent"]).unwrap();
        assert_eq!(cli.log_filter(), "warn");
        let err = cli.patch_request().unwrap_err();
        assert_eq!(err.input, "NoColon");
    }
}
