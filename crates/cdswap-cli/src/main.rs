//! Command-line interface for cdswap.
//!
//! Swaps the primary CodeDirectory of a Mach-O's code signature for a
//! reference one, re-identifies the original as the alternate and re-signs
//! the result.

use anyhow::{bail, Context, Result};
use cdswap::{AlternatePolicy, ArchPreference, CdSwap};
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone, Copy, ValueEnum)]
enum Policy {
    /// Keep an existing alternate CodeDirectory
    Keep,
    /// Replace an existing alternate CodeDirectory with the current primary
    Replace,
}

impl From<Policy> for AlternatePolicy {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::Keep => AlternatePolicy::KeepAlternate,
            Policy::Replace => AlternatePolicy::ReplaceAlternate,
        }
    }
}

#[derive(Parser)]
#[command(name = "cdswap")]
#[command(about = "Swap and re-sign Mach-O CodeDirectories")]
struct Cli {
    /// Input Mach-O (thin or FAT)
    #[arg(short = 'i', long)]
    input: PathBuf,

    /// Output file
    #[arg(short = 'o', long, required_unless_present = "replace")]
    output: Option<PathBuf>,

    /// Replace the input in place, or allow overwriting an existing output
    #[arg(short = 'r', long)]
    replace: bool,

    /// CodeDirectory blob installed in the primary slot
    #[arg(long)]
    template_cd: PathBuf,

    /// Placeholder signature blob reserving signature space
    #[arg(long)]
    template_sig: Option<PathBuf>,

    /// Team identifier written into the alternate CodeDirectory
    #[arg(long, default_value = cdswap::DEFAULT_TEAM_ID)]
    team_id: String,

    /// Certificate file (PEM format)
    #[arg(short = 'c', long, conflicts_with = "pkcs12", requires = "private_key")]
    certificate: Option<PathBuf>,

    /// Private key file (PEM format)
    #[arg(short = 'k', long, requires = "certificate")]
    private_key: Option<PathBuf>,

    /// PKCS#12 file (.p12)
    #[arg(short = 'p', long)]
    pkcs12: Option<PathBuf>,

    /// Password for private key or PKCS#12
    #[arg(long)]
    password: Option<String>,

    /// Slice to take from FAT inputs (arm64, arm64e, x86_64)
    #[arg(long, default_value = "arm64")]
    arch: ArchPreference,

    /// What to do when the signature already has an alternate CodeDirectory
    #[arg(long, value_enum, default_value = "keep")]
    policy: Policy,

    /// Dump the input's signature blobs into this directory first
    #[arg(long)]
    extract_blobs: Option<PathBuf>,

    /// Default log filter (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let output = cli.output.clone().unwrap_or_else(|| cli.input.clone());
    check_output(&output, cli.replace)?;

    let swap = build(&cli)?;

    if let Some(ref dir) = cli.extract_blobs {
        let written = swap
            .extract_blobs(&cli.input, dir)
            .with_context(|| format!("failed to extract blobs from {}", cli.input.display()))?;
        tracing::info!(count = written.len(), dir = %dir.display(), "extracted signature blobs");
    }

    swap.patch_file(&cli.input, &output)
        .with_context(|| format!("failed to patch {}", cli.input.display()))?;

    println!("Patched: {}", output.display());
    Ok(())
}

/// Refuse to clobber an existing file unless replacing was requested.
fn check_output(output: &Path, replace: bool) -> Result<()> {
    if output.exists() && !replace {
        bail!(
            "{} already exists, pass -r to overwrite it",
            output.display()
        );
    }
    Ok(())
}

fn build(cli: &Cli) -> Result<CdSwap> {
    let mut swap = CdSwap::new()
        .template_code_directory_file(&cli.template_cd)
        .with_context(|| format!("failed to read {}", cli.template_cd.display()))?
        .team_id(&cli.team_id)
        .arch(cli.arch)
        .alternate_policy(cli.policy.into());

    if let Some(ref path) = cli.template_sig {
        swap = swap
            .template_signature_file(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
    }

    if let Some(ref p12) = cli.pkcs12 {
        swap = swap.pkcs12(p12);
    }
    if let (Some(cert), Some(key)) = (&cli.certificate, &cli.private_key) {
        swap = swap.certificate(cert).private_key(key);
    }
    if let Some(ref password) = cli.password {
        swap = swap.password(password.clone());
    }

    swap.validate()?;
    Ok(swap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_requires_output_or_replace() {
        let result = Cli::try_parse_from(["cdswap", "-i", "in", "--template-cd", "cd.bin"]);
        assert!(result.is_err());

        let cli =
            Cli::try_parse_from(["cdswap", "-i", "in", "-r", "--template-cd", "cd.bin"]).unwrap();
        assert!(cli.replace);
        assert!(cli.output.is_none());
    }

    #[test]
    fn test_pem_and_p12_conflict() {
        let result = Cli::try_parse_from([
            "cdswap", "-i", "in", "-o", "out", "--template-cd", "cd.bin",
            "-c", "cert.pem", "-k", "key.pem", "-p", "id.p12",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["cdswap", "-i", "in", "-o", "out", "--template-cd", "cd"])
            .unwrap();
        assert_eq!(cli.team_id, cdswap::DEFAULT_TEAM_ID);
        assert_eq!(cli.arch, ArchPreference::Arm64);
        assert!(matches!(cli.policy, Policy::Keep));
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_existing_output_requires_replace() {
        let dir = tempfile::TempDir::new().unwrap();
        let existing = dir.path().join("out");
        std::fs::write(&existing, b"keep").unwrap();

        let err = check_output(&existing, false).unwrap_err();
        assert!(err.to_string().contains("pass -r"));
        assert!(check_output(&existing, true).is_ok());
        assert!(check_output(&dir.path().join("missing"), false).is_ok());
        assert_eq!(std::fs::read(&existing).unwrap(), b"keep");
    }

    #[test]
    fn test_arch_parsing() {
        let cli = Cli::try_parse_from([
            "cdswap", "-i", "in", "-o", "out", "--template-cd", "cd", "--arch", "arm64e",
        ])
        .unwrap();
        assert_eq!(cli.arch, ArchPreference::Arm64e);

        let bad = Cli::try_parse_from([
            "cdswap", "-i", "in", "-o", "out", "--template-cd", "cd", "--arch", "ppc",
        ]);
        assert!(bad.is_err());
    }
}
