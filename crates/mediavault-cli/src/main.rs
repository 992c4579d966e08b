//! `MediaVault` CLI: command-line front end for the encrypted blob store.
//!
//! Opens the vault under `--root` (or `MEDIAVAULT_ROOT`) with a file key
//! backend and runs one blob store operation per invocation.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use mediavault_core::eraser::{self, EraseReport};
use mediavault_core::{BlobInfo, BlobStore, Integrity, KeyStore, StoreOutcome, VaultConfig};
use mediavault_storage::FileBackend;
use tracing::debug;

// ── ANSI color helpers ───────────────────────────────────────────────

struct Palette {
    reset: &'static str,
    bold: &'static str,
    dim: &'static str,
    red: &'static str,
    green: &'static str,
    yellow: &'static str,
    cyan: &'static str,
    white: &'static str,
}

const COLOR: Palette = Palette {
    reset: "\x1b[0m",
    bold: "\x1b[1m",
    dim: "\x1b[2m",
    red: "\x1b[31m",
    green: "\x1b[32m",
    yellow: "\x1b[33m",
    cyan: "\x1b[36m",
    white: "\x1b[37m",
};

const PLAIN: Palette = Palette {
    reset: "",
    bold: "",
    dim: "",
    red: "",
    green: "",
    yellow: "",
    cyan: "",
    white: "",
};

static PALETTE: OnceLock<&'static Palette> = OnceLock::new();

fn palette() -> &'static Palette {
    PALETTE.get_or_init(|| &COLOR)
}

// ── CLI structure ────────────────────────────────────────────────────

/// `MediaVault`: encrypted media blobs with secure erasure.
#[derive(Parser)]
#[command(
    name = "mediavault",
    version,
    about = "MediaVault CLI: encrypt, materialize, verify, and securely destroy media blobs",
    long_about = None,
    after_help = "Environment variables:\n  \
         MEDIAVAULT_ROOT                     Base directory (default: ./mediavault-data)\n  \
         MEDIAVAULT_VAULT_DIR                Blob directory (default: <root>/vault)\n  \
         MEDIAVAULT_TEMP_DIR                 Plaintext temp directory (default: <root>/cache)\n  \
         MEDIAVAULT_KEY_DIR                  Key directory (default: <root>/keys)\n  \
         MEDIAVAULT_ERASE_PASSES             Overwrite passes (default: 3)\n  \
         MEDIAVAULT_INTEGRITY_POLICY         availability | fail-closed\n  \
         MEDIAVAULT_ALLOW_PLAINTEXT_FALLBACK true | false\n  \
         MEDIAVAULT_TEMP_MAX_AGE             Seconds before temp files are swept\n\n\
         Examples:\n  \
         mediavault store ~/DCIM/IMG_0042.jpg\n  \
         mediavault materialize ./mediavault-data/vault/IMG_0042_1a2b3c4d5e6f.enc --output out.jpg\n  \
         mediavault verify ./mediavault-data/vault/IMG_0042_1a2b3c4d5e6f.enc\n  \
         mediavault wipe --yes"
)]
struct Cli {
    /// Base directory for the vault, temp area, and key.
    #[arg(long, env = "MEDIAVAULT_ROOT", default_value = "./mediavault-data")]
    root: PathBuf,

    /// Log filter (e.g. `warn`, `mediavault_core=debug`).
    #[arg(long, env = "MEDIAVAULT_LOG_LEVEL")]
    log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long, default_value = "false")]
    json_logs: bool,

    /// Disable colored output.
    #[arg(long, default_value = "false")]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encrypt a file into a new blob.
    Store {
        /// File to store.
        source: PathBuf,
        /// Logical name to record (default: the source file name).
        #[arg(long)]
        name: Option<String>,
    },
    /// Decrypt a blob into a plaintext file.
    Materialize {
        /// Blob to decrypt.
        blob: PathBuf,
        /// Copy the plaintext here and erase the temp file.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Show size, timestamps, and decrypted metadata of a blob.
    Info {
        /// Blob to inspect.
        blob: PathBuf,
        /// Print as JSON.
        #[arg(long, default_value = "false")]
        json: bool,
    },
    /// Check a blob against its verification sidecar. Exits 2 on failure.
    Verify {
        /// Blob to check.
        blob: PathBuf,
    },
    /// Securely erase a blob, its sidecar, and its plaintext copies.
    Destroy {
        /// Blob to destroy.
        blob: PathBuf,
    },
    /// Re-store a blob under the current cipher and destroy the old one.
    #[command(name = "reencrypt")]
    ReEncrypt {
        /// Blob to re-encrypt.
        blob: PathBuf,
    },
    /// List every blob in the vault.
    List,
    /// Erase plaintext temp files older than the given age.
    Sweep {
        /// Minimum age in seconds (default: MEDIAVAULT_TEMP_MAX_AGE or 3600).
        #[arg(long)]
        max_age_secs: Option<u64>,
    },
    /// Securely erase every blob and temp file.
    Wipe {
        /// Confirm the wipe.
        #[arg(long, default_value = "false")]
        yes: bool,
    },
    /// Securely erase any file or directory.
    Erase {
        /// Path to erase.
        path: PathBuf,
        /// Overwrite passes (default: MEDIAVAULT_ERASE_PASSES or 3).
        #[arg(long)]
        passes: Option<u32>,
    },
}

// ── Pretty output helpers ────────────────────────────────────────────

fn header(icon: &str, title: &str) {
    let p = palette();
    println!("{}{}{icon} {title}{}", p.bold, p.cyan, p.reset);
    println!("{}─────────────────────────────────────────{}", p.dim, p.reset);
}

fn kv_line(key: &str, value: &str) {
    let p = palette();
    println!("  {}{key:<20}{} {}{value}{}", p.dim, p.reset, p.white, p.reset);
}

fn success(msg: &str) {
    let p = palette();
    println!("{}{}✓{} {msg}", p.green, p.bold, p.reset);
}

fn warning(msg: &str) {
    let p = palette();
    println!("{}{}⚠{} {}{msg}{}", p.yellow, p.bold, p.reset, p.yellow, p.reset);
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes;
    let mut unit = 0;
    while value >= 1024 && unit < UNITS.len() - 1 {
        value /= 1024;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value} {} ({bytes} bytes)", UNITS[unit])
    }
}

fn print_erase_report(report: &EraseReport) {
    kv_line("Erased", &report.erased.to_string());
    if !report.degraded.is_empty() {
        kv_line("Degraded", &report.degraded.len().to_string());
        for degraded in &report.degraded {
            warning(&format!(
                "{} was deleted without a full overwrite: {}",
                degraded.path.display(),
                degraded.reason
            ));
        }
    }
}

fn print_integrity(integrity: &Integrity) {
    match integrity {
        Integrity::Verified => kv_line("Integrity", "verified"),
        Integrity::Unchecked => kv_line("Integrity", "unchecked (legacy blob)"),
        Integrity::Passthrough => kv_line("Integrity", "not a vault blob, returned unchanged"),
        Integrity::Mismatch { .. } => {
            kv_line("Integrity", "MISMATCH");
            warning("content does not match the digest recorded at store time");
        }
        Integrity::MetadataUnreadable { reason } => {
            kv_line("Integrity", "metadata unreadable");
            warning(&format!("content could not be checked: {reason}"));
        }
        Integrity::DecryptionFailed { reason } => {
            kv_line("Integrity", "decryption failed");
            warning(&format!("returned raw blob bytes: {reason}"));
        }
    }
}

fn print_info(info: &BlobInfo) {
    header("◆", "Blob");
    kv_line("Path", &info.path.display().to_string());
    kv_line("Exists", if info.exists { "yes" } else { "no" });
    if !info.exists {
        return;
    }
    kv_line("Size", &format_bytes(info.size));
    if let Some(modified) = info.modified_at {
        kv_line("Modified", &modified.to_rfc3339());
    }
    match &info.metadata {
        Some(meta) => {
            kv_line("Original name", &meta.original_name);
            kv_line("MIME type", &meta.mime_type);
            kv_line("Original size", &format_bytes(meta.original_size));
            kv_line("Created", &meta.created_at.to_rfc3339());
            kv_line("Cipher", &meta.cipher_version.to_string());
        }
        None => kv_line("Metadata", "none (legacy, plaintext, or unreadable)"),
    }
}

// ── Setup ────────────────────────────────────────────────────────────

fn init_logging(filter: &str, json: bool, color: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.with_ansi(color).init();
    }
}

async fn open_store(config: VaultConfig) -> Result<BlobStore> {
    let backend = FileBackend::open(&config.key_dir)
        .await
        .with_context(|| format!("failed to open key directory {}", config.key_dir.display()))?;
    let keys = Arc::new(KeyStore::new(Arc::new(backend)));
    BlobStore::open(config, keys)
        .await
        .context("failed to open vault")
}

// ── Command dispatch ─────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let color = !cli.no_color
        && std::env::var_os("NO_COLOR").is_none()
        && std::io::stdout().is_terminal();
    let _ = PALETTE.set(if color { &COLOR } else { &PLAIN });

    let config = VaultConfig::from_env_with_root(&cli.root);
    let filter = cli.log_level.as_deref().unwrap_or(&config.log_level);
    init_logging(filter, cli.json_logs, color && std::io::stderr().is_terminal());

    match run(config, cli.command).await {
        Ok(code) => code,
        Err(e) => {
            let p = palette();
            eprintln!();
            eprintln!("  {}{}✗ Error:{} {e:#}", p.red, p.bold, p.reset);
            eprintln!();
            ExitCode::FAILURE
        }
    }
}

async fn run(config: VaultConfig, cmd: Commands) -> Result<ExitCode> {
    debug!(
        vault = %config.vault_dir.display(),
        temp = %config.temp_dir.display(),
        "opening vault"
    );
    // Plain erase needs no key and no vault.
    if let Commands::Erase { path, passes } = &cmd {
        cmd_erase(path, passes.unwrap_or(config.erase_passes)).await?;
        return Ok(ExitCode::SUCCESS);
    }
    if matches!(cmd, Commands::Wipe { yes: false }) {
        bail!("wipe erases every blob in the vault; pass --yes to confirm");
    }

    let max_age = config.temp_max_age_secs;
    let store = open_store(config).await?;
    match cmd {
        Commands::Store { source, name } => cmd_store(&store, &source, name.as_deref()).await?,
        Commands::Materialize { blob, output } => {
            cmd_materialize(&store, &blob, output.as_deref()).await?;
        }
        Commands::Info { blob, json } => cmd_info(&store, &blob, json).await?,
        Commands::Verify { blob } => return cmd_verify(&store, &blob).await,
        Commands::Destroy { blob } => cmd_destroy(&store, &blob).await?,
        Commands::ReEncrypt { blob } => cmd_reencrypt(&store, &blob).await?,
        Commands::List => cmd_list(&store).await?,
        Commands::Sweep { max_age_secs } => {
            cmd_sweep(&store, max_age_secs.unwrap_or(max_age)).await?;
        }
        Commands::Wipe { .. } => cmd_wipe(&store).await?,
        Commands::Erase { .. } => {}
    }
    Ok(ExitCode::SUCCESS)
}

// ── Commands ─────────────────────────────────────────────────────────

async fn cmd_store(store: &BlobStore, source: &Path, name: Option<&str>) -> Result<()> {
    let logical_name = match name {
        Some(name) => name.to_owned(),
        None => source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .context("source path has no file name; pass --name")?,
    };

    let outcome = store
        .store(source, &logical_name)
        .await
        .with_context(|| format!("failed to store {}", source.display()))?;

    match &outcome {
        StoreOutcome::StoredEncrypted { path } => {
            success(&format!("Stored {logical_name}"));
            kv_line("Blob", &path.display().to_string());
        }
        StoreOutcome::StoredPlain { path, reason } => {
            warning(&format!("Stored {logical_name} WITHOUT encryption: {reason}"));
            kv_line("Blob", &path.display().to_string());
        }
    }
    Ok(())
}

async fn cmd_materialize(store: &BlobStore, blob: &Path, output: Option<&Path>) -> Result<()> {
    let materialized = store
        .materialize(blob)
        .await
        .with_context(|| format!("failed to materialize {}", blob.display()))?;

    let Some(output) = output else {
        success("Materialized");
        kv_line("Plaintext", &materialized.path.display().to_string());
        print_integrity(&materialized.integrity);
        return Ok(());
    };

    let copied = tokio::fs::copy(&materialized.path, output)
        .await
        .with_context(|| format!("failed to write {}", output.display()));
    store
        .release(&materialized.path)
        .await
        .context("failed to erase temp plaintext")?;
    copied?;

    success("Materialized");
    kv_line("Output", &output.display().to_string());
    print_integrity(&materialized.integrity);
    Ok(())
}

async fn cmd_info(store: &BlobStore, blob: &Path, json: bool) -> Result<()> {
    let info = store
        .get_info(blob)
        .await
        .with_context(|| format!("failed to inspect {}", blob.display()))?;
    if json {
        let rendered =
            serde_json::to_string_pretty(&info).context("failed to format blob info")?;
        println!("{rendered}");
    } else {
        print_info(&info);
    }
    Ok(())
}

async fn cmd_verify(store: &BlobStore, blob: &Path) -> Result<ExitCode> {
    let intact = store
        .verify(blob)
        .await
        .with_context(|| format!("failed to verify {}", blob.display()))?;
    if intact {
        success(&format!("{} is intact", blob.display()));
        Ok(ExitCode::SUCCESS)
    } else {
        warning(&format!("{} failed verification", blob.display()));
        Ok(ExitCode::from(2))
    }
}

async fn cmd_destroy(store: &BlobStore, blob: &Path) -> Result<()> {
    let report = store
        .destroy(blob)
        .await
        .with_context(|| format!("failed to destroy {}", blob.display()))?;
    if report.is_noop() {
        warning(&format!("nothing to destroy at {}", blob.display()));
        return Ok(());
    }
    success(&format!("Destroyed {}", blob.display()));
    print_erase_report(&report);
    Ok(())
}

async fn cmd_reencrypt(store: &BlobStore, blob: &Path) -> Result<()> {
    let fresh = store
        .re_encrypt(blob)
        .await
        .with_context(|| format!("failed to re-encrypt {}", blob.display()))?;
    match fresh {
        Some(path) => {
            success("Re-encrypted");
            kv_line("Old blob", &blob.display().to_string());
            kv_line("New blob", &path.display().to_string());
        }
        None => warning(&format!("{} was kept unchanged", blob.display())),
    }
    Ok(())
}

async fn cmd_list(store: &BlobStore) -> Result<()> {
    let blobs = store.list().await.context("failed to list vault")?;
    header("◆", &format!("Blobs ({})", blobs.len()));
    for blob in &blobs {
        println!("  {}", blob.display());
    }
    Ok(())
}

async fn cmd_sweep(store: &BlobStore, max_age_secs: u64) -> Result<()> {
    let swept = store
        .sweep_temp(Duration::from_secs(max_age_secs))
        .await
        .context("failed to sweep temp files")?;
    success(&format!("Swept {swept} temp file(s) older than {max_age_secs}s"));
    Ok(())
}

async fn cmd_wipe(store: &BlobStore) -> Result<()> {
    let report = store.wipe_all().await.context("failed to wipe vault")?;
    success("Vault wiped");
    print_erase_report(&report);
    Ok(())
}

async fn cmd_erase(path: &Path, passes: u32) -> Result<()> {
    let report = eraser::erase(path, passes)
        .await
        .with_context(|| format!("failed to erase {}", path.display()))?;
    if report.is_noop() {
        warning(&format!("nothing to erase at {}", path.display()));
        return Ok(());
    }
    success(&format!(
        "Erased {} ({} passes)",
        path.display(),
        eraser::effective_passes(passes)
    ));
    print_erase_report(&report);
    Ok(())
}
