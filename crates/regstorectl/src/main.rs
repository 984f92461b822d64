//! Command-line control utility for regstore storage roots.
//!
//! `regstorectl` opens a storage root directly (no server needed) for
//! maintenance: garbage collection, listing repositories and tags, and
//! inspecting or seeding blobs and manifests.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fn_error_context::context;
use log::debug;
use tokio::io::AsyncWriteExt;

use regstore::{
    digest::{digest_reader, Algorithm},
    GcOptions, GcTarget, Registry, RepositoryName, StoreConfig,
};

/// regstorectl
#[derive(Debug, Parser)]
#[clap(name = "regstorectl", version)]
pub struct App {
    /// Read configuration from this TOML file
    #[clap(long, env = "REGSTORE_CONFIG", group = "source")]
    config: Option<PathBuf>,
    /// Operate on the storage root at this path with default settings
    #[clap(long, group = "source")]
    root: Option<PathBuf>,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Perform garbage collection
    GC {
        /// Only collect this repository
        #[clap(long)]
        repo: Option<String>,
        /// Preview what would be deleted without actually deleting
        #[clap(long, short = 'n')]
        dry_run: bool,
        /// Print every reclaimed item
        #[clap(long, short = 'v')]
        verbose: bool,
    },
    /// List repositories
    Catalog {
        /// Maximum number of names to print
        #[clap(long, short = 'n')]
        limit: Option<usize>,
        /// Start after this repository name
        #[clap(long)]
        last: Option<String>,
    },
    /// List the tags of a repository
    Tags { repo: String },
    /// Store a file as a blob and print its digest
    PushBlob {
        repo: String,
        file: PathBuf,
        /// Expected digest; computed from the file when omitted
        #[clap(long)]
        digest: Option<String>,
    },
    /// Write a blob to stdout
    CatBlob { repo: String, digest: String },
    /// Delete a blob
    RmBlob { repo: String, digest: String },
    /// Store a manifest file under a tag or digest and print its digest
    PutManifest {
        repo: String,
        reference: String,
        file: PathBuf,
        /// Media type to record when the document has no mediaType field
        #[clap(long)]
        content_type: Option<String>,
    },
    /// Write a manifest to stdout
    GetManifest {
        repo: String,
        reference: String,
        /// Print the media type and digest to stderr
        #[clap(long)]
        describe: bool,
    },
    /// Delete a manifest by tag or digest
    RmManifest { repo: String, reference: String },
}

#[context("Loading configuration")]
fn load_config(args: &App) -> Result<StoreConfig> {
    if let Some(path) = &args.config {
        return StoreConfig::from_path(path)
            .with_context(|| format!("Reading {}", path.display()));
    }
    match &args.root {
        Some(root) => Ok(StoreConfig::new(root)),
        None => anyhow::bail!("either --config, REGSTORE_CONFIG or --root must be given"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = App::parse();
    let config = load_config(&args)?;
    debug!("using {config:?}");
    let registry = Registry::open(config).context("Opening storage root")?;
    run_cmd(&registry, args.cmd).await
}

async fn file_digest(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Opening {}", path.display()))?;
    let (digest, _) = digest_reader(Algorithm::Sha256, &mut file)
        .await
        .with_context(|| format!("Computing digest of {}", path.display()))?;
    Ok(digest.to_string())
}

async fn run_cmd(registry: &Registry, cmd: Command) -> Result<()> {
    match cmd {
        Command::GC {
            repo,
            dry_run,
            verbose,
        } => {
            let target = match repo {
                Some(name) => GcTarget::Repository(RepositoryName::parse(&name)?),
                None => GcTarget::All,
            };
            let report = registry.run_gc(target, GcOptions { dry_run }).await;
            if dry_run {
                println!("Dry run (no files deleted):");
            }
            if verbose {
                for item in &report.reclaimed {
                    println!("  {item}");
                }
            }
            println!(
                "Reclaimed: {} blobs, {} uploads, {} staging files ({} bytes)",
                report.blobs_removed(),
                report.uploads_removed(),
                report.incoming_removed(),
                report.bytes_reclaimed
            );
            for error in &report.errors {
                eprintln!("warning: {error}");
            }
        }
        Command::Catalog { limit, last } => {
            for name in registry
                .list_repositories(limit.or(Some(usize::MAX)), last.as_deref())
                .await?
            {
                println!("{name}");
            }
        }
        Command::Tags { repo } => {
            for tag in registry.list_tags(&repo).await?.tags {
                println!("{tag}");
            }
        }
        Command::PushBlob { repo, file, digest } => {
            let digest = match digest {
                Some(digest) => digest,
                None => file_digest(&file).await?,
            };
            let mut source = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("Opening {}", file.display()))?;
            let stored = registry
                .monolithic_upload(&repo, &digest, &mut source)
                .await?;
            println!("{stored}");
        }
        Command::CatBlob { repo, digest } => {
            let mut reader = registry.fetch_blob(&repo, &digest).await?;
            let mut stdout = tokio::io::stdout();
            tokio::io::copy(&mut reader, &mut stdout)
                .await
                .context("Writing blob to stdout")?;
            stdout.flush().await?;
        }
        Command::RmBlob { repo, digest } => {
            registry.delete_blob(&repo, &digest).await?;
        }
        Command::PutManifest {
            repo,
            reference,
            file,
            content_type,
        } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Reading {}", file.display()))?;
            let digest = registry
                .put_manifest(&repo, &reference, &bytes, content_type.as_deref())
                .await?;
            println!("{digest}");
        }
        Command::GetManifest {
            repo,
            reference,
            describe,
        } => {
            let manifest = registry.fetch_manifest(&repo, &reference).await?;
            if describe {
                eprintln!("{} {}", manifest.digest, manifest.media_type);
            }
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&manifest.bytes).await?;
            stdout.flush().await?;
        }
        Command::RmManifest { repo, reference } => {
            registry.delete_manifest(&repo, &reference).await?;
        }
    }
    Ok(())
}
