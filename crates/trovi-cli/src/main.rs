//! trovi - artifact contents の運用 CLI
//!
//! # Usage
//!
//! ```bash
//! # tarball を objectstore に保存して URN を表示
//! trovi upload artifact.tar.gz --backend objectstore
//!
//! # URN の download 方法を表示
//! trovi links urn:trovi:contents:git:https://github.com/org/repo@main
//!
//! # version の contents を archive に migrate して完了まで待つ
//! # （archive への公開には --title / --description / --creator が必要）
//! trovi migrate --version <ULID> --source <URN> --to archive \
//!     --title "Artifact" --description "..." --creator "Doe, Jane;University"
//!
//! # 最新の migration の状態
//! trovi status --version <ULID>
//!
//! # 起動時 recovery だけを実行し、再投入した migration の完了を待つ
//! trovi recover
//! ```
//!
//! 設定は環境変数（`.env` も可）から読む。`RUST_LOG` が `-v` より優先される。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio_util::io::ReaderStream;
use tracing_subscriber::EnvFilter;

use trovi_core::app::{
    ContentUpload, MigrationContext, MigrationEngine, archive_content_type, describe_contents, recover,
};
use trovi_core::backends::{BackendRegistry, BackendRequest};
use trovi_core::config::Settings;
use trovi_core::domain::{ContentUrn, MigrationRecord, MigrationStatus, VersionId};
use trovi_core::impls::SqliteMigrationStore;
use trovi_core::ports::{Clock, Creator, DepositionMetadata, MigrationStore, SystemClock, UlidGenerator};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "trovi")]
#[command(about = "Trovi artifact contents storage", long_about = None)]
struct Cli {
    /// Raise log verbosity (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Publication metadata for backends that publish (archive)
#[derive(Args)]
struct PublicationArgs {
    #[arg(long)]
    title: Option<String>,
    #[arg(long, default_value = "")]
    description: String,
    /// "Name" or "Name;Affiliation", repeatable
    #[arg(long = "creator")]
    creators: Vec<String>,
    #[arg(long = "keyword")]
    keywords: Vec<String>,
}

impl PublicationArgs {
    /// None when no title was given.
    fn into_metadata(self, build: impl FnOnce(String, String) -> DepositionMetadata) -> Option<DepositionMetadata> {
        let title = self.title?;
        let mut metadata = build(title, self.description);
        metadata.creators = self
            .creators
            .iter()
            .map(|raw| match raw.split_once(';') {
                Some((name, affiliation)) => Creator {
                    name: name.trim().to_string(),
                    affiliation: Some(affiliation.trim().to_string()),
                },
                None => Creator {
                    name: raw.trim().to_string(),
                    affiliation: None,
                },
            })
            .collect();
        metadata.keywords = self.keywords;
        Some(metadata)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a .tar or .tar.gz file as new contents
    Upload {
        file: PathBuf,
        #[arg(long, default_value = "objectstore")]
        backend: String,
        #[command(flatten)]
        publication: PublicationArgs,
    },
    /// Print the access methods of a contents URN
    Links { urn: String },
    /// Migrate a version's contents to another backend and wait for it
    Migrate {
        #[arg(long)]
        version: String,
        /// Contents URN to copy from
        #[arg(long)]
        source: String,
        /// Destination backend name
        #[arg(long)]
        to: String,
        #[command(flatten)]
        publication: PublicationArgs,
    },
    /// Show the most recent migration of a version
    Status {
        #[arg(long)]
        version: String,
    },
    /// Reap interrupted migrations and run queued ones
    Recover,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn parse_version(raw: &str) -> anyhow::Result<VersionId> {
    raw.parse()
        .map_err(|e| anyhow!("invalid version id {raw:?}: {e}"))
}

fn print_record(record: &MigrationRecord) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(record)?);
    Ok(())
}

struct Services {
    clock: Arc<dyn Clock>,
    settings: Settings,
    backends: Arc<BackendRegistry>,
}

impl Services {
    fn load() -> anyhow::Result<Self> {
        let settings = Settings::from_env().context("loading settings")?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let backends = settings
            .backend_registry(clock.clone())
            .context("registering storage backends")?;
        Ok(Self {
            clock,
            settings,
            backends: Arc::new(backends),
        })
    }

    async fn store(&self) -> anyhow::Result<Arc<SqliteMigrationStore>> {
        let store = SqliteMigrationStore::connect(&self.settings.database_url)
            .await
            .with_context(|| format!("opening {}", self.settings.database_url))?;
        Ok(Arc::new(store))
    }

    /// Starts the worker and runs startup recovery.
    async fn engine(&self) -> anyhow::Result<MigrationEngine> {
        let store = self.store().await?;
        let engine = MigrationEngine::spawn(
            MigrationContext {
                store,
                backends: self.backends.clone(),
                clock: self.clock.clone(),
                chunk_size: self.settings.file_upload_max_memory_size,
            },
            Arc::new(UlidGenerator::new(self.clock.clone())),
        );
        let report = recover(&engine).await.context("recovering migrations")?;
        tracing::info!(reaped = report.reaped, requeued = report.requeued, "recovery finished");
        Ok(engine)
    }
}

async fn upload(
    services: &Services,
    file: PathBuf,
    backend: String,
    publication: PublicationArgs,
) -> anyhow::Result<()> {
    let name = file.to_string_lossy().into_owned();
    let Some(content_type) = archive_content_type(&name) else {
        bail!("{name} is not a .tar or .tar.gz archive");
    };

    let handle = tokio::fs::File::open(&file)
        .await
        .with_context(|| format!("opening {name}"))?;
    let length = handle.metadata().await?.len();

    let uploader = ContentUpload::new(
        services.backends.clone(),
        services.settings.file_upload_max_memory_size,
    );
    let mut request = BackendRequest::new_content().with_content_type(content_type);
    let today = services.clock.now().date_naive();
    if let Some(metadata) = publication.into_metadata(|title, description| {
        DepositionMetadata::new(title, description, today)
    }) {
        request = request.with_metadata(metadata);
    }
    let receipt = uploader
        .upload(
            &backend,
            request,
            Some(length),
            ReaderStream::new(handle),
        )
        .await
        .with_context(|| format!("uploading {name} to {backend}"))?;

    println!("{}", receipt.urn);
    Ok(())
}

async fn links(services: &Services, urn: &str) -> anyhow::Result<()> {
    let urn: ContentUrn = urn.parse()?;
    let view = describe_contents(&services.backends, &urn)
        .await
        .with_context(|| format!("describing {urn}"))?;
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}

async fn migrate(
    services: &Services,
    version: &str,
    source: &str,
    to: &str,
    publication: PublicationArgs,
) -> anyhow::Result<()> {
    let version = parse_version(version)?;
    let source: ContentUrn = source.parse()?;

    let engine = services.engine().await?;
    if let Some(metadata) = publication.into_metadata(|title, description| {
        DepositionMetadata::for_version(version, title, description)
    }) {
        engine
            .context()
            .store
            .set_version_metadata(version, &metadata)
            .await
            .context("storing publication metadata")?;
    }
    let submitted = engine
        .submit(version, source, to)
        .await
        .context("submitting migration")?;
    eprintln!("queued migration {}", submitted.id);

    let record = engine.wait_for(submitted.id, POLL_INTERVAL).await?;
    engine.shutdown_and_join().await;

    print_record(&record)?;
    if record.status != MigrationStatus::Success {
        bail!("migration {} failed: {}", record.id, record.message);
    }
    Ok(())
}

async fn status(services: &Services, version: &str) -> anyhow::Result<()> {
    let version = parse_version(version)?;
    let store = services.store().await?;
    match store.latest_for_version(version).await? {
        Some(record) => print_record(&record),
        None => bail!("no migration for version {version}"),
    }
}

async fn run_recovery(services: &Services) -> anyhow::Result<()> {
    let store = services.store().await?;
    let queued = store.list_by_status(MigrationStatus::Queued).await?;

    let engine = services.engine().await?;
    for record in &queued {
        let record = engine.wait_for(record.id, POLL_INTERVAL).await?;
        println!("{} {} {}", record.id, record.status, record.message);
    }
    engine.shutdown_and_join().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _ = dotenvy::dotenv();
    init_tracing(cli.verbose);

    let services = Services::load()?;
    match cli.command {
        Commands::Upload {
            file,
            backend,
            publication,
        } => upload(&services, file, backend, publication).await,
        Commands::Links { urn } => links(&services, &urn).await,
        Commands::Migrate {
            version,
            source,
            to,
            publication,
        } => migrate(&services, &version, &source, &to, publication).await,
        Commands::Status { version } => status(&services, &version).await,
        Commands::Recover => run_recovery(&services).await,
    }
}
