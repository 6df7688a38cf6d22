use clap::{Args, Parser, Subcommand};
use miette::{IntoDiagnostic, Result, WrapErr};
use pagesync_common::telemetry::{self, TelemetryConfig};
use pagesync_common::{ApiConfig, DatabaseId, FileStore, IdentityStore, PageId, SyncPolicy};
use pagesync_publish::{CoverSource, NotionClient, PageParent, PageTarget, SyncReport};
use pagesync_renderer::{Document, MediaReference};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(version, about = "Publish block documents to Notion pages", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Make a page hold exactly the given document
    Publish {
        /// Document as JSON
        #[arg(long)]
        file: PathBuf,

        #[command(flatten)]
        page: PageArgs,

        /// Emoji icon for the page
        #[arg(long)]
        icon: Option<String>,

        /// Local image to upload as the page cover
        #[arg(long, conflicts_with = "cover_url")]
        cover_path: Option<PathBuf>,

        /// Public image URL for the page cover
        #[arg(long)]
        cover_url: Option<String>,

        /// Refuse to delete blocks that carry discussions
        #[arg(long)]
        cancel_on_discussion: bool,

        /// Attempts per remote call on transient failures
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// Move a published page to the trash
    Unpublish {
        #[command(flatten)]
        page: PageArgs,
    },
}

#[derive(Args)]
struct PageArgs {
    /// Page title, unique under its parent
    #[arg(long)]
    title: String,

    /// Parent page id
    #[arg(long, required_unless_present = "parent_database_id", conflicts_with = "parent_database_id")]
    parent_page_id: Option<String>,

    /// Parent database id
    #[arg(long)]
    parent_database_id: Option<String>,

    /// Where block identities persist between runs
    #[arg(long, env = "PAGESYNC_IDENTITY_MAP", default_value = ".pagesync/identity.json")]
    identity_map: PathBuf,
}

impl PageArgs {
    fn parent(&self) -> Result<PageParent> {
        match (&self.parent_page_id, &self.parent_database_id) {
            (Some(page), None) => Ok(PageParent::Page(PageId::new(page.as_str()))),
            (None, Some(database)) => Ok(PageParent::Database(DatabaseId::new(database.as_str()))),
            _ => Err(miette::miette!(
                "exactly one of --parent-page-id and --parent-database-id is required"
            )),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_miette();

    let cli = Cli::parse();
    telemetry::init(TelemetryConfig::from_env("pagesync").with_verbosity(cli.verbose));

    let config = ApiConfig::from_env()?;
    let client = NotionClient::new(&config)?;
    let mut policy = SyncPolicy::from_env()?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, stopping after in-flight calls");
            on_interrupt.cancel();
        }
    });

    match cli.command {
        Commands::Publish {
            file,
            page,
            icon,
            cover_path,
            cover_url,
            cancel_on_discussion,
            max_retries,
        } => {
            if cancel_on_discussion {
                policy.cancel_on_discussion = true;
            }
            if let Some(max_retries) = max_retries {
                policy.max_retries = max_retries;
            }
            let document = load_document(&file).await?;
            let target = PageTarget {
                title: page.title.clone(),
                parent: page.parent()?,
                icon,
                cover: cover_path
                    .map(CoverSource::File)
                    .or(cover_url.map(CoverSource::Url)),
            };
            let store = FileStore::new(&page.identity_map);

            match pagesync_publish::publish(&client, &store, &document, &target, &policy, &cancel).await {
                Ok(report) => {
                    print_report(&report)?;
                    tracing::info!(page = ?report.page_id, "published {}", target.title);
                }
                Err(failure) => {
                    print_report(&failure.report)?;
                    return Err(failure.into());
                }
            }
        }
        Commands::Unpublish { page } => {
            let target = PageTarget::new(page.title.clone(), page.parent()?);
            let store = FileStore::new(&page.identity_map);
            let mut identity = store.load().await?;
            let archived =
                pagesync_publish::unpublish(&client, &target, &mut identity, &policy, &cancel)
                    .await?;
            store.save(&identity).await?;
            match archived {
                Some(id) => println!("archived {} ({id})", target.title),
                None => println!("no page titled {:?}", target.title),
            }
        }
    }

    Ok(())
}

/// Read a document and anchor its relative media paths at the file's folder.
async fn load_document(path: &Path) -> Result<Document> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .into_diagnostic()
        .wrap_err_with(|| format!("reading {}", path.display()))?;
    let mut document: Document = serde_json::from_str(&contents)
        .into_diagnostic()
        .wrap_err_with(|| format!("parsing {}", path.display()))?;

    let base = path.parent().unwrap_or(Path::new("."));
    for block in &mut document.blocks {
        block.walk_mut(&mut |b| {
            if let Some(MediaReference::Local { path, .. }) = b.kind.media_source_mut() {
                if path.is_relative() {
                    *path = base.join(&*path);
                }
            }
        });
    }
    Ok(document)
}

fn print_report(report: &SyncReport) -> Result<()> {
    let json = serde_json::to_string_pretty(report).into_diagnostic()?;
    println!("{json}");
    Ok(())
}

fn init_miette() {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .with_cause_chain()
                .color(true)
                .context_lines(5)
                .tab_width(2)
                .break_words(true)
                .build(),
        )
    }))
    .ok();
    miette::set_panic_hook();
}
