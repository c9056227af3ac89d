use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use client_core::{
    load_settings, ActionStatus, AdminAuth, DownloadController, HttpTransport, LinkOpener,
    ProgressController, SearchController, Settings, Transport,
};
use futures::future::join_all;
use shared::{
    domain::{FileId, RootId, SyncMode},
    protocol::{SyncProgress, SyncStartRequest},
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Search the file index and manage its sync job")]
struct Args {
    /// Overrides `server_url` from client.toml / the environment.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    api_key: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Search {
        query: String,
        #[arg(long, default_value_t = 1)]
        pages: u32,
    },
    Download {
        #[arg(required = true)]
        file_ids: Vec<i64>,
    },
    Sync {
        #[command(subcommand)]
        action: SyncCommand,
    },
}

#[derive(Subcommand, Debug)]
enum SyncCommand {
    Status,
    Start {
        #[arg(long = "root", required = true)]
        roots: Vec<i64>,
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
        /// Keep printing progress until the job settles.
        #[arg(long)]
        watch: bool,
    },
    Cancel,
    Watch,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    Auto,
    Full,
    Incremental,
}

impl From<ModeArg> for SyncMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Auto => SyncMode::Auto,
            ModeArg::Full => SyncMode::Full,
            ModeArg::Incremental => SyncMode::Incremental,
        }
    }
}

struct StdoutOpener;

impl LinkOpener for StdoutOpener {
    fn open(&self, file_id: FileId, url: &str) {
        println!("{file_id}\t{url}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(url) = args.server_url {
        settings.server_url = url;
    }
    if let Some(key) = args.api_key {
        settings.api_key = Some(key);
    }

    let transport: Arc<dyn Transport> = Arc::new(
        HttpTransport::with_timeout(&settings.server_url, settings.request_timeout())
            .context("failed to create http transport")?,
    );
    info!(server_url = %settings.server_url, "cli: using index service");

    match args.command {
        Command::Search { query, pages } => search(transport, &settings, query, pages).await,
        Command::Download { file_ids } => download(transport, &settings, file_ids).await,
        Command::Sync { action } => sync(transport, &settings, action).await,
    }
}

async fn search(
    transport: Arc<dyn Transport>,
    settings: &Settings,
    query: String,
    pages: u32,
) -> Result<()> {
    let search = SearchController::new(transport, settings.search());
    let mut updates = search.subscribe();

    search.search_immediate(query);
    for page in 1..=pages.max(1) {
        if page > 1 && !search.load_more() {
            break;
        }
        updates
            .wait_for(|state| !state.loading)
            .await
            .context("search controller closed")?;
    }

    let state = search.state();
    if let Some(error) = state.error {
        bail!("search failed: {error}");
    }
    for item in &state.items {
        println!("{}\t{}\t{}", item.source_id, item.size, item.path_text);
    }
    println!("{} of {} results", state.items.len(), state.total);
    Ok(())
}

async fn download(
    transport: Arc<dyn Transport>,
    settings: &Settings,
    file_ids: Vec<i64>,
) -> Result<()> {
    let downloads = DownloadController::new(transport, Arc::new(StdoutOpener), settings.download());
    let ids: Vec<FileId> = file_ids.into_iter().map(FileId).collect();
    let statuses = join_all(ids.iter().map(|id| downloads.invoke(*id))).await;

    let state = downloads.state();
    let mut failed = 0;
    for (id, status) in ids.iter().zip(statuses) {
        if status == ActionStatus::Error {
            failed += 1;
            eprintln!("{id}\terror: {}", state.error(*id).unwrap_or("unknown error"));
        }
    }
    if failed > 0 {
        bail!("{failed} of {} downloads failed", ids.len());
    }
    Ok(())
}

async fn sync(transport: Arc<dyn Transport>, settings: &Settings, action: SyncCommand) -> Result<()> {
    let auth = AdminAuth::new(Arc::clone(&transport), Default::default());
    let Some(key) = settings.api_key.as_deref() else {
        bail!("sync commands need an admin key (--api-key or NPA_ADMIN_API_KEY)");
    };
    if !auth.validate(key).await {
        bail!(
            "admin key rejected: {}",
            auth.error().unwrap_or_else(|| "unknown error".into())
        );
    }

    let progress = ProgressController::new(transport, auth.credentials(), settings.progress());
    match action {
        SyncCommand::Status => {
            let snapshot = progress.refetch().await;
            report_error(&progress)?;
            match snapshot {
                Some(snapshot) => print_progress(&snapshot),
                None => println!("no sync job on record"),
            }
        }
        SyncCommand::Start { roots, mode, watch } => {
            let request = SyncStartRequest {
                root_folder_ids: roots.into_iter().map(RootId).collect(),
                mode: mode.map(SyncMode::from),
                ..SyncStartRequest::default()
            };
            if !progress.start_job(request).await {
                report_error(&progress)?;
            }
            println!("sync started");
            if watch {
                watch_progress(&progress).await?;
            }
        }
        SyncCommand::Cancel => {
            if !progress.cancel_job().await {
                report_error(&progress)?;
            }
            println!("sync cancelled");
            if let Some(snapshot) = progress.state().progress {
                print_progress(&snapshot);
            }
        }
        SyncCommand::Watch => {
            progress.activate().await;
            report_error(&progress)?;
            watch_progress(&progress).await?;
        }
    }
    Ok(())
}

fn report_error(progress: &ProgressController) -> Result<()> {
    match progress.state().error {
        Some(error) => bail!("sync request failed: {error}"),
        None => Ok(()),
    }
}

async fn watch_progress(progress: &ProgressController) -> Result<()> {
    let mut updates = progress.subscribe();
    loop {
        {
            let state = updates.borrow_and_update();
            match &state.progress {
                Some(snapshot) => print_progress(snapshot),
                None => println!("no sync job on record"),
            }
            if let Some(error) = &state.error {
                eprintln!("poll error: {error}");
            }
            if !state.polling {
                break;
            }
        }
        tokio::select! {
            changed = updates.changed() => changed.context("progress controller closed")?,
            _ = tokio::signal::ctrl_c() => {
                progress.stop_polling();
                break;
            }
        }
    }
    Ok(())
}

fn print_progress(progress: &SyncProgress) {
    let stats = &progress.aggregate_stats;
    println!(
        "status={} roots={}/{} folders={} files={} failed_requests={}",
        progress.status,
        progress.completed_roots.len(),
        progress.roots.len(),
        stats.folders_visited,
        stats.files_indexed,
        stats.failed_requests,
    );
    if let Some(root) = progress.active_root {
        let name = progress
            .root_names
            .get(&root.to_string())
            .map(String::as_str)
            .unwrap_or("?");
        println!("active root: {root} ({name})");
    }
    if let Some(error) = &progress.last_error {
        println!("last error: {error}");
    }
}
