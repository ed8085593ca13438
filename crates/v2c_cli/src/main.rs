//! v2c - video2commons command line
//!
//! Submits and controls tasks against the on-disk task store, and runs the
//! worker pool that executes them.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};

use v2c_core::config::{ConfigManager, Settings};
use v2c_core::logging::init_tracing;
use v2c_core::models::{OauthCredentials, SubtitleSelection, TaskId, TaskParams};
use v2c_core::registry::{JsonStore, SpoolQueue, TaskRegistry};
use v2c_core::stages::{LocalSite, StageSet};
use v2c_core::task::{AuthGate, TaskServices};
use v2c_core::worker::{SysinfoDiskProbe, Worker, WorkerPool};

#[derive(Parser)]
#[command(
    name = "v2c",
    version,
    about = "Import videos into a media repository as free-format files"
)]
struct Cli {
    /// Settings file; created with defaults if missing
    #[arg(short, long, global = true, default_value = "v2c.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a new task
    Submit(SubmitArgs),

    /// Show the status of a task
    Status { id: String },

    /// List tasks visible to a user
    List {
        #[arg(short, long)]
        user: String,
    },

    /// Resubmit a finished task with the same parameters
    Restart {
        id: String,
        #[arg(short, long)]
        user: String,
    },

    /// Request a running task to stop
    Abort {
        id: String,
        #[arg(short, long)]
        user: String,
    },

    /// Forget a task
    Remove {
        id: String,
        #[arg(short, long)]
        user: String,
    },

    /// Delete expired task records
    Purge,

    /// Run the worker pool until interrupted
    Worker {
        /// Override the number of worker threads
        #[arg(short, long)]
        threads: Option<usize>,

        /// Override the queues to pull from (comma separated)
        #[arg(short, long, value_delimiter = ',')]
        queues: Vec<String>,
    },
}

#[derive(Args)]
struct SubmitArgs {
    /// Source URL, or `uploads:<name>` for a user upload
    #[arg(long)]
    url: String,

    /// Target filename on the wiki, without extension
    #[arg(long)]
    filename: String,

    /// File containing the description page text
    #[arg(long)]
    description: PathBuf,

    /// Owning user
    #[arg(short, long)]
    user: String,

    #[arg(long)]
    token: String,

    #[arg(long)]
    secret: String,

    #[arg(long)]
    extractor: Option<String>,

    /// `all`, `none`, or a comma separated list of language codes
    #[arg(long, default_value = "none")]
    subtitles: String,

    #[arg(long, default_value = "bestvideo+bestaudio/best")]
    download_key: String,

    #[arg(long, default_value = "webm")]
    encode_key: String,

    #[arg(long, default_value = "celery")]
    queue: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ConfigManager::new(&cli.config);
    config
        .load_or_create()
        .with_context(|| format!("Failed to load settings from {}", cli.config.display()))?;
    config.ensure_dirs_exist().context("Failed to create configured directories")?;

    let logs_folder = config.logs_folder();
    let _guard = init_tracing(&config.settings().logging, Some(&logs_folder));
    let settings = Arc::new(config.into_settings());

    let registry = Arc::new(open_registry(&settings)?);

    match cli.command {
        Commands::Submit(args) => {
            let params = args.into_params()?;
            let id = registry.submit(params)?;
            println!("{}", id);
        }
        Commands::Status { id } => match registry.status(&TaskId::from(id))? {
            Some(view) => println!("{}", serde_json::to_string_pretty(&view)?),
            None => bail!("Task does not exist"),
        },
        Commands::List { user } => {
            let tasks = registry.list(&user)?;
            println!("{}", serde_json::to_string_pretty(&tasks)?);
        }
        Commands::Restart { id, user } => {
            let new_id = registry.restart(&TaskId::from(id), &user)?;
            println!("{}", new_id);
        }
        Commands::Abort { id, user } => registry.abort(&TaskId::from(id), &user)?,
        Commands::Remove { id, user } => registry.remove(&TaskId::from(id), &user)?,
        Commands::Purge => {
            let purged = registry.purge_expired(Utc::now())?;
            println!("Purged {} expired task(s)", purged);
        }
        Commands::Worker { threads, queues } => run_worker(settings, registry, threads, queues)?,
    }

    Ok(())
}

fn open_registry(settings: &Settings) -> Result<TaskRegistry> {
    let root = Path::new(&settings.paths.store_root);
    let store = JsonStore::open(root)
        .with_context(|| format!("Failed to open task store at {}", root.display()))?;
    let queue = SpoolQueue::open(root)
        .with_context(|| format!("Failed to open queue spool at {}", root.display()))?;
    Ok(TaskRegistry::new(
        Arc::new(store),
        Arc::new(queue),
        settings.registry.clone(),
    ))
}

fn run_worker(
    settings: Arc<Settings>,
    registry: Arc<TaskRegistry>,
    threads: Option<usize>,
    queues: Vec<String>,
) -> Result<()> {
    let upload = &settings.upload;
    let site = LocalSite::new(&upload.site_root, &upload.site_url, upload.site_max_upload_bytes);

    let services = TaskServices {
        registry,
        stages: StageSet::from_settings(&settings),
        site: Arc::new(site),
        auth: Arc::new(AuthGate::new()),
        disk: Arc::new(SysinfoDiskProbe::new()),
        settings: settings.clone(),
    };

    let mut worker = Worker::new(services);
    if !queues.is_empty() {
        worker = worker.with_queues(queues);
    }

    let threads = threads.unwrap_or(settings.worker.threads);
    let pool = WorkerPool::start(Arc::new(worker), threads).context("Failed to start workers")?;
    tracing::info!(threads = pool.size(), "Worker running; stop with Ctrl-C");

    // Claims left behind by an interrupted process are requeued on the next
    // start.
    pool.join();
    Ok(())
}

impl SubmitArgs {
    fn into_params(self) -> Result<TaskParams> {
        let description = fs::read_to_string(&self.description)
            .with_context(|| format!("Failed to read {}", self.description.display()))?;
        Ok(TaskParams {
            url: self.url,
            extractor: self.extractor,
            subtitles: parse_subtitles(&self.subtitles),
            filename: self.filename,
            description,
            download_key: self.download_key,
            encode_key: self.encode_key,
            username: self.user,
            oauth: OauthCredentials::new(self.token, self.secret),
            queue: self.queue,
        })
    }
}

fn parse_subtitles(value: &str) -> SubtitleSelection {
    match value.trim() {
        "" | "none" => SubtitleSelection::None,
        "all" => SubtitleSelection::All,
        list => SubtitleSelection::Languages(
            list.split(',')
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
        ),
    }
}
