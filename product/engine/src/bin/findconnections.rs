use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use findconnections_engine::config::{load_pipeline_config, save_pipeline_config, PipelineConfig};
use findconnections_engine::extract::{extract, ExtensionFilterMode, ExtractOptions};
use findconnections_engine::http::HttpClient;
use findconnections_engine::invocation::{
    handle_crawl_request, handle_storage_notification, CrawlService, InvocationContext,
    NotificationService,
};
use findconnections_engine::logging;
use findconnections_engine::paths::AppPaths;
use findconnections_engine::recognition::{HttpSubjectDetector, RecognizedImage, Recognizer};
use findconnections_engine::staging::stage_batches;
use findconnections_engine::storage::FsObjectStore;

/// Scrape page images, stage them in batches and run subject recognition.
#[derive(Debug, Parser)]
#[command(name = "findconnections")]
#[command(about = "Image scraping and subject recognition pipeline", long_about = None)]
struct Cli {
    /// Base directory for config, logs and the local object store.
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    /// Log to stderr instead of the log file.
    #[arg(long, global = true)]
    log_stderr: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FilterArg {
    Off,
    CaseSensitive,
    CaseInsensitive,
}

impl From<FilterArg> for ExtensionFilterMode {
    fn from(value: FilterArg) -> Self {
        match value {
            FilterArg::Off => ExtensionFilterMode::Off,
            FilterArg::CaseSensitive => ExtensionFilterMode::CaseSensitive,
            FilterArg::CaseInsensitive => ExtensionFilterMode::CaseInsensitive,
        }
    }
}

#[derive(Debug, clap::Args)]
struct ExtractArgs {
    /// Page to scan for images.
    url: String,

    #[arg(long)]
    max_images: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long, value_enum)]
    filter: Option<FilterArg>,
}

impl ExtractArgs {
    fn options(&self, config: &PipelineConfig) -> ExtractOptions {
        let mut options = config.extract_options();
        if let Some(v) = self.max_images {
            options.max_images = v;
        }
        if let Some(v) = self.batch_size {
            options.batch_size = v;
        }
        if let Some(v) = self.filter {
            options.filter.mode = v.into();
        }
        options
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write the default pipeline config (keeps an existing one unless --force).
    InitConfig {
        #[arg(long)]
        force: bool,
    },

    /// Print the image batches found on a page as JSON.
    Extract(ExtractArgs),

    /// Extract batches and write them to the local object store.
    Stage {
        #[command(flatten)]
        extract: ExtractArgs,

        /// Defaults to a fresh UUID.
        #[arg(long)]
        request_id: Option<String>,
    },

    /// Run recognition over a staged batch object.
    Process { bucket: String, key: String },

    /// Extract a page and run recognition on its images without staging.
    RecognizePage {
        #[command(flatten)]
        extract: ExtractArgs,

        /// Also write a CSV report of detected subjects.
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Feed a crawl event (JSON file) to the crawl entry point.
    InvokeCrawl {
        event: PathBuf,

        #[arg(long)]
        request_id: Option<String>,
    },

    /// Feed a storage notification (JSON file) to the recognition entry point.
    InvokeNotification { event: PathBuf },
}

fn main() {
    let cli = Cli::parse();
    let paths = AppPaths::resolve(cli.base_dir.as_deref());

    if cli.log_stderr {
        logging::init_logging_stderr();
    } else if let Err(err) = logging::init_logging(&paths) {
        logging::init_logging_stderr();
        tracing::warn!(error = %err, "file_logging_unavailable");
    }

    if let Err(err) = run(cli.command, &paths) {
        tracing::error!(error = %format!("{err:#}"), "command_failed");
        eprintln!("findconnections error: {err:#}");
        std::process::exit(1);
    }
}

fn run(command: Command, paths: &AppPaths) -> Result<()> {
    paths.ensure_dirs().context("failed to create base directories")?;

    // Runs before the config is loaded so a broken file can be replaced.
    if let Command::InitConfig { force } = command {
        return init_config(paths, force);
    }

    let config = load_pipeline_config(paths)?;
    let http = HttpClient::from_config(&config);
    let store = FsObjectStore::new(paths.buckets_dir());

    match command {
        Command::InitConfig { force } => init_config(paths, force)?,
        Command::Extract(args) => {
            let batches = extract(&http, &args.url, &args.options(&config))?;
            println!("{}", serde_json::to_string_pretty(&batches)?);
        }
        Command::Stage {
            extract: args,
            request_id,
        } => {
            let request_id = request_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let batches = extract(&http, &args.url, &args.options(&config))?;
            let staged = stage_batches(
                &store,
                &config.bucket,
                &config.batch_prefix,
                &request_id,
                &batches,
            )?;
            println!("{}", serde_json::to_string_pretty(&staged)?);
        }
        Command::Process { bucket, key } => {
            let detector = build_detector(&http, &config)?;
            let recognizer = Recognizer::new(&http, &detector, config.naming_rule.clone());
            let outcomes = recognizer.process_batch_object(
                &store,
                &bucket,
                &key,
                &config.recognized_prefix,
            )?;
            println!("{}", serde_json::to_string_pretty(&outcomes)?);
        }
        Command::RecognizePage {
            extract: args,
            report,
        } => {
            let detector = build_detector(&http, &config)?;
            let recognizer = Recognizer::new(&http, &detector, config.naming_rule.clone());
            let urls: Vec<String> = extract(&http, &args.url, &args.options(&config))?
                .into_iter()
                .flat_map(|batch| batch.urls)
                .collect();
            let results = recognizer.recognize_urls(&urls);
            if let Some(path) = report {
                write_report(&path, &results)?;
            }
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        Command::InvokeCrawl { event, request_id } => {
            let event = read_event(&event)?;
            let service = CrawlService {
                pages: &http,
                store: &store,
                config: &config,
            };
            let ctx = InvocationContext { request_id };
            let response = handle_crawl_request(&event, &ctx, &service);
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::InvokeNotification { event } => {
            let event = read_event(&event)?;
            let detector = build_detector(&http, &config)?;
            let recognizer = Recognizer::new(&http, &detector, config.naming_rule.clone());
            let service = NotificationService {
                store: &store,
                recognizer: &recognizer,
                recognized_prefix: &config.recognized_prefix,
            };
            let response = handle_storage_notification(&event, &service);
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }
    Ok(())
}

fn init_config(paths: &AppPaths, force: bool) -> Result<()> {
    let path = paths.pipeline_config_path();
    if path.exists() && !force {
        println!("config already present: {}", path.display());
        return Ok(());
    }
    save_pipeline_config(paths, &PipelineConfig::default())?;
    println!("wrote {}", path.display());
    Ok(())
}

fn build_detector(http: &HttpClient, config: &PipelineConfig) -> Result<HttpSubjectDetector> {
    let Some(endpoint) = config.detector_endpoint.as_deref() else {
        bail!("no detector_endpoint configured; set it in the pipeline config");
    };
    Ok(HttpSubjectDetector::new(
        http.agent().clone(),
        endpoint,
        config.detector_token(),
    )?)
}

fn read_event(path: &Path) -> Result<serde_json::Value> {
    let raw = std::fs::read(path)
        .with_context(|| format!("failed to read event file {}", path.display()))?;
    serde_json::from_slice(&raw)
        .with_context(|| format!("event file {} is not valid JSON", path.display()))
}

fn write_report(path: &Path, results: &[RecognizedImage]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create report {}", path.display()))?;
    writer.write_record(["image_url", "label", "confidence", "error"])?;
    for result in results {
        match (&result.subjects, &result.error) {
            (Some(subjects), _) if !subjects.is_empty() => {
                for subject in subjects {
                    let confidence = format!("{:.2}", subject.confidence);
                    writer.write_record([
                        result.url.as_str(),
                        subject.label.as_str(),
                        confidence.as_str(),
                        "",
                    ])?;
                }
            }
            (_, error) => {
                writer.write_record([
                    result.url.as_str(),
                    "",
                    "",
                    error.as_deref().unwrap_or(""),
                ])?;
            }
        }
    }
    writer.flush()?;
    Ok(())
}
