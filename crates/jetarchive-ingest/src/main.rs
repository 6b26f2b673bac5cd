//! Jetstream archiver daemon.
//!
//! Connects to a Jetstream firehose, classifies every event for the selected
//! archive mode and appends kept records to hourly JSONL shards.
//!
//! # Usage
//!
//! ```bash
//! # Posts only, from now, into ./data/
//! jetarchive
//!
//! # Everything, resuming from a cursor, into /archive/data_everything/
//! jetarchive --archive-all --cursor 1725911162329308 --output-dir /archive
//!
//! # Everything except posts, with handles, rate logging and metrics
//! jetarchive --non-posts --measure-rate --metrics-port 9091
//! ```
//!
//! Every flag can also be set through a `JETARCHIVE_*` environment variable
//! or a `.env` file.
//!
//! # Graceful Shutdown
//!
//! SIGINT (Ctrl+C) and SIGTERM stop the pipeline gracefully:
//! 1. The socket is closed after the current frame
//! 2. Remaining events are classified and the buffer is flushed
//! 3. Shard files are synced and closed
//! 4. The cursor to resume from is logged

use anyhow::{Context, Result, anyhow};
use clap::{ArgAction, Parser};
use jetarchive_core::DEFAULT_JETSTREAM_URL;
use jetarchive_core::metrics::{init_metrics, start_metrics_server};
use jetarchive_ingest::resolver::DEFAULT_HANDLE_SERVICE;
use jetarchive_ingest::{
    ArchivePipeline, Credentials, Features, OverflowPolicy, PipelineConfig, mode_from_flags,
    parse_cursor,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Jetstream firehose archiver.
#[derive(Parser, Debug)]
#[command(name = "jetarchive")]
#[command(about = "Archive the Bluesky Jetstream firehose into hourly JSONL files")]
#[command(version)]
struct Args {
    /// Account username (reserved; not needed to read the firehose)
    #[arg(long, env = "JETARCHIVE_USERNAME")]
    username: Option<String>,

    /// Account password (reserved; not needed to read the firehose)
    #[arg(long, env = "JETARCHIVE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Verbose logging
    #[arg(long, env = "JETARCHIVE_DEBUG")]
    debug: bool,

    /// Print the text of each kept record to stdout
    #[arg(long, env = "JETARCHIVE_STREAM")]
    stream: bool,

    /// Log records/minute and an estimated daily volume
    #[arg(long, env = "JETARCHIVE_MEASURE_RATE")]
    measure_rate: bool,

    /// Resolve each post author's handle
    #[arg(long, env = "JETARCHIVE_GET_HANDLES")]
    get_handles: bool,

    /// Resume from this event time (microseconds since the Unix epoch)
    #[arg(long, env = "JETARCHIVE_CURSOR")]
    cursor: Option<String>,

    /// Archive every event verbatim
    #[arg(long, env = "JETARCHIVE_ARCHIVE_ALL")]
    archive_all: bool,

    /// Archive every event except post creations, verbatim
    #[arg(long, env = "JETARCHIVE_NON_POSTS")]
    non_posts: bool,

    /// Root directory for the archive
    #[arg(long, short, env = "JETARCHIVE_OUTPUT_DIR", default_value = ".")]
    output_dir: PathBuf,

    /// Jetstream subscribe endpoint
    #[arg(long, env = "JETARCHIVE_ENDPOINT", default_value = DEFAULT_JETSTREAM_URL)]
    endpoint: String,

    /// Classified events per batch
    #[arg(long, env = "JETARCHIVE_BATCH_SIZE", default_value = "100")]
    batch_size: usize,

    /// Longest a kept record waits before being written (milliseconds)
    #[arg(long, env = "JETARCHIVE_FLUSH_INTERVAL_MS", default_value = "1000")]
    flush_interval_ms: u64,

    /// fsync shard files after every batch
    #[arg(long, env = "JETARCHIVE_FSYNC", default_value_t = true, action = ArgAction::Set)]
    fsync: bool,

    /// Reconnect if no frame arrives for this long (seconds)
    #[arg(long, env = "JETARCHIVE_READ_TIMEOUT_SECS", default_value = "60")]
    read_timeout_secs: u64,

    /// Queue length per live subscriber
    #[arg(long, env = "JETARCHIVE_SUBSCRIBER_CAPACITY", default_value = "1024")]
    subscriber_capacity: usize,

    /// What a full subscriber queue does: drop-oldest or block
    #[arg(long, env = "JETARCHIVE_SUBSCRIBER_OVERFLOW", default_value = "drop-oldest")]
    subscriber_overflow: OverflowPolicy,

    /// Service answering app.bsky.actor.getProfile
    #[arg(long, env = "JETARCHIVE_HANDLE_SERVICE", default_value = DEFAULT_HANDLE_SERVICE)]
    handle_service: String,

    /// Per-lookup handle resolution timeout (milliseconds)
    #[arg(long, env = "JETARCHIVE_HANDLE_TIMEOUT_MS", default_value = "2000")]
    handle_timeout_ms: u64,

    /// Stop instead of continuing when a batch cannot be written
    #[arg(long, env = "JETARCHIVE_STORAGE_FAILURE_FATAL")]
    storage_failure_fatal: bool,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, env = "JETARCHIVE_METRICS_PORT", default_value = "0")]
    metrics_port: u16,

    /// Environment file loaded before reading JETARCHIVE_* variables
    #[arg(long, env = "JETARCHIVE_DOTENV", default_value = ".env")]
    dotenv: PathBuf,
}

impl Args {
    /// Build the run configuration. Pure; fails on invalid combinations.
    fn into_config(self) -> jetarchive_ingest::Result<PipelineConfig> {
        let mode = mode_from_flags(self.archive_all, self.non_posts)?;
        let cursor = self.cursor.as_deref().map(parse_cursor).transpose()?;

        let credentials = match (self.username, self.password) {
            (None, None) => None,
            (username, password) => Some(Credentials {
                username: username.unwrap_or_default(),
                password: password.unwrap_or_default(),
            }),
        };

        let mut config = PipelineConfig {
            mode,
            cursor,
            features: Features {
                stream_stdout: self.stream,
                measure_rate: self.measure_rate,
                resolve_handles: self.get_handles,
            },
            credentials,
            storage_failure_fatal: self.storage_failure_fatal,
            ..Default::default()
        };
        config.connection.endpoint = self.endpoint;
        config.connection.read_timeout = Duration::from_secs(self.read_timeout_secs);
        config.batch.max_events = self.batch_size;
        config.batch.flush_interval = Duration::from_millis(self.flush_interval_ms);
        config.router.output_root = self.output_dir;
        config.router.fsync = self.fsync;
        config.publisher.capacity = self.subscriber_capacity;
        config.publisher.overflow = self.subscriber_overflow;
        config.resolver.service_url = self.handle_service;
        config.resolver.timeout = Duration::from_millis(self.handle_timeout_ms);

        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(debug: bool) -> Result<()> {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level))
        .add_directive("tungstenite=warn".parse()?)
        .add_directive("tokio_tungstenite=warn".parse()?)
        .add_directive("reqwest=warn".parse()?)
        .add_directive("hyper=warn".parse()?)
        .add_directive("hyper_util=warn".parse()?);

    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = Args::parse();
    match dotenvy::from_path(&args.dotenv) {
        // Re-read so variables from the file apply.
        Ok(()) => args = Args::parse(),
        Err(e) if e.not_found() => {}
        Err(e) => return Err(e).with_context(|| format!("Failed to load {}", args.dotenv.display())),
    }

    init_tracing(args.debug)?;

    let metrics_port = args.metrics_port;
    let config = args.into_config().context("Invalid configuration")?;

    // Install rustls crypto provider (required when both ring and aws-lc-rs are present)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    tracing::info!("Jetstream archiver starting...");
    tracing::info!("Configuration:");
    tracing::info!("  Endpoint: {}", config.connection.endpoint);
    tracing::info!("  Mode: {}", config.mode);
    tracing::info!(
        "  Cursor: {}",
        config.cursor.map_or_else(|| "live".to_string(), |c| c.to_string())
    );
    tracing::info!(
        "  Output: {}",
        config.router.output_root.join(config.mode.directory()).display()
    );
    tracing::info!(
        "  Batch: {} events / {:?}",
        config.batch.max_events,
        config.batch.flush_interval
    );
    tracing::info!("  Features: {:?}", config.features);

    let pipeline = ArchivePipeline::new(config).context("Failed to prepare pipeline")?;

    // Initialize metrics
    if metrics_port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(metrics_port, metrics_handle)
            .await
            .context("Failed to start metrics server")?;
    }

    // Set up graceful shutdown
    let stop = pipeline.stop_handle();
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping gracefully...");
        stop.stop();
    })
    .context("Failed to set Ctrl+C handler")?;

    let summary = pipeline.run().await.context("Archive pipeline failed")?;

    // Print summary
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("SHUTDOWN COMPLETE");
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("Events received:      {}", summary.events);
    tracing::info!("Events kept:          {}", summary.kept);
    tracing::info!("Events dropped:       {}", summary.dropped);
    tracing::info!("Malformed frames:     {}", summary.malformed_frames);
    tracing::info!("Records written:      {}", summary.records_written);
    tracing::info!("Records lost:         {}", summary.records_lost);
    tracing::info!("Reconnects:           {}", summary.reconnects);
    match summary.cursor {
        Some(cursor) => tracing::info!("Resume with:          --cursor={}", cursor),
        None => tracing::info!("No events received; nothing to resume from"),
    }

    Ok(())
}
