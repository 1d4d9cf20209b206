use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use edgecache::cache::{ResponseSource, SqliteStorage};
use edgecache::config::Config;
use edgecache::event::{EventLoop, EventSender, WorkerEvent};
use edgecache::host::LogHost;
use edgecache::network::{Destination, Fetcher, HttpFetcher, Request};
use edgecache::queue::QueuedEvent;
use edgecache::worker::EdgeWorker;

type Worker = EdgeWorker<SqliteStorage, HttpFetcher, LogHost>;

#[derive(Parser, Debug)]
#[command(name = "edgecache")]
#[command(about = "A caching interceptor that sits between an app and its origin")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/edgecache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Origin the worker serves, overriding config and EDGECACHE_ORIGIN
  #[arg(long)]
  origin: Option<String>,

  /// Write logs to this file instead of stderr
  #[arg(long)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Pre-cache the install manifest (and activate, unless skip_waiting is off)
  Install,
  /// Evict old bucket generations and claim clients
  Activate,
  /// Send a request through the interceptor
  Fetch {
    /// Absolute URL or a path on the origin
    url: String,
    #[arg(short, long, default_value = "GET")]
    method: String,
    /// Content category (inferred from the URL when omitted)
    #[arg(short, long, value_enum)]
    dest: Option<Destination>,
  },
  /// Queue an event for delivery on the next sync
  Record {
    name: String,
    /// Extra fields as a JSON object
    #[arg(long)]
    data: Option<String>,
  },
  /// Fire a sync signal
  Sync {
    #[arg(long)]
    tag: Option<String>,
  },
  /// Deliver a push payload
  Push { payload: String },
  /// Click a notification
  Click {
    /// view or dismiss
    action: String,
    /// Target carried in the notification data
    #[arg(long)]
    url: Option<String>,
  },
  /// List buckets in the store
  Buckets,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging(args.log_file.as_deref())?;

  let config = Config::load(args.config.as_deref())?;
  let config = match args.origin {
    Some(origin) => config.with_origin(origin)?,
    None => config,
  };

  let store = Arc::new(SqliteStorage::open(
    config.storage.path.as_deref(),
    config.storage.quota_bytes,
  )?);
  let network = Arc::new(HttpFetcher::new(Duration::from_secs(config.timeout_secs))?);
  let worker: Arc<Worker> = Arc::new(EdgeWorker::new(
    &config,
    store,
    network.clone(),
    Arc::new(LogHost),
  )?);

  if !matches!(args.command, Command::Install) {
    let state = worker.resume()?;
    info!(version = %config.version, ?state, "resumed worker");
  }

  let event_loop = EventLoop::start(worker.clone());
  let result = run(args.command, &config, &worker, &event_loop.sender(), &network).await;

  event_loop.shutdown().await;
  worker.settle().await;
  result
}

fn init_logging(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_env("EDGECACHE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  let Some(path) = log_file else {
    tracing_subscriber::registry()
      .with(filter)
      .with(fmt::layer().with_writer(std::io::stderr))
      .init();
    return Ok(None);
  };

  let file_name = path
    .file_name()
    .ok_or_else(|| eyre!("Log file path has no file name: {}", path.display()))?;
  let dir = match path.parent() {
    Some(dir) if !dir.as_os_str().is_empty() => dir,
    _ => Path::new("."),
  };
  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .init();
  Ok(Some(guard))
}

async fn run(
  command: Command,
  config: &Config,
  worker: &Worker,
  events: &EventSender,
  network: &HttpFetcher,
) -> Result<()> {
  match command {
    Command::Install => {
      let outcome = events.call(|reply| WorkerEvent::Install { reply }).await??;
      for url in &outcome.install.cached {
        println!("cached   {url}");
      }
      for url in &outcome.install.failed {
        println!("failed   {url}");
      }
      if let Some(activation) = outcome.activation {
        for bucket in &activation.evicted {
          println!("evicted  {bucket}");
        }
        println!("active, {} client(s) claimed", activation.claimed);
      }
    }

    Command::Activate => {
      let report = events.call(|reply| WorkerEvent::Activate { reply }).await??;
      for bucket in &report.evicted {
        println!("evicted  {bucket}");
      }
      println!("active, {} client(s) claimed", report.claimed);
    }

    Command::Fetch { url, method, dest } => {
      let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|_| eyre!("Invalid HTTP method: {}", method))?;
      let url = config.resolve(&url)?;
      let destination = dest.unwrap_or_else(|| Destination::infer(&url));
      let request = Request::new(method, url, destination);

      let served = events
        .call(|reply| WorkerEvent::Fetch {
          request: request.clone(),
          reply,
        })
        .await?;
      let (snapshot, source) = match served {
        Some(served) => (served.snapshot, source_label(served.source)),
        None => (network.fetch(&request).await?, "passthrough"),
      };
      println!(
        "{} ({}, {} bytes, {})",
        snapshot.status,
        source,
        snapshot.body.len(),
        snapshot.header("content-type").unwrap_or("no content type")
      );
      println!("{}", String::from_utf8_lossy(&snapshot.body));
    }

    Command::Record { name, data } => {
      let mut event = QueuedEvent::new(name);
      if let Some(data) = data {
        event.fields = serde_json::from_str(&data)
          .map_err(|e| eyre!("--data must be a JSON object: {}", e))?;
      }
      let queued = events.call(|reply| WorkerEvent::Record { event, reply }).await??;
      println!("{queued} event(s) queued");
    }

    Command::Sync { tag } => {
      let tag = tag.unwrap_or_else(|| config.sync.tag.clone());
      match events.call(|reply| WorkerEvent::Sync { tag, reply }).await? {
        None => println!("tag not recognized, nothing to do"),
        Some(Ok(report)) => println!("{} event(s) delivered", report.delivered),
        Some(Err(e)) => return Err(eyre!("Sync failed, queue kept for the next signal: {}", e)),
      }
    }

    Command::Push { payload } => {
      let payload = payload.into_bytes();
      match events.call(|reply| WorkerEvent::Push { payload, reply }).await? {
        Some(notification) => println!("shown: {}", notification.title),
        None => println!("payload dropped"),
      }
    }

    Command::Click { action, url } => {
      let payload = serde_json::json!({ "title": "edgecache", "data": { "url": url } });
      let payload = serde_json::to_vec(&payload)?;
      let notification = events
        .call(|reply| WorkerEvent::Push { payload, reply })
        .await?
        .ok_or_else(|| eyre!("Notification could not be rendered"))?;

      let outcome = events
        .call(|reply| WorkerEvent::NotificationClick {
          notification,
          action: Some(action),
          reply,
        })
        .await?;
      println!("{outcome:?}");
    }

    Command::Buckets => {
      for name in worker.bucket_names()? {
        println!("{name}");
      }
    }
  }

  Ok(())
}

fn source_label(source: ResponseSource) -> &'static str {
  match source {
    ResponseSource::Network => "network",
    ResponseSource::Cache => "cache",
    ResponseSource::Fallback => "offline fallback",
  }
}
