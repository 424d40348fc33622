use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use canopy_config::HostConfig;
use canopy_dispatch::ChannelExecutor;
use canopy_listener::ListenerHost;
use canopy_storage::{FsBlobStore, MemoryMessageBus, MemoryQueueStore, StorageAccount, StorageAccounts};
use canopy_trigger::{PathPattern, TriggerKind, resolve_all};

const LOCAL_ACCOUNT: &str = "local";

/// Canopy - trigger listeners and coordination for function hosts
#[derive(Parser)]
#[command(name = "canopy")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.canopy)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Run a host against local storage, printing each invocation as a JSON line
  Watch {
    /// Path to the host config file (JSON)
    config_file: PathBuf,
  },

  /// Validate a host config and list its triggers
  Check {
    /// Path to the host config file (JSON)
    config_file: PathBuf,
  },

  /// Match a blob path against a path pattern and print the captures
  Match {
    /// Pattern such as "input/{name}.csv"
    pattern: String,

    /// Blob path such as "input/report.csv"
    path: String,
  },
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("canopy=info")),
    )
    .with_writer(std::io::stderr)
    .init();

  match cli.command {
    Some(Commands::Watch { config_file }) => {
      let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => dirs::home_dir()
          .context("could not determine home directory, pass --data-dir")?
          .join(".canopy"),
      };
      watch(config_file, data_dir)?;
    }
    Some(Commands::Check { config_file }) => {
      let rt = tokio::runtime::Runtime::new()?;
      rt.block_on(check(&config_file))?;
    }
    Some(Commands::Match { pattern, path }) => {
      match_path(&pattern, &path)?;
    }
    None => {
      println!("canopy - use --help to see available commands");
    }
  }

  Ok(())
}

async fn load_config(config_file: &Path) -> Result<HostConfig> {
  let content = tokio::fs::read_to_string(config_file)
    .await
    .with_context(|| format!("failed to read config file: {}", config_file.display()))?;

  HostConfig::from_json(&content)
    .with_context(|| format!("failed to parse config file: {}", config_file.display()))
}

fn watch(config_file: PathBuf, data_dir: PathBuf) -> Result<()> {
  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async { watch_async(config_file, data_dir).await })
}

async fn watch_async(config_file: PathBuf, data_dir: PathBuf) -> Result<()> {
  let config = load_config(&config_file).await?;

  let storage_dir = data_dir.join("storage");
  tokio::fs::create_dir_all(&storage_dir)
    .await
    .with_context(|| format!("failed to create storage directory: {}", storage_dir.display()))?;

  // Blobs live on disk; queues and the bus only exist for this process.
  let accounts = StorageAccounts::new(
    StorageAccount::new(LOCAL_ACCOUNT)
      .with_blobs(Arc::new(FsBlobStore::new(&storage_dir)))
      .with_queues(Arc::new(MemoryQueueStore::new()))
      .with_bus(Arc::new(MemoryMessageBus::new())),
  );

  let (executor, mut requests) = ChannelExecutor::new();
  let host = ListenerHost::new(&config, accounts, Arc::new(executor))
    .context("invalid host configuration")?;

  let printer = tokio::spawn(async move {
    while let Some(request) = requests.recv().await {
      match serde_json::to_string(&request) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!(error = %e, "failed to serialize invocation request"),
      }
    }
  });

  host.start().await.context("failed to start host")?;
  info!(
    host_id = %config.host_id,
    storage = %storage_dir.display(),
    functions = config.functions.len(),
    "watching for triggers, press ctrl-c to stop"
  );

  tokio::signal::ctrl_c()
    .await
    .context("failed to listen for ctrl-c")?;

  info!("shutting down");
  host.stop().await;
  // Dropping the host closes the request channel and ends the printer.
  drop(host);
  let _ = printer.await;

  Ok(())
}

async fn check(config_file: &Path) -> Result<()> {
  let config = load_config(config_file).await?;
  let triggers = resolve_all(&config.functions, LOCAL_ACCOUNT).context("invalid function")?;

  for trigger in &triggers {
    let target = match &trigger.kind {
      TriggerKind::Blob(blob) => blob.input.to_string(),
      TriggerKind::Queue(queue) => queue.name().to_string(),
      TriggerKind::Bus(entity) => entity.path().to_string(),
      TriggerKind::Timer(interval) => format!("every {}s", interval.as_secs()),
    };
    println!("{}\t{}\t{}", trigger.function.name, trigger.kind.name(), target);
  }
  eprintln!("{} function(s) OK", triggers.len());

  Ok(())
}

fn match_path(pattern: &str, path: &str) -> Result<()> {
  let pattern = PathPattern::parse(pattern).context("invalid pattern")?;
  let Some(captures) = pattern.matches(path) else {
    bail!("'{path}' does not match '{pattern}'");
  };
  println!("{}", serde_json::to_string_pretty(&captures)?);
  Ok(())
}
