use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use docvault::config::{self, Config};
use docvault::offline::{ItemMetadata, ItemStatus, ItemType, OfflineItem};
use docvault::App;

#[derive(Parser, Debug)]
#[command(name = "docvault")]
#[command(about = "Keep reports, dashboards and datasets available offline")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/docvault/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List offline items
  List {
    #[arg(long = "type")]
    item_type: Option<ItemType>,
    #[arg(long)]
    status: Option<ItemStatus>,
    #[arg(long)]
    tag: Option<String>,
  },
  /// Show one item
  Show { id: String },
  /// Request offline access to remote content
  Add {
    id: String,
    #[arg(long = "type")]
    item_type: ItemType,
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "")]
    description: String,
    #[arg(long, default_value = "")]
    owner: String,
    #[arg(long = "tag")]
    tags: Vec<String>,
  },
  /// Delete an item and its local file
  Remove { id: String },
  /// Download a pending item
  Download { id: String },
  /// Retry a failed download
  Retry { id: String },
  /// Show storage used by offline content
  Usage,
  /// Reconcile offline content with the server
  Sync,
  /// Manage the stored API token
  Token {
    #[command(subcommand)]
    action: TokenAction,
  },
}

#[derive(Subcommand, Debug)]
enum TokenAction {
  /// Store a bearer token
  Set { token: String },
  /// Forget the stored token
  Clear,
}

/// Log to a daily file in the data directory so stdout stays for command output.
fn init_logging() -> Result<WorkerGuard> {
  let log_dir = config::data_dir()?.join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "docvault.log"));

  tracing_subscriber::registry()
    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "docvault=info".into()))
    .with(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false))
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _log_guard = init_logging()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let app = App::open(config)?;

  run(&app, args.command).await
}

async fn run(app: &App, command: Command) -> Result<()> {
  let cache = app.cache();

  match command {
    Command::List {
      item_type,
      status,
      tag,
    } => {
      let mut items = match (item_type, status, tag.as_deref()) {
        (Some(t), _, _) => cache.get_by_type(t),
        (None, Some(s), _) => cache.get_by_status(s),
        (None, None, Some(t)) => cache.get_by_tag(t),
        (None, None, None) => cache.all(),
      };
      // Narrow further when several filters are given
      items.retain(|i| {
        status.map_or(true, |s| i.status == s) && tag.as_deref().map_or(true, |t| i.has_tag(t))
      });

      if items.is_empty() {
        println!("No offline items");
      }
      for item in items {
        println!("{}", summary_line(&item));
      }
    }
    Command::Show { id } => {
      let item = cache
        .get_by_id(&id)
        .ok_or_else(|| eyre!("No offline item {}", id))?;
      println!("{}", serde_json::to_string_pretty(&item)?);
    }
    Command::Add {
      id,
      item_type,
      name,
      description,
      owner,
      tags,
    } => {
      let metadata = ItemMetadata {
        name,
        description,
        owner,
        tags: tags.into_iter().collect::<BTreeSet<_>>(),
      };
      cache.add(OfflineItem::new(id.clone(), item_type, metadata))?;
      println!("Added {} ({})", id, item_type);
    }
    Command::Remove { id } => match cache.remove(&id)? {
      Some(removal) => {
        println!("Removed {}", removal.item.id);
        if let Some(e) = removal.file_error {
          eprintln!("warning: local file could not be deleted: {}", e);
        }
      }
      None => return Err(eyre!("No offline item {}", id)),
    },
    Command::Download { id } => {
      let item = app.downloader().download(&id).await.map_err(explain)?;
      println!("{}", summary_line(&item));
    }
    Command::Retry { id } => {
      let item = app.downloader().retry(&id).await.map_err(explain)?;
      println!("{}", summary_line(&item));
    }
    Command::Usage => {
      println!(
        "{} items, {} used",
        cache.len(),
        format_bytes(cache.total_storage_used())
      );
    }
    Command::Sync => {
      let report = app.sync().start_sync().await.map_err(explain)?;
      println!(
        "Checked {} items at {}",
        report.checked,
        report.synced_at.format("%Y-%m-%d %H:%M:%S UTC")
      );
      for id in &report.outdated {
        println!("  outdated: {}", id);
      }
      for id in &report.missing {
        println!("  missing on server: {}", id);
      }
    }
    Command::Token { action } => match action {
      TokenAction::Set { token } => {
        app.api().set_token(&token)?;
        println!("Token stored");
      }
      TokenAction::Clear => {
        app.api().clear_token()?;
        println!("Token cleared");
      }
    },
  }

  Ok(())
}

/// Turn a library error into a report, hinting when trying again may help.
fn explain(e: docvault::Error) -> color_eyre::Report {
  if e.is_retryable() {
    eyre!("{} (temporary, try again)", e)
  } else {
    e.into()
  }
}

fn summary_line(item: &OfflineItem) -> String {
  let detail = match item.status {
    ItemStatus::Downloading => item
      .download_progress
      .map(|p| format!(" {}%", p))
      .unwrap_or_default(),
    ItemStatus::Downloaded => format!(" {}", format_bytes(item.size)),
    ItemStatus::Error => format!(" {}", item.error.as_deref().unwrap_or("unknown error")),
    ItemStatus::Pending => String::new(),
  };
  format!(
    "{:<24} {:<10} {:<12} {}{}",
    item.id, item.item_type, item.status, item.name, detail
  )
}

fn format_bytes(bytes: u64) -> String {
  const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
  let mut value = bytes as f64;
  let mut unit = 0;
  while value >= 1024.0 && unit < UNITS.len() - 1 {
    value /= 1024.0;
    unit += 1;
  }
  if unit == 0 {
    format!("{} {}", bytes, UNITS[0])
  } else {
    format!("{:.1} {}", value, UNITS[unit])
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_format_bytes() {
    assert_eq!(format_bytes(512), "512 B");
    assert_eq!(format_bytes(2048), "2.0 KB");
    assert_eq!(format_bytes(2_000_000), "1.9 MB");
  }

  #[test]
  fn test_cli_parses_add() {
    let args = Args::parse_from([
      "docvault", "add", "r1", "--type", "report", "--name", "Q3", "--tag", "a", "--tag", "b",
    ]);
    match args.command {
      Command::Add {
        id,
        item_type,
        tags,
        ..
      } => {
        assert_eq!(id, "r1");
        assert_eq!(item_type, ItemType::Report);
        assert_eq!(tags, vec!["a", "b"]);
      }
      other => panic!("unexpected command: {other:?}"),
    }
  }

  #[test]
  fn test_explain_hints_only_for_transient_errors() {
    let report = explain(docvault::Error::NoConnectivity);
    assert_eq!(report.to_string(), "no network connectivity (temporary, try again)");

    let report = explain(docvault::Error::NotFound("r1".to_string()));
    assert!(!report.to_string().contains("try again"));
  }

  #[test]
  fn test_cli_rejects_unknown_type() {
    assert!(Args::try_parse_from(["docvault", "list", "--type", "chart"]).is_err());
  }
}
