//! Operator subcommands over the local store

use clap::Subcommand;
use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;

use mealsync::cache::{CacheOrchestrator, HttpFetcher};
use mealsync::config::Config;
use mealsync::event::Connectivity;
use mealsync::queue::{MutationQueue, QueueStats, QueuedMutation};
use mealsync::remote::RemoteReplay;
use mealsync::storage::SqliteStore;

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
  /// Show queue statistics
  Stats,
  /// List queued mutations in processing order
  List,
  /// Drop finished mutations older than the retention window
  Cleanup,
  /// Remove every queued mutation
  Clear,
  /// Remove a pending mutation
  Remove {
    /// Mutation id as shown by `list`
    id: String,
  },
  /// POST pending mutations to the remote origin
  Replay,
  /// Populate the static cache and retire old cache generations
  Precache,
}

pub async fn run(command: Command, config: &Config) -> Result<()> {
  let path = config.storage_path()?;
  let store = Arc::new(SqliteStore::open(&path)?);
  tracing::debug!(path = %path.display(), "opened store");

  if let Command::Precache = command {
    return precache(store, config).await;
  }

  let queue = MutationQueue::open(store, config.queue.clone(), Connectivity::new(true))?;

  match command {
    Command::Stats => print_stats(&queue.get_queue_stats()),
    Command::List => {
      let stats = queue.get_queue_stats();
      if stats.items.is_empty() {
        println!("queue is empty");
      }
      for item in &stats.items {
        println!("{}", describe(item));
      }
    }
    Command::Cleanup => {
      let removed = queue.cleanup_queue()?;
      println!("removed {} finished mutation(s)", removed);
    }
    Command::Clear => {
      let removed = queue.clear_queue()?;
      println!("cleared {} mutation(s)", removed);
    }
    Command::Remove { id } => {
      if queue.remove_item(&id)? {
        println!("removed {}", id);
      } else {
        println!("{} is not a pending mutation", id);
      }
    }
    Command::Replay => {
      let origin = config.origin()?;
      let timeout = config.remote.timeout_secs.map(Duration::from_secs);
      let fetcher = Arc::new(HttpFetcher::new(timeout)?);
      queue.register_processor("*", RemoteReplay::new(fetcher, origin))?;
      queue.process_queue().await?;
      print_stats(&queue.get_queue_stats());
    }
    Command::Precache => {}
  }

  Ok(())
}

async fn precache(store: Arc<SqliteStore>, config: &Config) -> Result<()> {
  let origin = config.origin()?;
  let timeout = config.remote.timeout_secs.map(Duration::from_secs);
  let fetcher = Arc::new(HttpFetcher::new(timeout)?);
  let cache = CacheOrchestrator::new(store, fetcher, origin, config.cache.clone())?;

  let cached = cache.install().await?;
  let retired = cache.activate()?;
  println!("precached {} asset(s)", cached);
  for bucket in retired {
    println!("deleted stale bucket {}", bucket);
  }
  Ok(())
}

fn print_stats(stats: &QueueStats) {
  println!("total       {}", stats.total);
  println!("pending     {}", stats.pending);
  println!("processing  {}", stats.processing);
  println!("completed   {}", stats.completed);
  println!("failed      {}", stats.failed);
  if let Some(oldest) = stats.oldest_pending {
    println!("oldest      {}", oldest.format("%Y-%m-%d %H:%M:%S UTC"));
  }
}

fn describe(item: &QueuedMutation) -> String {
  let mut line = format!(
    "{}  {:<10}  {}  p{}  {}/{}",
    item.id,
    item.status.as_str(),
    item.key,
    item.priority,
    item.attempts,
    item.max_attempts
  );
  if let Some(error) = &item.last_error {
    line.push_str("  ");
    line.push_str(error);
  }
  line
}
