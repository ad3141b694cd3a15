mod commands;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;

use mealsync::config::Config;

#[derive(Parser, Debug)]
#[command(name = "mealsync")]
#[command(about = "Inspect and replay the meal planner's offline write queue")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/mealsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Override the database path
  #[arg(long)]
  db: Option<PathBuf>,

  /// More output (-v info, -vv debug)
  #[arg(short, long, action = clap::ArgAction::Count)]
  verbose: u8,

  #[command(subcommand)]
  command: commands::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let mut config = Config::load(args.config.as_deref())?;
  if let Some(db) = args.db {
    config.storage.path = Some(db);
  }

  let _logging = mealsync::logging::init(&config.logging, args.verbose);

  commands::run(args.command, &config).await
}
