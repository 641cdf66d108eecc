mod cmd;
mod output;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use minicons_lib::EnvConfig;
use tracing_subscriber::EnvFilter;

/// minicons - inspect and maintain the signature state of a build tree
#[derive(Parser)]
#[command(name = "minicons")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Root of the build tree
  #[arg(long, global = true, default_value = ".")]
  root: PathBuf,

  /// State directory (default: <root>/.minicons)
  #[arg(long, global = true)]
  state_dir: Option<PathBuf>,

  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// List recorded nodes
  Status {
    /// Output as JSON
    #[arg(long)]
    json: bool,
  },

  /// Show the record of one node
  Show {
    /// Path, `value:<scope>/<name>` or `alias:<name>`
    identity: String,

    /// Output as JSON
    #[arg(long)]
    json: bool,
  },

  /// Drop records so the nodes are rebuilt next time
  Forget {
    #[arg(required = true)]
    identities: Vec<String>,
  },

  /// Remove every record
  Clean,
}

fn main() {
  let cli = Cli::parse();

  let filter = if cli.verbose {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
  } else {
    EnvFilter::from_default_env()
  };
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  if let Err(err) = run(&cli) {
    output::print_error(&format!("{:#}", err));
    std::process::exit(1);
  }
}

fn run(cli: &Cli) -> Result<()> {
  let config = load_config(cli)?;

  match &cli.command {
    Commands::Status { json } => cmd::cmd_status(&config, cli.verbose, *json),
    Commands::Show { identity, json } => cmd::cmd_show(&config, identity, *json),
    Commands::Forget { identities } => cmd::cmd_forget(&config, identities),
    Commands::Clean => cmd::cmd_clean(&config),
  }
}

fn load_config(cli: &Cli) -> Result<EnvConfig> {
  let root = dunce::canonicalize(&cli.root).with_context(|| format!("root {} does not exist", cli.root.display()))?;
  let mut config = EnvConfig::from_env(root).context("invalid environment configuration")?;
  if let Some(dir) = &cli.state_dir {
    config = config.with_state_dir(dir);
  }
  Ok(config)
}
