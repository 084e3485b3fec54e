use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

#[derive(Debug, Parser)]
#[command(
    name = "litbase",
    about = "Keep a searchable knowledge base in sync with a document library"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Override the embedding model ID (`hashing-v1` for the built-in one)
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Bring the knowledge base up to date with the library (incremental)
    Sync(SyncArgs),
    /// Reprocess the whole library and write a fresh index
    Rebuild(SyncArgs),
    /// Replace the knowledge base with the built-in demo corpus
    Seed(SeedArgs),
    /// Search the committed knowledge base
    Search(SearchArgs),
    /// Show knowledge base status and statistics
    Status(StatusArgs),
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Sync / Rebuild --

#[derive(Debug, Parser)]
pub struct SyncArgs {
    /// Library directory (defaults to `library` in config.toml)
    #[arg(short = 'l', long)]
    pub library: Option<PathBuf>,

    /// Do not call the metadata API; score every record heuristically
    #[arg(long)]
    pub offline: bool,

    /// Print the run report as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Seed --

#[derive(Debug, Parser)]
pub struct SeedArgs {
    /// Replace a knowledge base that already has records
    #[arg(long)]
    pub force: bool,

    /// Print the run report as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query
    pub query: String,

    /// Number of results to return
    #[arg(short = 'n', long, default_value = "10")]
    pub count: usize,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,

    /// Minimum score threshold
    #[arg(long, default_value = "-1.0", allow_hyphen_values = true)]
    pub min_score: f32,
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "litbase",
            &mut std::io::stdout(),
        );
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn parse_search_defaults() {
        let cli = Cli::parse_from(["litbase", "search", "statins"]);
        match cli.command {
            Command::Search(args) => {
                assert_eq!(args.query, "statins");
                assert_eq!(args.count, 10);
                assert!(!args.json);
                assert_eq!(args.min_score, -1.0);
            }
            _ => panic!("expected search command"),
        }
    }

    #[test]
    fn parse_sync_with_global_flags() {
        let cli = Cli::parse_from([
            "litbase",
            "sync",
            "--library",
            "/papers",
            "--offline",
            "--data-dir",
            "/tmp/kb",
            "-vv",
        ]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/kb")));
        match cli.command {
            Command::Sync(args) => {
                assert_eq!(args.library, Some(PathBuf::from("/papers")));
                assert!(args.offline);
            }
            _ => panic!("expected sync command"),
        }
    }

    #[test]
    fn quiet_conflicts_with_verbose() {
        assert!(Cli::try_parse_from(["litbase", "-q", "-v", "status"]).is_err());
    }

    #[test]
    fn command_definition_is_valid() {
        Cli::command().debug_assert();
    }
}
