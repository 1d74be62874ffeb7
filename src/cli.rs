use std::path::PathBuf;

use clap::Parser;

/// Command-line options for magpie.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to the config file (default: platform config dir, or $MAGPIE_CONFIG)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the archive root directory
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Only process the named account (repeatable)
    #[arg(long)]
    pub account: Vec<String>,

    /// List each account's folder tree and exit without downloading
    #[arg(long)]
    pub list: bool,

    /// Compute what a run would download, but write nothing
    #[arg(long)]
    pub dry_run: bool,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
