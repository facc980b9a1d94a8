use std::path::PathBuf;

use clap::ArgAction;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "neo", version, about = "Interactive coding agent")]
pub struct Cli {
    /// Workspace directory for the session. Defaults to the current
    /// directory.
    pub workspace: Option<PathBuf>,

    /// Append user inputs to this history file.
    #[arg(long = "history-file", value_name = "PATH")]
    pub history_file: Option<PathBuf>,

    /// Increase log verbosity (-v for debug, -vv for trace).
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}
