use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Directory holding config.yaml.
    ///
    /// *Defaults to $LINKKEEP_BASE_PATH or ~/.config/linkkeep*
    #[clap(long, env = "LINKKEEP_BASE_PATH")]
    pub config_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the metadata http service
    Serve {
        /// Listen address, overrides server.addr
        #[clap(long)]
        addr: Option<String>,
    },

    /// Resolve metadata for a url and print it as json
    Meta {
        url: String,

        /// Don't use headless browser
        #[clap(long, default_value = "false")]
        no_headless: bool,

        /// Print which stages ran and how long each took
        #[clap(long, default_value = "false")]
        report: bool,
    },

    /// Print the platform a url belongs to
    Classify { url: String },
}
