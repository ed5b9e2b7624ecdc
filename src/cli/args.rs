use std::path::PathBuf;

use clap::Parser;

use crate::config::Overrides;

/// Serialized access to a single git working copy, over HTTP.
#[derive(Debug, Parser)]
#[clap(version)]
pub struct CliArgs {
    #[clap(subcommand)]
    pub cmd: Command,
    /// Configuration file; ignored when it does not exist
    #[clap(short, long, default_value = "repogate.toml")]
    pub config: PathBuf,
    /// URI of the origin repository
    #[clap(long)]
    pub origin: Option<String>,
    /// Location of the managed working copy
    #[clap(long)]
    pub working_copy: Option<PathBuf>,
    /// Seconds a resolved version is cached, 0 disables the cache
    #[clap(long)]
    pub cache_ttl: Option<u64>,
}

#[derive(Debug, Parser)]
pub enum Command {
    ///Clones the origin and serves the HTTP API until interrupted
    Serve {
        /// Address to listen on
        #[clap(short, long)]
        listen: Option<String>,
    },
    ///Resolves a branch, tag or commit and prints its commit id
    Resolve {
        /// Defaults to the current branch
        version: Option<String>,
    },
}

impl CliArgs {
    pub fn overrides(&self) -> Overrides {
        let listen = match &self.cmd {
            Command::Serve { listen } => listen.clone(),
            Command::Resolve { .. } => None,
        };
        Overrides {
            origin_uri: self.origin.clone(),
            working_copy: self.working_copy.clone(),
            cache_ttl: self.cache_ttl,
            listen,
        }
    }
}
