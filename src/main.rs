use clap::Parser;

use repogate::{
    cli::{
        args::{CliArgs, Command},
        command_handlers::{do_resolve, do_serve},
    },
    config::RepogateConfig,
};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run() {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli_args = CliArgs::parse();
    let config = RepogateConfig::load(&cli_args.config, cli_args.overrides())?;

    match cli_args.cmd {
        Command::Serve { .. } => do_serve(&config),
        Command::Resolve { version } => do_resolve(&config, version.as_deref()),
    }
}
