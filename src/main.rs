use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod metadata;
mod scrape;
#[cfg(test)]
mod tests;
mod web;

use cli::{Args, Command};
use config::Config;
use metadata::Engine;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("linkkeep=info,tower_http=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let base_path = match args.config_dir {
        Some(dir) => dir,
        None => config::default_base_path()?,
    };
    let mut config = Config::load_with(&base_path)?;

    match args.command {
        Command::Serve { addr } => {
            if let Some(addr) = addr {
                config.server.addr = addr;
            }
            web::start_daemon(config)
        }

        Command::Meta {
            url,
            no_headless,
            report,
        } => {
            if no_headless {
                config.stages.browser_enabled = false;
            }

            let resolution = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?
                .block_on(async {
                    let engine = Engine::new(&config)?;
                    anyhow::Ok(engine.resolve_with_report(&url).await?)
                })?;

            if report {
                println!("{}", serde_json::to_string_pretty(&resolution.report)?);
            }
            println!("{}", serde_json::to_string_pretty(resolution.result.as_ref())?);
            Ok(())
        }

        Command::Classify { url } => {
            let classifier = metadata::platform::PlatformClassifier::new(&config.platforms)?;
            println!("{}", classifier.classify(&url));
            Ok(())
        }
    }
}
