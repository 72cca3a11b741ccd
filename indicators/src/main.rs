use anyhow::Context;
use clap::{Arg, ArgMatches, Command};
use common::config::Settings;
use std::process;

const DEFAULT_CONFIG: &str = "config/indicators.toml";

fn config_arg() -> Arg {
    Arg::new("config")
        .short('c')
        .long("config")
        .value_name("FILE")
        .help("Sets a custom config file")
}

fn load_settings(matches: &ArgMatches) -> anyhow::Result<Settings> {
    let config_path = matches
        .get_one::<String>("config")
        .map(|s| s.as_str())
        .unwrap_or(DEFAULT_CONFIG);

    let settings = Settings::new(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    indicators::logging::init(&settings.logging)?;
    tracing::info!(config = config_path, "Configuration loaded");
    Ok(settings)
}

async fn run(matches: ArgMatches) -> anyhow::Result<()> {
    match matches.subcommand() {
        Some(("build", sub)) => {
            let settings = load_settings(sub)?;
            settings.validate()?;
            let summary = indicators::run_pipeline(&settings).await?;
            tracing::info!(
                run_id = %summary.manifest.run_id,
                rows = summary.manifest.row_count,
                staged = summary.staged.len(),
                "Pipeline finished"
            );
        }
        Some(("export-features", sub)) => {
            let settings = load_settings(sub)?;
            settings.validate()?;
            let written = indicators::export_features(&settings).await?;
            tracing::info!(key = %written.key, rows = written.row_count, "Features exported");
        }
        Some(("serve", sub)) => {
            let settings = load_settings(sub)?;
            indicators::serve(&settings).await?;
        }
        _ => anyhow::bail!("No subcommand specified. Use --help for usage information."),
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let matches = Command::new("Municipal Health Indicators")
        .version("1.0")
        .about("Builds and serves per-municipality health indicators")
        .subcommand(
            Command::new("build")
                .about("Run the pipeline and materialize the indicator table")
                .arg(config_arg()),
        )
        .subcommand(
            Command::new("export-features")
                .about("Write the numeric feature table for clustering")
                .arg(config_arg()),
        )
        .subcommand(
            Command::new("serve")
                .about("Serve the read-only indicator API")
                .arg(config_arg()),
        )
        .get_matches();

    if let Err(e) = run(matches).await {
        if tracing::dispatcher::has_been_set() {
            tracing::error!(error = %e, "Command failed");
        } else {
            eprintln!("Error: {:#}", e);
        }
        process::exit(1);
    }
}
