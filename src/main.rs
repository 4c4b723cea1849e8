pub mod classify;
pub mod config;
pub mod data;
pub mod join;
pub mod output;
pub mod server;
pub mod session;
pub mod types;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join, classify and write the choropleth as GeoJSON
    Export {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        /// Attribute to color by (defaults to the configured one)
        #[arg(short, long)]
        attribute: Option<String>,
        /// Output file (defaults to output.geojson from the config)
        #[arg(short, long, value_name = "FILE")]
        out: Option<PathBuf>,
    },
    /// Serve the choropleth data API
    Serve {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
}

async fn prepare(
    app_config: &config::AppConfig,
) -> anyhow::Result<(session::Session, Vec<types::BackgroundLayer>)> {
    // 1. Load every input; any failure stops here
    let data::LoadedInputs {
        records,
        mut features,
        background,
    } = data::load_inputs(app_config).await?;

    // 2. Join attribute table onto the enumeration units
    join::join_attributes(&records, &mut features, &app_config.attribute_names());

    // 3. Classify the default attribute
    let session = session::Session::from_config(features, app_config)
        .context("Failed to build choropleth session")?;

    Ok((session, background))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Export {
            config,
            attribute,
            out,
        } => {
            info!("Exporting choropleth with config: {:?}", config);
            let app_config = config::AppConfig::load_from_file(config)?;
            let (mut session, _) = prepare(&app_config).await?;

            if let Some(name) = attribute {
                session.select_attribute(name)?;
            }

            let collection = output::feature_collection(&session);
            let path = out.as_ref().unwrap_or(&app_config.output.geojson);
            output::write_geojson(&collection, path)?;

            info!("Export complete!");
        }
        Commands::Serve { config } => {
            info!("Serving choropleth with config: {:?}", config);
            let app_config = config::AppConfig::load_from_file(config)?;
            let (session, background) = prepare(&app_config).await?;

            server::start_server(app_config, session, background).await?;
        }
    }

    Ok(())
}
