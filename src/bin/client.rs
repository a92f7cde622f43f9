use std::process;

use clap::Parser as ClapParser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use abrstream::client::Event;
use abrstream::player::TickOutcome;
use abrstream::{Client, Settings};

#[derive(ClapParser, Debug)]
#[command(version, about = "Plays an adaptive-bitrate stream pulled over UDP")]
struct Cli {
    /// Settings file; built-in defaults are used when absent.
    #[arg(short, long)]
    config: Option<String>,

    /// Server address, overriding the settings file.
    #[arg(short, long)]
    server: Option<std::net::SocketAddr>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let mut settings = match cli.config {
        Some(path) => match Settings::load(&path) {
            Ok(settings) => settings,
            Err(e) => {
                error!("Failed to load configuration: {}", e);
                process::exit(1);
            }
        },
        None => Settings::default(),
    };

    if let Some(server_addr) = cli.server {
        settings.client.server_addr = server_addr;
    }

    let mut client = match Client::connect_with_config(settings.client.server_addr, settings.client_config())
    {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to start client: {}", e);
            process::exit(1);
        }
    };

    while let Some(event) = client.wait_event() {
        match event {
            Event::Tick(TickOutcome::Underrun { buffered, streak }) => {
                info!("rebuffering: {} frames buffered, streak {}", buffered, streak);
            }
            Event::Tick(_) => {}
            Event::LevelChange { from, to } => {
                info!("level {} -> {}", from, to);
            }
            Event::Finished => break,
        }
    }

    let stats = client.stats();

    info!(
        "played {} s in {} ticks, {} underruns, {} upgrades, {} downgrades, final level {}",
        stats.playback_time_s,
        stats.ticks_played,
        stats.underrun_ticks,
        stats.upgrades,
        stats.downgrades,
        stats.level
    );
}
