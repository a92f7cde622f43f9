use std::process;
use std::time;

use clap::Parser as ClapParser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use abrstream::server::Event;
use abrstream::{Server, Settings};

static EVENT_TIMEOUT: time::Duration = time::Duration::from_millis(1000);

#[derive(ClapParser, Debug)]
#[command(version, about = "Serves an adaptive-bitrate stream over UDP")]
struct Cli {
    /// Settings file; built-in defaults are used when absent.
    #[arg(short, long)]
    config: Option<String>,

    /// Address to listen on, overriding the settings file.
    #[arg(short, long)]
    bind: Option<std::net::SocketAddr>,
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

    if let Some(bind_addr) = cli.bind {
        settings.server.bind_addr = bind_addr;
    }

    let mut server = match Server::bind_with_config(settings.server.bind_addr, settings.server_config())
    {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start server: {}", e);
            process::exit(1);
        }
    };

    loop {
        while let Some(event) = server.wait_event_timeout(EVENT_TIMEOUT) {
            match event {
                Event::SessionOpened(addr) => {
                    info!("{}: session opened ({} total)", addr, server.session_count());
                }
                Event::WindowSent { .. } => {}
            }
        }
    }
}
