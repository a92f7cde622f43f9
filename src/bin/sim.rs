use std::process;

use clap::Parser as ClapParser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use abrstream::sim::Simulation;
use abrstream::Settings;

#[derive(ClapParser, Debug)]
#[command(version, about = "Runs server and clients over a simulated network")]
struct Cli {
    /// Settings file; built-in defaults are used when absent.
    #[arg(short, long)]
    config: Option<String>,

    /// Number of clients, all started at time zero.
    #[arg(short = 'n', long, default_value_t = 1)]
    clients: usize,

    /// Give up after this much virtual time, in seconds.
    #[arg(long, default_value_t = 3600)]
    limit_secs: u64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let settings = match cli.config {
        Some(ref path) => match Settings::load(&path) {
            Ok(settings) => settings,
            Err(e) => {
                error!("Failed to load configuration: {}", e);
                process::exit(1);
            }
        },
        None => Settings::default(),
    };

    if let Err(e) = run(&settings, &cli) {
        error!("Simulation error: {}", e);
        process::exit(1);
    }
}

fn run(settings: &Settings, cli: &Cli) -> abrstream::Result<()> {
    let mut sim = Simulation::new(settings.server_config(), settings.link.clone())?;

    for _ in 0..cli.clients {
        sim.add_client(settings.client_config())?;
    }

    let finished = sim.run_until_finished(cli.limit_secs * 1000);

    for client in sim.clients() {
        let stats = client.player().stats();

        info!(
            "{}: played {} s in {} ticks, {} underruns, {} upgrades, {} downgrades, final level {}{}",
            client.addr(),
            stats.playback_time_s,
            stats.ticks_played,
            stats.underrun_ticks,
            stats.upgrades,
            stats.downgrades,
            stats.level,
            if client.is_finished() { "" } else { " (unfinished)" }
        );
    }

    let net = sim.network_stats();

    info!(
        "{} datagrams sent, {} delivered, {} lost, {} dropped, {} windows, {} ms",
        net.datagrams_sent,
        net.datagrams_delivered,
        net.datagrams_lost,
        net.datagrams_dropped,
        net.windows_sent,
        sim.now_ms()
    );

    if !finished {
        error!("not every client finished within {} s", cli.limit_secs);
    }

    Ok(())
}
