//! railhub server binary
//!
//! Loads the hub configuration, spawns the event loop and brings the
//! configured interfaces online until terminated.

use clap::Parser;
use railhub::config::{create_interface, HubConfig};
use railhub::core::{EventLoop, World};
use railhub::interface::Interface;
use railhub::logging::{self, Logger};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "railhub", about = "Model railroad command station hub")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "railhub.toml")]
    config: PathBuf,

    /// Force simulation IO handlers regardless of the config
    #[arg(long)]
    simulation: bool,

    /// Power up and start the world after the interfaces are online
    #[arg(long)]
    run: bool,

    /// Verbose internal diagnostics
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> railhub::Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(cli.verbose);

    let config = HubConfig::load(&cli.config)?;
    let simulation = cli.simulation || config.simulation;

    let logger = Logger::new(config.log_size);
    let world = World::new();
    let (event_loop, event_loop_thread) = EventLoop::spawn();

    let mut interfaces: Vec<Arc<dyn Interface>> = Vec::new();
    for entry in &config.interfaces {
        interfaces.push(create_interface(
            entry,
            event_loop.clone(),
            logger.clone(),
            world.clone(),
        )?);
    }

    {
        let world = world.clone();
        let interfaces = interfaces.clone();
        let run = cli.run;
        event_loop.call(move || {
            world.set_online(true);
            world.set_simulation(simulation);
            for interface in &interfaces {
                if let Err(e) = interface.clone().set_online(true, simulation) {
                    tracing::error!(object = interface.id(), "going online failed: {}", e);
                }
            }
            if run {
                world.run();
            }
        });
    }

    wait_for_shutdown();
    tracing::info!("shutting down");

    {
        let world = world.clone();
        let interfaces = interfaces.clone();
        event_loop.call(move || {
            world.stop();
            world.power_off();
            for interface in &interfaces {
                let _ = interface.clone().set_online(false, simulation);
            }
            world.set_online(false);
        });
    }
    event_loop_thread.stop();
    Ok(())
}

fn wait_for_shutdown() {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(_) => return,
    };
    runtime.block_on(async {
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
    });
}
