// Track Server - Main Entry Point
// Licensed under AGPL v3

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

use track_server::config::Config;
use track_server::net::{run_udp_output, ChannelOutput, ControlServer, TrackOutput};
use track_server::service::{ManagementService, ServiceOptions};
use track_server::sim::{run_sim, SimOptions};
use track_server::visualize::{StateFileVisualizer, TextVisualizer, Visualizer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command-line arguments
    let config = Config::parse();

    // Initialize logging
    init_logging(config.verbose);

    info!("Starting track server");
    info!(
        "Pool: {} tracks x {} points, queue bound {}",
        config.track_capacity, config.point_capacity, config.queue_capacity
    );

    // 1. Visualizer collaborators
    let mut visualizers: Vec<Box<dyn Visualizer>> =
        vec![Box::new(TextVisualizer::new(config.status_interval))];
    if !config.work_dir.is_empty() {
        if let Err(e) = std::fs::create_dir_all(&config.work_dir) {
            error!("Failed to create work_dir {}: {}", config.work_dir, e);
        } else {
            info!("State dump to {}/tracks.json", config.work_dir);
            visualizers.push(Box::new(StateFileVisualizer::new(
                &config.work_dir,
                Duration::from_secs(5),
            )));
        }
    }

    // 2. Transport egress: broadcast channel feeding any number of forwarders
    let mut outputs: Vec<Box<dyn TrackOutput>> = Vec::new();
    if let Some(target) = &config.track_output {
        let (tx, rx) = tokio::sync::broadcast::channel(100);
        outputs.push(Box::new(ChannelOutput::new(tx)));
        let target = target.clone();
        tokio::spawn(async move {
            run_udp_output(target, rx).await;
        });
    }

    // 3. Start the management service (spawns the dispatcher worker)
    let service = Arc::new(ManagementService::start(ServiceOptions {
        track_capacity: config.track_capacity,
        point_capacity: config.point_capacity,
        queue_capacity: config.queue_capacity,
        visualizers,
        outputs,
    }));
    info!("Management service started");

    // 4. Operator control listener
    let mut control_server = None;
    if let Some(listen) = &config.control_listen {
        match listen.parse::<std::net::SocketAddr>() {
            Ok(addr) => match ControlServer::start(addr, service.clone()).await {
                Ok(server) => control_server = Some(server),
                Err(e) => error!("Failed to start control server on {}: {}", addr, e),
            },
            Err(e) => error!("Invalid control address '{}': {}", listen, e),
        }
    }

    // 5. Built-in target simulator
    if config.sim {
        let sim_service = service.clone();
        let options = SimOptions {
            targets: config.sim_targets,
            interval: Duration::from_millis(config.sim_interval_ms),
            station_lat: config.latitude,
            station_lon: config.longitude,
            ..SimOptions::default()
        };
        tokio::spawn(async move {
            run_sim(sim_service, options).await;
        });
    } else if config.control_listen.is_none() {
        warn!("No simulator and no control listener; nothing will feed the store");
    }

    info!("Server ready");

    // Wait for shutdown signal (Ctrl+C)
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received shutdown signal (Ctrl+C)");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
            return Err(err.into());
        }
    }

    // Graceful shutdown
    info!("Shutting down...");
    if let Some(server) = control_server {
        server.shutdown().await;
    }
    service.shutdown().await;

    // Report final statistics
    let counters = service.counters();
    use std::sync::atomic::Ordering;
    info!(
        "Server stopped. {} commands, {} tracks created, {} terminated, {} merges",
        counters.commands_processed.load(Ordering::Relaxed),
        counters.tracks_created.load(Ordering::Relaxed),
        counters.tracks_terminated.load(Ordering::Relaxed),
        counters.merges_applied.load(Ordering::Relaxed),
    );

    Ok(())
}

/// Initialize logging subsystem
fn init_logging(verbose: bool) {
    use tracing_subscriber::fmt::format::FmtSpan;

    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .with_span_events(if verbose {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        });

    if verbose {
        subscriber
            .with_max_level(tracing::Level::DEBUG)
            .init();
        info!("Verbose logging enabled (DEBUG level)");
    } else {
        subscriber
            .with_max_level(tracing::Level::INFO)
            .init();
    }
}
