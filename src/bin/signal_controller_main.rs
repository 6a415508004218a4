use log::{error, info};
use signal_control::config::ControlConfig;
use signal_control::control_system::SignalNetwork;
use signal_control::engine::spawn_control_loop;
use signal_control::global_variables::{AMQP_URL, DEFAULT_CONFIG_FILE, SNAPSHOT_LOG_FILE};
use signal_control::monitoring::{listen_manual_overrides, AmqpPublisher, CsvPublisher, SnapshotPublisher};
use signal_control::sensors::SyntheticSampler;
use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::{Arc, Mutex};

// Environment:
//   SIGNAL_CONFIG    config file path (created with defaults when missing)
//   SIGNAL_AMQP_URL  enables the AMQP snapshot publisher and override listener
//   SIGNAL_SEED      seed for the synthetic sampler
#[tokio::main]
async fn main() {
    env_logger::init();

    let config_path = env::var("SIGNAL_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
    let config = match ControlConfig::load_or_create(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration in {}: {}", config_path.display(), e);
            process::exit(1);
        }
    };
    let network = match SignalNetwork::new(config) {
        Ok(network) => Arc::new(Mutex::new(network)),
        Err(e) => {
            error!("Could not build signal network: {}", e);
            process::exit(1);
        }
    };

    let seed = env::var("SIGNAL_SEED")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(42);
    let sampler = Box::new(SyntheticSampler::new(seed));

    let amqp_url = env::var("SIGNAL_AMQP_URL").ok();
    let publisher: Box<dyn SnapshotPublisher> = match &amqp_url {
        Some(url) => Box::new(AmqpPublisher::new(url.clone())),
        None => Box::new(CsvPublisher::new(SNAPSHOT_LOG_FILE)),
    };

    let control = spawn_control_loop(network, sampler, Some(publisher));

    if let Some(url) = amqp_url {
        let overrides = control.override_sender();
        tokio::spawn(async move {
            if let Err(e) = listen_manual_overrides(url, overrides).await {
                error!("Error in manual override listener: {}", e);
            }
        });
    } else {
        info!(
            "SIGNAL_AMQP_URL not set (e.g. {}), logging snapshots to {}",
            AMQP_URL, SNAPSHOT_LOG_FILE
        );
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for shutdown signal: {}", e);
    }
    let last = control.shutdown().await;
    info!(
        "Stopped after {} cycles, {} emergency preemptions",
        last.cycle, last.optimizer.emergency_preemptions
    );
}
