// src/engine/control_loop.rs

use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{self, JoinHandle};
use tokio::time::{interval, interval_at, Instant};

use crate::communication::ManualOverride;
use crate::control_system::SignalNetwork;
use crate::errors::ControlError;
use crate::monitoring::SnapshotPublisher;
use crate::sensors::SensorSampler;
use crate::shared_data::NetworkSnapshot;

const SIGNAL_TICK: Duration = Duration::from_secs(1);
const OVERRIDE_QUEUE: usize = 64;
const PUBLISH_QUEUE: usize = 16;

/// Locks the network, recovering the data if a task panicked while holding
/// the lock.
pub fn lock_network(network: &Mutex<SignalNetwork>) -> MutexGuard<'_, SignalNetwork> {
    network.lock().unwrap_or_else(|poisoned| {
        warn!("Signal network lock was poisoned, continuing with the last state");
        poisoned.into_inner()
    })
}

/// Handles to the running control tasks.
pub struct ControlLoop {
    network: Arc<Mutex<SignalNetwork>>,
    overrides: mpsc::Sender<ManualOverride>,
    snapshots: watch::Receiver<Arc<NetworkSnapshot>>,
    snapshot_tx: Arc<watch::Sender<Arc<NetworkSnapshot>>>,
    publish_tx: Option<mpsc::Sender<Arc<NetworkSnapshot>>>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    publisher: Option<JoinHandle<()>>,
}

/// Starts sampling, optimization, signal ticking and override intake on the
/// current tokio runtime. Intervals are read from the network's config once,
/// here.
pub fn spawn_control_loop(
    network: Arc<Mutex<SignalNetwork>>,
    mut sampler: Box<dyn SensorSampler>,
    publisher: Option<Box<dyn SnapshotPublisher>>,
) -> ControlLoop {
    let (sample_period, optimize_period, initial) = {
        let net = lock_network(&network);
        let timing = &net.config().timing;
        (
            Duration::from_secs(timing.camera_analysis_interval),
            Duration::from_secs(timing.optimization_interval),
            Arc::new(net.snapshot()),
        )
    };

    let (shutdown, _) = watch::channel(false);
    let (snapshot_tx, snapshots) = watch::channel(initial);
    let snapshot_tx = Arc::new(snapshot_tx);
    let (overrides, mut override_rx) = mpsc::channel::<ManualOverride>(OVERRIDE_QUEUE);

    let (publish_tx, publisher) = match publisher {
        Some(mut publisher) => {
            let (tx, mut rx) = mpsc::channel::<Arc<NetworkSnapshot>>(PUBLISH_QUEUE);
            let handle = task::spawn_blocking(move || {
                while let Some(snapshot) = rx.blocking_recv() {
                    if let Err(e) = publisher.publish(&snapshot) {
                        error!("Error publishing snapshot for cycle {}: {}", snapshot.cycle, e);
                    }
                }
            });
            (Some(tx), Some(handle))
        }
        None => (None, None),
    };

    let mut tasks = Vec::new();

    // Sensor sampling. Sensors may block, so they are read on the blocking
    // pool with the network unlocked; only the results are recorded under
    // the lock.
    {
        let network = Arc::clone(&network);
        let mut stop = shutdown.subscribe();
        tasks.push((
            "sampling",
            tokio::spawn(async move {
                let mut ticker = interval(sample_period);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = stop.changed() => break,
                    }

                    let layouts = lock_network(&network).layouts();
                    if layouts.is_empty() {
                        continue;
                    }
                    let sampled = task::spawn_blocking(move || {
                        let readings: Vec<_> = layouts
                            .iter()
                            .map(|layout| (layout.id, sampler.sample(layout)))
                            .collect();
                        (sampler, readings)
                    })
                    .await;
                    let readings = match sampled {
                        Ok((returned, readings)) => {
                            sampler = returned;
                            readings
                        }
                        Err(e) => {
                            error!("Sensor sampling stopped: {}", e);
                            break;
                        }
                    };

                    let mut net = lock_network(&network);
                    for (id, reading) in readings {
                        if let Err(e) = net.record_reading(id, reading) {
                            warn!("Reading for intersection {} dropped: {}", id, e);
                        }
                    }
                }
            }),
        ));
    }

    // Optimization cycles, each followed by a published snapshot.
    {
        let network = Arc::clone(&network);
        let mut stop = shutdown.subscribe();
        let snapshot_tx = Arc::clone(&snapshot_tx);
        let publish_tx = publish_tx.clone();
        tasks.push((
            "optimization",
            tokio::spawn(async move {
                let mut ticker = interval_at(Instant::now() + optimize_period, optimize_period);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let snapshot = {
                                let mut net = lock_network(&network);
                                match net.run_optimization_cycle() {
                                    Ok(plan) => {
                                        debug!("Cycle {} winner: {:?}", net.cycle(), plan.winner);
                                        Arc::new(net.snapshot())
                                    }
                                    Err(ControlError::ShutDown) => break,
                                    Err(e) => {
                                        error!("Optimization cycle failed: {}", e);
                                        continue;
                                    }
                                }
                            };
                            publish(&snapshot_tx, publish_tx.as_ref(), snapshot);
                        }
                        _ = stop.changed() => break,
                    }
                }
            }),
        ));
    }

    // Signal clock. Machines advance by the real time elapsed between ticks.
    {
        let network = Arc::clone(&network);
        let mut stop = shutdown.subscribe();
        tasks.push((
            "signal tick",
            tokio::spawn(async move {
                let mut last = Instant::now();
                let mut ticker = interval_at(last + SIGNAL_TICK, SIGNAL_TICK);
                loop {
                    tokio::select! {
                        now = ticker.tick() => {
                            let dt = now.saturating_duration_since(last);
                            last = now;
                            let faults = lock_network(&network).tick(dt);
                            if !faults.is_empty() {
                                error!("CRITICAL: {} intersection(s) forced to red", faults.len());
                            }
                        }
                        _ = stop.changed() => break,
                    }
                }
            }),
        ));
    }

    // Manual override intake.
    {
        let network = Arc::clone(&network);
        let mut stop = shutdown.subscribe();
        tasks.push((
            "override intake",
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        request = override_rx.recv() => {
                            let Some(request) = request else { break };
                            if let Err(e) = lock_network(&network).apply_override(&request) {
                                warn!("Manual override {:?} rejected: {}", request, e);
                            }
                        }
                        _ = stop.changed() => break,
                    }
                }
            }),
        ));
    }

    info!(
        "Control loop started: sampling every {:?}, optimizing every {:?}",
        sample_period, optimize_period
    );

    ControlLoop {
        network,
        overrides,
        snapshots,
        snapshot_tx,
        publish_tx,
        shutdown,
        tasks,
        publisher,
    }
}

fn publish(
    snapshot_tx: &watch::Sender<Arc<NetworkSnapshot>>,
    publish_tx: Option<&mpsc::Sender<Arc<NetworkSnapshot>>>,
    snapshot: Arc<NetworkSnapshot>,
) {
    snapshot_tx.send_replace(Arc::clone(&snapshot));
    if let Some(tx) = publish_tx {
        if let Err(e) = tx.try_send(snapshot) {
            warn!("Snapshot publisher is behind, dropping snapshot: {}", e);
        }
    }
}

impl ControlLoop {
    pub fn network(&self) -> Arc<Mutex<SignalNetwork>> {
        Arc::clone(&self.network)
    }

    /// Sender for manual overrides; clone it for each override source.
    pub fn override_sender(&self) -> mpsc::Sender<ManualOverride> {
        self.overrides.clone()
    }

    pub fn snapshots(&self) -> watch::Receiver<Arc<NetworkSnapshot>> {
        self.snapshots.clone()
    }

    /// Stops every task, forces all intersections to red and publishes the
    /// final snapshot.
    pub async fn shutdown(self) -> Arc<NetworkSnapshot> {
        info!("Stopping control loop");
        self.shutdown.send_replace(true);
        for (name, handle) in self.tasks {
            if let Err(e) = handle.await {
                error!("Control task '{}' ended abnormally: {}", name, e);
            }
        }

        let snapshot = {
            let mut net = lock_network(&self.network);
            net.shutdown();
            Arc::new(net.snapshot())
        };
        publish(&self.snapshot_tx, self.publish_tx.as_ref(), Arc::clone(&snapshot));

        drop(self.publish_tx);
        if let Some(handle) = self.publisher {
            if let Err(e) = handle.await {
                error!("Snapshot publisher ended abnormally: {}", e);
            }
        }
        info!("Control loop stopped, all signals red");
        snapshot
    }
}
