//! Destination liveness probing.
//!
//! One probe task per destination keeps a `HealthRecord` current. Local
//! targets get a TCP connect check, remote targets a HEAD request. Healthy
//! destinations are probed less often than unhealthy ones so recovery is
//! noticed quickly.
//!
//! Reads never perform I/O: `health` and `is_deliverable` only consult the
//! shared record map. Probe failures never escape the probe task.

use std::{collections::HashMap, sync::Arc, time::Duration};

use hookrelay_core::{
    models::{Destination, HealthProbe, HealthRecord},
    time::Clock,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::error::{DeliveryError, Result};

/// Probe timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Timeout for a single probe.
    pub probe_timeout: Duration,
    /// Delay between probes while healthy.
    pub healthy_interval: Duration,
    /// Delay between probes while unhealthy.
    pub unhealthy_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(1),
            healthy_interval: Duration::from_secs(5),
            unhealthy_interval: Duration::from_secs(1),
        }
    }
}

type HealthMap = Arc<RwLock<HashMap<String, HealthRecord>>>;

/// Maintains a health record per probed destination.
#[derive(Debug)]
pub struct HealthMonitor {
    config: HealthConfig,
    client: reqwest::Client,
    clock: Arc<dyn Clock>,
    records: HealthMap,
    shutdown: CancellationToken,
    generation: Mutex<Option<CancellationToken>>,
}

impl HealthMonitor {
    /// Creates a monitor whose probes stop when `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the probe HTTP client
    /// cannot be built.
    pub fn new(
        config: HealthConfig,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.probe_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build probe client: {e}"))
            })?;

        Ok(Self {
            config,
            client,
            clock,
            records: Arc::new(RwLock::new(HashMap::new())),
            shutdown,
            generation: Mutex::new(None),
        })
    }

    /// Starts probing the given destinations.
    ///
    /// Replaces any previous probe set: earlier probe tasks are cancelled and
    /// records of destinations no longer present are dropped. Destinations
    /// with an invalid probe are marked unhealthy once and never probed; the
    /// warning for them comes from `routing::warn_issues`.
    pub fn start(&self, destinations: &[Destination]) {
        let token = self.shutdown.child_token();
        if let Some(previous) = self.generation.lock().replace(token.clone()) {
            previous.cancel();
        }

        {
            let mut records = self.records.write();
            records.retain(|name, _| {
                destinations.iter().any(|d| &d.name == name && d.health_probe.is_some())
            });
        }

        let mut probed = 0usize;
        for destination in destinations {
            let Some(probe) = destination.health_probe.clone() else {
                continue;
            };

            if let Err(err) = probe.validate() {
                tracing::debug!(
                    destination = %destination.name,
                    error = %err,
                    "invalid health probe, destination marked unhealthy"
                );
                self.records
                    .write()
                    .insert(
                        destination.name.clone(),
                        HealthRecord::unhealthy(self.clock.now_utc()),
                    );
                continue;
            }

            let task = ProbeTask {
                name: destination.name.clone(),
                probe,
                config: self.config.clone(),
                client: self.client.clone(),
                clock: Arc::clone(&self.clock),
                records: Arc::clone(&self.records),
            };
            tokio::spawn(task.run(token.clone()));
            probed += 1;
        }

        tracing::info!(destinations = destinations.len(), probed, "health probing started");
    }

    /// Latest record for a destination, if it has been probed.
    pub fn health(&self, destination: &str) -> Option<HealthRecord> {
        self.records.read().get(destination).copied()
    }

    /// Copy of every current record.
    pub fn snapshot(&self) -> HashMap<String, HealthRecord> {
        self.records.read().clone()
    }

    /// Whether attempts to the destination may be sent.
    ///
    /// Destinations without a record (no probe, or not probed yet) are
    /// deliverable.
    pub fn is_deliverable(&self, destination: &str) -> bool {
        self.records.read().get(destination).map_or(true, |record| record.is_healthy)
    }

    /// Cancels all probes. Safe to call repeatedly.
    pub fn stop(&self) {
        if let Some(token) = self.generation.lock().take() {
            token.cancel();
            tracing::info!("health probing stopped");
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(token) = self.generation.get_mut().take() {
            token.cancel();
        }
    }
}

struct ProbeTask {
    name: String,
    probe: HealthProbe,
    config: HealthConfig,
    client: reqwest::Client,
    clock: Arc<dyn Clock>,
    records: HealthMap,
}

impl ProbeTask {
    async fn run(self, token: CancellationToken) {
        tracing::debug!(destination = %self.name, probe = %self.probe, "probe task started");

        loop {
            let is_healthy = tokio::select! {
                biased;
                () = token.cancelled() => break,
                is_healthy = self.check() => is_healthy,
            };

            let now = self.clock.now_utc();
            let record =
                if is_healthy { HealthRecord::healthy(now) } else { HealthRecord::unhealthy(now) };
            let previous = self.records.write().insert(self.name.clone(), record);

            match (previous.map(|p| p.is_healthy), is_healthy) {
                (Some(true), false) | (None, false) => {
                    tracing::warn!(
                        destination = %self.name,
                        probe = %self.probe,
                        "destination unhealthy"
                    );
                },
                (Some(false), true) | (None, true) => {
                    tracing::info!(destination = %self.name, "destination healthy");
                },
                _ => {},
            }

            let interval = if is_healthy {
                self.config.healthy_interval
            } else {
                self.config.unhealthy_interval
            };

            tokio::select! {
                biased;
                () = token.cancelled() => break,
                () = self.clock.sleep(interval) => {},
            }
        }

        tracing::debug!(destination = %self.name, "probe task stopped");
    }

    async fn check(&self) -> bool {
        match &self.probe {
            HealthProbe::Tcp { target } => {
                let connect = TcpStream::connect(target.as_str());
                matches!(tokio::time::timeout(self.config.probe_timeout, connect).await, Ok(Ok(_)))
            },
            HealthProbe::Http { url } => {
                match self.client.head(url).timeout(self.config.probe_timeout).send().await {
                    Ok(_) => true,
                    Err(err) => {
                        tracing::trace!(
                            destination = %self.name,
                            error = %err,
                            "http probe failed"
                        );
                        false
                    },
                }
            },
        }
    }
}
