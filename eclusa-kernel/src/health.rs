use crate::telemetry::Telemetry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::{self, JoinHandle};
use tracing::info;

#[derive(Debug, Serialize, Deserialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub memory_usage_mb: f32,
    pub plc_status: String,
    pub plc_address: String,
    pub plc_reconnects: u64,
    pub plc_last_error: Option<String>,
    pub subscribers: u32,
    pub tags_loaded: u32,
    pub tags_pollable: u32,
    pub tags_unreadable: u32,
    pub cache_size: u32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self { start_time: Instant::now() }
    }

    pub fn get_health(&self, telemetry: &Telemetry) -> KernelHealth {
        let link = telemetry.link().status();
        let catalog = telemetry.catalog();
        let plc_status = if link.connected {
            "connected"
        } else if link.connects == 0 {
            "connecting"
        } else {
            "reconnecting"
        };

        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            memory_usage_mb: get_memory_usage_mb(),
            plc_status: plc_status.to_string(),
            plc_address: format!("{}:DB{}", link.ip, link.db_number),
            // la première connexion n'est pas une reconnexion
            plc_reconnects: link.connects.saturating_sub(1),
            plc_last_error: link.last_error,
            subscribers: telemetry.hub().subscriber_count() as u32,
            tags_loaded: catalog.tags().len() as u32,
            tags_pollable: catalog.pollable().count() as u32,
            tags_unreadable: catalog.unreadable_count() as u32,
            cache_size: telemetry.cache().len() as u32,
        }
    }

    /// Ligne de santé du kernel dans les logs, toutes les `every`
    pub fn spawn_health_reporter(
        &self,
        telemetry: Arc<Telemetry>,
        every: Duration,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let health_tracker = self.clone();

        task::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await; // premier tick immédiat, rien à dire encore

            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = interval.tick() => {
                        let health = health_tracker.get_health(&telemetry);
                        info!(
                            "[health] uptime {}s, plc {} ({} reconnects), {} subscribers, {}/{} tags cached, {:.1} MB",
                            health.uptime_seconds,
                            health.plc_status,
                            health.plc_reconnects,
                            health.subscribers,
                            health.cache_size,
                            health.tags_pollable,
                            health.memory_usage_mb
                        );
                    }
                }
            }
        })
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("VmRSS:") {
                    if let Some(kb) = rest.split_whitespace().next().and_then(|kb| kb.parse::<u64>().ok()) {
                        return (kb as f32) / 1024.0; // KB -> MB
                    }
                }
            }
        }
    }

    0.0
}
