/**
 * POLL LOOP + SUPERVISEUR DE RECONNEXION
 *
 * Deux tâches indépendantes :
 * - superviseur : tente connect() à intervalle fixe tant que l'automate est absent,
 *   sans backoff ni abandon (l'automate est censé revenir)
 * - polling : à chaque tick, si connecté, lit chaque tag actif ; une lecture ratée
 *   laisse la valeur en cache intacte (périmée mais présente). S'il y a eu au moins
 *   un changement, ou une transition de connectivité, un payload complet est publié
 *   sans jamais attendre le hub.
 */

use crate::device::{DeviceLink, LinkError};
use crate::models::TagValue;
use crate::telemetry::Telemetry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Une ligne de log par tag et par fenêtre pour les erreurs de lecture
const READ_ERROR_LOG_WINDOW: Duration = Duration::from_secs(60);

pub fn spawn_reconnect_supervisor(
    link: Arc<DeviceLink>,
    every: Duration,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = ticker.tick() => {
                    if link.is_connected() {
                        continue;
                    }
                    if let Err(e) = link.connect().await {
                        warn!("[device] connect to {} failed: {} (retry in {:?})", link.target().ip, e, every);
                    }
                }
            }
        }
        debug!("[device] reconnect supervisor stopped");
    })
}

pub fn spawn_poll_loop(
    telemetry: Arc<Telemetry>,
    every: Duration,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut state = PollState::default();
        info!(
            "[poller] polling {} tags every {:?}",
            telemetry.catalog().pollable().count(),
            every
        );
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = ticker.tick() => {
                    poll_once(&telemetry, &mut state).await;
                }
            }
        }
        debug!("[poller] stopped");
    })
}

#[derive(Default)]
pub struct PollState {
    last_connected: bool,
    error_logged_at: HashMap<String, Instant>,
}

impl PollState {
    fn should_log(&mut self, tag: &str, now: Instant) -> bool {
        match self.error_logged_at.get(tag) {
            Some(at) if now.duration_since(*at) < READ_ERROR_LOG_WINDOW => false,
            _ => {
                self.error_logged_at.insert(tag.to_string(), now);
                true
            }
        }
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct TickReport {
    pub reads: usize,
    pub changes: usize,
    pub published: bool,
}

/// Un tick de polling
pub async fn poll_once(telemetry: &Telemetry, state: &mut PollState) -> TickReport {
    let link = telemetry.link();
    let mut report = TickReport::default();

    if link.is_connected() {
        for (tag, address) in telemetry.catalog().pollable() {
            match link.read_tag(address).await {
                Ok(value) => {
                    report.reads += 1;
                    let update = telemetry.cache().record(&tag.name, value);
                    if update.is_change() {
                        report.changes += 1;
                        if let TagValue::Bool(on) = value {
                            debug!("[poller] {} -> {}", tag.name, on);
                        }
                    }
                }
                Err(LinkError::NotConnected) => break,
                Err(e) => {
                    if state.should_log(&tag.name, Instant::now()) {
                        warn!("[poller] read of '{}' failed: {}", tag.name, e);
                    }
                    // lecture ratée = session fermée, le superviseur reprend la main
                    if !link.is_connected() {
                        break;
                    }
                }
            }
        }
    }

    let connected = link.is_connected();
    let transition = connected != state.last_connected;
    state.last_connected = connected;
    if transition {
        info!("[poller] device connectivity -> {}", connected);
    }

    if report.changes > 0 || transition {
        telemetry.publish_current();
        report.published = true;
    }
    report
}
