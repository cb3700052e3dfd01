/**
 * FAN-OUT HUB - Diffusion des payloads vers tous les abonnés WebSocket
 *
 * RÔLE : Une tâche centrale (Dispatcher) possède l'ensemble des abonnés actifs et la
 * boîte de broadcast. Chaque abonné a sa propre boîte bornée, vidée par sa tâche
 * d'écriture (voir session.rs).
 *
 * FONCTIONNEMENT :
 * - Broadcast : try_send vers chaque abonné sous verrou de lecture, aucun envoi ne peut
 *   en bloquer un autre ; boîte pleine -> abonné évincé (trop lent)
 * - Register : insertion puis envoi asynchrone d'un snapshot à ce seul abonné
 * - Balayage périodique : abonné silencieux au-delà de ping × multiplicateur -> évincé
 * - Stop : l'ensemble est vidé, chaque boîte se ferme, chaque session envoie Close
 *
 * INVARIANT : l'entrée du HashMap détient l'unique Sender de la boîte. La retirer
 * ferme la boîte dans le même geste ; toute livraison passe par l'entrée, sous verrou.
 */

pub mod session;

use crate::config::HubConf;
use crate::state::{new_state, Shared};
use axum::extract::ws::Utf8Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Payload JSON déjà sérialisé, partagé sans copie entre abonnés
pub type Frame = Utf8Bytes;

/// Construit le snapshot envoyé à un nouvel abonné
pub type SnapshotFn = Arc<dyn Fn() -> Option<Frame> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("hub is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictReason {
    /// Boîte pleine au moment de la livraison
    Backpressure,
    /// Aucune réponse aux pings dans la fenêtre de vivacité
    Timeout,
}

#[derive(Debug, Clone)]
pub struct HubSettings {
    pub mailbox_capacity: usize,
    pub broadcast_capacity: usize,
    pub control_capacity: usize,
    pub ping_interval: Duration,
    pub liveness_timeout: Duration,
    pub write_timeout: Duration,
}

impl From<&HubConf> for HubSettings {
    fn from(conf: &HubConf) -> Self {
        let ping_interval = Duration::from_secs(conf.ping_interval_secs.max(1));
        Self {
            mailbox_capacity: conf.mailbox_capacity.max(1),
            broadcast_capacity: conf.broadcast_capacity.max(1),
            control_capacity: conf.control_capacity.max(1),
            ping_interval,
            liveness_timeout: ping_interval * conf.liveness_multiplier.max(1),
            write_timeout: Duration::from_millis(conf.write_timeout_ms),
        }
    }
}

/// Dernier signe de vie d'un abonné (pong ou tout autre message reçu)
#[derive(Clone)]
pub struct Liveness(Arc<Mutex<Instant>>);

impl Liveness {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }

    pub fn touch(&self) {
        *self.0.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.0.lock().elapsed()
    }
}

struct Subscriber {
    mailbox: mpsc::Sender<Frame>,
    liveness: Liveness,
    remote: Option<SocketAddr>,
}

/// Côté session d'un abonné enregistré
pub struct Registration {
    pub id: Uuid,
    pub mailbox: mpsc::Receiver<Frame>,
    pub liveness: Liveness,
}

enum Control {
    Register {
        id: Uuid,
        subscriber: Subscriber,
        ack: oneshot::Sender<()>,
    },
    Unregister {
        id: Uuid,
        ack: oneshot::Sender<()>,
    },
}

#[derive(Default)]
struct Counters {
    broadcasts: AtomicU64,
    deliveries: AtomicU64,
    snapshots: AtomicU64,
    joined: AtomicU64,
    left: AtomicU64,
    evicted_backpressure: AtomicU64,
    evicted_timeout: AtomicU64,
    last_broadcast: Mutex<Option<OffsetDateTime>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub active_subscribers: usize,
    pub broadcasts: u64,
    pub deliveries: u64,
    pub snapshots_sent: u64,
    pub joined: u64,
    pub left: u64,
    pub evicted_backpressure: u64,
    pub evicted_timeout: u64,
    pub last_broadcast: Option<String>,
}

/// Poignée clonable : enregistrement des sessions, envoi de broadcasts, stats
#[derive(Clone)]
pub struct HubHandle {
    control: mpsc::Sender<Control>,
    broadcast: mpsc::Sender<Frame>,
    subscribers: Shared<HashMap<Uuid, Subscriber>>,
    counters: Arc<Counters>,
    settings: Arc<HubSettings>,
}

pub struct Dispatcher {
    control: mpsc::Receiver<Control>,
    broadcast: mpsc::Receiver<Frame>,
    subscribers: Shared<HashMap<Uuid, Subscriber>>,
    counters: Arc<Counters>,
    settings: Arc<HubSettings>,
}

pub struct Hub;

impl Hub {
    pub fn new(settings: HubSettings) -> (HubHandle, Dispatcher) {
        let (control_tx, control_rx) = mpsc::channel(settings.control_capacity);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(settings.broadcast_capacity);
        let subscribers = new_state(HashMap::new());
        let counters = Arc::new(Counters::default());
        let settings = Arc::new(settings);

        let handle = HubHandle {
            control: control_tx,
            broadcast: broadcast_tx,
            subscribers: subscribers.clone(),
            counters: counters.clone(),
            settings: settings.clone(),
        };
        let dispatcher = Dispatcher {
            control: control_rx,
            broadcast: broadcast_rx,
            subscribers,
            counters,
            settings,
        };
        (handle, dispatcher)
    }
}

impl HubHandle {
    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    /// Boîte de broadcast, à passer au BroadcastPublisher
    pub fn broadcast_sender(&self) -> mpsc::Sender<Frame> {
        self.broadcast.clone()
    }

    /// Enregistre un abonné ; retourne une fois l'insertion faite par le dispatcher
    pub async fn register(&self, remote: Option<SocketAddr>) -> Result<Registration, HubError> {
        let id = Uuid::new_v4();
        let (mailbox_tx, mailbox_rx) = mpsc::channel(self.settings.mailbox_capacity);
        let liveness = Liveness::new();
        let (ack_tx, ack_rx) = oneshot::channel();

        let subscriber = Subscriber { mailbox: mailbox_tx, liveness: liveness.clone(), remote };
        self.control
            .send(Control::Register { id, subscriber, ack: ack_tx })
            .await
            .map_err(|_| HubError::Closed)?;
        ack_rx.await.map_err(|_| HubError::Closed)?;

        Ok(Registration { id, mailbox: mailbox_rx, liveness })
    }

    /// Retire un abonné (no-op s'il a déjà été évincé)
    pub async fn unregister(&self, id: Uuid) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.control.send(Control::Unregister { id, ack: ack_tx }).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn stats(&self) -> HubStats {
        let c = &self.counters;
        let last_broadcast = *c.last_broadcast.lock();
        HubStats {
            active_subscribers: self.subscriber_count(),
            broadcasts: c.broadcasts.load(Ordering::Relaxed),
            deliveries: c.deliveries.load(Ordering::Relaxed),
            snapshots_sent: c.snapshots.load(Ordering::Relaxed),
            joined: c.joined.load(Ordering::Relaxed),
            left: c.left.load(Ordering::Relaxed),
            evicted_backpressure: c.evicted_backpressure.load(Ordering::Relaxed),
            evicted_timeout: c.evicted_timeout.load(Ordering::Relaxed),
            last_broadcast: last_broadcast.and_then(|t| t.format(&Rfc3339).ok()),
        }
    }
}

impl Dispatcher {
    pub fn spawn(self, snapshot: SnapshotFn, stop: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(snapshot, stop))
    }

    async fn run(mut self, snapshot: SnapshotFn, mut stop: watch::Receiver<bool>) {
        let period = self.settings.ping_interval;
        let mut sweep = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("[hub] dispatcher started");
        loop {
            tokio::select! {
                biased;
                _ = stop.changed() => break,
                Some(control) = self.control.recv() => self.handle_control(control, &snapshot),
                Some(frame) = self.broadcast.recv() => self.deliver(frame),
                _ = sweep.tick() => self.sweep(),
                else => break,
            }
        }
        self.close_all();
    }

    fn handle_control(&self, control: Control, snapshot: &SnapshotFn) {
        match control {
            Control::Register { id, subscriber, ack } => {
                let remote = subscriber.remote;
                let active = {
                    let mut subs = self.subscribers.write();
                    subs.insert(id, subscriber);
                    subs.len()
                };
                self.counters.joined.fetch_add(1, Ordering::Relaxed);
                let _ = ack.send(());
                info!("[hub] subscriber {} joined from {:?} ({} active)", id, remote, active);

                // Snapshot hors du dispatcher ; livré sous le verrou de lecture, donc
                // jamais à un abonné retiré entre-temps
                let snapshot = snapshot.clone();
                let subscribers = self.subscribers.clone();
                let counters = self.counters.clone();
                tokio::spawn(async move {
                    let Some(frame) = snapshot() else { return };
                    let subs = subscribers.read();
                    let Some(sub) = subs.get(&id) else {
                        debug!("[hub] subscriber {} left before its snapshot", id);
                        return;
                    };
                    if sub.mailbox.try_send(frame).is_ok() {
                        counters.snapshots.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
            Control::Unregister { id, ack } => {
                if self.subscribers.write().remove(&id).is_some() {
                    self.counters.left.fetch_add(1, Ordering::Relaxed);
                    info!("[hub] subscriber {} left", id);
                }
                let _ = ack.send(());
            }
        }
    }

    fn deliver(&self, frame: Frame) {
        let mut evicted = Vec::new();
        let mut gone = Vec::new();
        let mut delivered = 0u64;
        {
            let subs = self.subscribers.read();
            for (id, sub) in subs.iter() {
                match sub.mailbox.try_send(frame.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => evicted.push(*id),
                    Err(TrySendError::Closed(_)) => gone.push(*id),
                }
            }
        }

        self.counters.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.counters.deliveries.fetch_add(delivered, Ordering::Relaxed);
        *self.counters.last_broadcast.lock() = Some(OffsetDateTime::now_utc());

        for id in evicted {
            self.evict(id, EvictReason::Backpressure);
        }
        if !gone.is_empty() {
            let mut subs = self.subscribers.write();
            for id in gone {
                if subs.remove(&id).is_some() {
                    self.counters.left.fetch_add(1, Ordering::Relaxed);
                    debug!("[hub] subscriber {} mailbox already closed", id);
                }
            }
        }
    }

    fn sweep(&self) {
        let timeout = self.settings.liveness_timeout;
        let stale: Vec<Uuid> = self
            .subscribers
            .read()
            .iter()
            .filter(|(_, sub)| sub.liveness.idle_for() > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            self.evict(id, EvictReason::Timeout);
        }
    }

    fn evict(&self, id: Uuid, reason: EvictReason) {
        let Some(sub) = self.subscribers.write().remove(&id) else {
            return;
        };
        let counter = match reason {
            EvictReason::Backpressure => &self.counters.evicted_backpressure,
            EvictReason::Timeout => &self.counters.evicted_timeout,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        warn!("[hub] evicted subscriber {} ({:?}): {:?}", id, sub.remote, reason);
    }

    fn close_all(&self) {
        let closed = {
            let mut subs = self.subscribers.write();
            let n = subs.len();
            subs.clear();
            n
        };
        info!("[hub] dispatcher stopped, closed {} subscriber mailboxes", closed);
    }
}
