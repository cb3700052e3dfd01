/**
 * BROADCAST PUBLISHER - Entrée non bloquante vers la boîte de broadcast du hub
 *
 * RÔLE : Le tick de polling (et le push admin) publient ici sans jamais attendre.
 * - Boîte du hub avec de la place -> envoi direct (try_send)
 * - Boîte pleine -> payload garé dans un emplacement unique ; une seule tâche de
 *   relance attend de la place et le transmet
 * - Relance en attente ou en cours -> le nouveau payload remplace celui garé au lieu
 *   de le doubler : l'ordre de broadcast est conservé, et rien n'est perdu puisque
 *   chaque payload porte l'état complet
 */

use crate::hub::Frame;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Sent,
    Parked,
    Closed,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublisherStats {
    pub published: u64,
    pub retried: u64,
    pub superseded: u64,
    pub retry_pending: bool,
}

#[derive(Default)]
struct RetrySlot {
    pending: Option<Frame>,
    in_flight: bool,
}

pub struct BroadcastPublisher {
    tx: mpsc::Sender<Frame>,
    slot: Mutex<RetrySlot>,
    wake: Notify,
    published: AtomicU64,
    retried: AtomicU64,
    superseded: AtomicU64,
}

impl BroadcastPublisher {
    pub fn new(tx: mpsc::Sender<Frame>) -> Arc<Self> {
        Arc::new(Self {
            tx,
            slot: Mutex::new(RetrySlot::default()),
            wake: Notify::new(),
            published: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            superseded: AtomicU64::new(0),
        })
    }

    pub fn publish(&self, frame: Frame) -> PublishOutcome {
        self.publish_with(|| Some(frame))
    }

    /// Construit le payload sous le verrou de l'emplacement : deux écrivains
    /// (polling, push admin) publient dans l'ordre où ils ont lu le cache
    pub fn publish_with<F>(&self, build: F) -> PublishOutcome
    where
        F: FnOnce() -> Option<Frame>,
    {
        let mut slot = self.slot.lock();
        let Some(frame) = build() else {
            return PublishOutcome::Closed;
        };

        if slot.pending.is_some() || slot.in_flight {
            if slot.pending.replace(frame).is_some() {
                self.superseded.fetch_add(1, Ordering::Relaxed);
            }
            self.wake.notify_one();
            return PublishOutcome::Parked;
        }

        match self.tx.try_send(frame) {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                PublishOutcome::Sent
            }
            Err(mpsc::error::TrySendError::Full(frame)) => {
                debug!("[publisher] broadcast mailbox full, parking payload");
                slot.pending = Some(frame);
                self.wake.notify_one();
                PublishOutcome::Parked
            }
            Err(mpsc::error::TrySendError::Closed(_)) => PublishOutcome::Closed,
        }
    }

    /// Démarre l'unique tâche de relance
    pub fn spawn_retry(self: &Arc<Self>, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let next = {
                    let mut slot = this.slot.lock();
                    let frame = slot.pending.take();
                    slot.in_flight = frame.is_some();
                    frame
                };

                let Some(frame) = next else {
                    tokio::select! {
                        _ = this.wake.notified() => continue,
                        _ = stop.changed() => break,
                    }
                };

                tokio::select! {
                    sent = this.tx.send(frame) => {
                        if sent.is_err() {
                            warn!("[publisher] hub mailbox closed, retry task exiting");
                            break;
                        }
                        this.published.fetch_add(1, Ordering::Relaxed);
                        this.retried.fetch_add(1, Ordering::Relaxed);
                    }
                    _ = stop.changed() => break,
                }
            }
            this.slot.lock().in_flight = false;
        })
    }

    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            published: self.published.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            retry_pending: self.slot.lock().pending.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn frame(s: &str) -> Frame {
        Frame::from(s.to_string())
    }

    async fn next(rx: &mut mpsc::Receiver<Frame>) -> String {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
            .as_str()
            .to_string()
    }

    #[tokio::test]
    async fn test_full_mailbox_keeps_latest_in_order() {
        let (tx, mut rx) = mpsc::channel(1);
        let (_stop_tx, stop) = watch::channel(false);
        let publisher = BroadcastPublisher::new(tx);

        assert_eq!(publisher.publish(frame("a")), PublishOutcome::Sent);
        assert_eq!(publisher.publish(frame("b")), PublishOutcome::Parked);

        // de la place se libère, mais "c" ne doit pas doubler le payload garé
        assert_eq!(next(&mut rx).await, "a");
        assert_eq!(publisher.publish(frame("c")), PublishOutcome::Parked);
        assert!(publisher.stats().retry_pending);

        let _retry = publisher.spawn_retry(stop);
        assert_eq!(next(&mut rx).await, "c");

        let stats = publisher.stats();
        assert_eq!(stats.superseded, 1);
        assert_eq!(stats.retried, 1);
        assert_eq!(stats.published, 2);
        assert!(!stats.retry_pending);
    }

    #[tokio::test]
    async fn test_publish_never_blocks() {
        let (tx, mut rx) = mpsc::channel(2);
        let (_stop_tx, stop) = watch::channel(false);
        let publisher = BroadcastPublisher::new(tx);
        let _retry = publisher.spawn_retry(stop);

        for i in 0..100 {
            publisher.publish(frame(&format!("p{i}")));
        }
        let mut received = Vec::new();
        while let Ok(Some(f)) = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
            received.push(f.as_str().to_string());
        }
        assert_eq!(received.first().map(String::as_str), Some("p0"));
        assert_eq!(received.last().map(String::as_str), Some("p99"));
        // ordre conservé malgré les remplacements
        let indices: Vec<u32> = received.iter().map(|s| s[1..].parse().unwrap()).collect();
        assert!(indices.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_concurrent_writers_publish_in_build_order() {
        let (tx, mut rx) = mpsc::channel(1024);
        let publisher = BroadcastPublisher::new(tx);
        let built = Arc::new(AtomicU64::new(0));

        let writers: Vec<_> = (0..4)
            .map(|_| {
                let publisher = publisher.clone();
                let built = built.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        publisher.publish_with(|| {
                            let n = built.fetch_add(1, Ordering::SeqCst);
                            Some(frame(&n.to_string()))
                        });
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }

        let mut received = Vec::new();
        while let Ok(f) = rx.try_recv() {
            received.push(f.as_str().parse::<u64>().unwrap());
        }
        assert_eq!(received, (0..800).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_closed_hub() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let publisher = BroadcastPublisher::new(tx);
        assert_eq!(publisher.publish(frame("x")), PublishOutcome::Closed);
    }
}
