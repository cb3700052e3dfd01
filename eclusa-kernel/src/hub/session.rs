//! Session WebSocket d'un abonné : une tâche d'écriture, une tâche de lecture

use super::{Frame, HubHandle, Liveness};
use axum::body::Bytes;
use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Sert un client jusqu'à sa déconnexion ou son éviction
pub async fn serve_socket(socket: WebSocket, hub: HubHandle, remote: SocketAddr) {
    let registration = match hub.register(Some(remote)).await {
        Ok(registration) => registration,
        Err(e) => {
            warn!("[ws] cannot register {}: {}", remote, e);
            return;
        }
    };
    let id = registration.id;
    let settings = hub.settings().clone();
    let (sink, stream) = socket.split();

    let mut writer = tokio::spawn(write_loop(
        sink,
        registration.mailbox,
        settings.ping_interval,
        settings.write_timeout,
    ));
    let mut reader = tokio::spawn(read_loop(stream, registration.liveness));

    let writer_done = tokio::select! {
        _ = &mut writer => true,
        _ = &mut reader => false,
    };
    if writer_done {
        reader.abort();
    }

    // Retrait = fermeture de la boîte : l'écrivain envoie Close puis sort
    hub.unregister(id).await;
    if !writer_done && timeout(settings.write_timeout, &mut writer).await.is_err() {
        writer.abort();
    }
    debug!("[ws] session {} ({}) finished", id, remote);
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut mailbox: mpsc::Receiver<Frame>,
    ping_every: Duration,
    write_timeout: Duration,
) {
    let mut ping = interval_at(Instant::now() + ping_every, ping_every);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let message = tokio::select! {
            frame = mailbox.recv() => match frame {
                Some(frame) => Message::Text(frame),
                None => {
                    let close = Message::Close(Some(CloseFrame {
                        code: close_code::NORMAL,
                        reason: Utf8Bytes::from_static("closing"),
                    }));
                    let _ = timeout(write_timeout, sink.send(close)).await;
                    return;
                }
            },
            _ = ping.tick() => Message::Ping(Bytes::new()),
        };

        match timeout(write_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("[ws] write failed: {}", e);
                return;
            }
            Err(_) => {
                warn!("[ws] write timed out after {:?}", write_timeout);
                return;
            }
        }
    }
}

// Tout message entrant compte comme signe de vie ; le contenu est ignoré
async fn read_loop(mut stream: SplitStream<WebSocket>, liveness: Liveness) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Close(_)) => return,
            Ok(_) => liveness.touch(),
            Err(e) => {
                debug!("[ws] read failed: {}", e);
                return;
            }
        }
    }
}
