/**
 * DEVICE LINK - Session unique vers l'automate
 *
 * RÔLE : Possède le transport vers l'automate (S7 en production, mémoire en test),
 * le drapeau de connectivité et les lectures typées dans le data block.
 *
 * FONCTIONNEMENT :
 * - connect() idempotent : no-op si déjà connecté, sinon handshake borné par timeout
 * - read_block() échoue tout de suite en NotConnected si le drapeau est faux
 * - Toute erreur de lecture ferme la session et baisse le drapeau : le superviseur
 *   de reconnexion reprend la main au tick suivant, on ne réessaie jamais un handle cassé
 */

pub mod s7;

#[cfg(test)]
pub mod memory;

use crate::catalog::{PlcTarget, TagAddress};
use crate::models::{decode_bit, decode_int, decode_real, TagValue};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("device not connected")]
    NotConnected,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("device rejected request (code {0:#06x})")]
    Rejected(u16),
}

/// Ouvre une session vers l'automate ciblé
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &PlcTarget) -> Result<Box<dyn DeviceTransport>, LinkError>;
}

/// Session ouverte : lecture d'octets bruts dans un data block
#[async_trait]
pub trait DeviceTransport: Send {
    async fn read_db(&mut self, db: u16, start: u32, buf: &mut [u8]) -> Result<(), LinkError>;
}

#[derive(Debug, Clone, Copy)]
pub struct LinkSettings {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkStatus {
    pub ip: String,
    pub rack: u16,
    pub slot: u16,
    pub db_number: u16,
    pub connected: bool,
    pub connects: u64,
    pub disconnects: u64,
    pub last_error: Option<String>,
}

pub struct DeviceLink {
    target: PlcTarget,
    connector: Arc<dyn Connector>,
    settings: LinkSettings,
    session: Mutex<Option<Box<dyn DeviceTransport>>>,
    connected: AtomicBool,
    connects: AtomicU64,
    disconnects: AtomicU64,
    last_error: parking_lot::Mutex<Option<String>>,
}

impl DeviceLink {
    pub fn new(target: PlcTarget, connector: Arc<dyn Connector>, settings: LinkSettings) -> Self {
        Self {
            target,
            connector,
            settings,
            session: Mutex::new(None),
            connected: AtomicBool::new(false),
            connects: AtomicU64::new(0),
            disconnects: AtomicU64::new(0),
            last_error: parking_lot::Mutex::new(None),
        }
    }

    pub fn target(&self) -> &PlcTarget {
        &self.target
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn connect(&self) -> Result<(), LinkError> {
        let mut session = self.session.lock().await;
        if session.is_some() && self.is_connected() {
            return Ok(());
        }

        let attempt = tokio::time::timeout(
            self.settings.connect_timeout,
            self.connector.connect(&self.target),
        )
        .await
        .unwrap_or(Err(LinkError::Timeout(self.settings.connect_timeout)));

        match attempt {
            Ok(transport) => {
                *session = Some(transport);
                self.connected.store(true, Ordering::SeqCst);
                self.connects.fetch_add(1, Ordering::Relaxed);
                *self.last_error.lock() = None;
                info!(
                    "[device] connected to {} (rack {}, slot {}, DB{})",
                    self.target.ip, self.target.rack, self.target.slot, self.target.db_number
                );
                Ok(())
            }
            Err(e) => {
                *self.last_error.lock() = Some(e.to_string());
                Err(e)
            }
        }
    }

    pub async fn disconnect(&self) {
        let mut session = self.session.lock().await;
        self.teardown(&mut session, None);
    }

    // Appelé avec le verrou de session tenu
    fn teardown(&self, session: &mut Option<Box<dyn DeviceTransport>>, cause: Option<&LinkError>) {
        let had_session = session.take().is_some();
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        if !(had_session || was_connected) {
            return;
        }
        self.disconnects.fetch_add(1, Ordering::Relaxed);
        match cause {
            Some(e) => {
                *self.last_error.lock() = Some(e.to_string());
                warn!("[device] read failed, dropping session: {}", e);
            }
            None => info!("[device] disconnected from {}", self.target.ip),
        }
    }

    /// Lit `len` octets à partir de `start` dans le data block configuré
    pub async fn read_block(&self, start: u32, len: usize) -> Result<Vec<u8>, LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        let mut session = self.session.lock().await;
        let Some(transport) = session.as_mut() else {
            return Err(LinkError::NotConnected);
        };

        let mut buf = vec![0u8; len];
        let timeout = self.settings.read_timeout;
        let result = tokio::time::timeout(
            timeout,
            transport.read_db(self.target.db_number, start, &mut buf),
        )
        .await
        .unwrap_or(Err(LinkError::Timeout(timeout)));

        match result {
            Ok(()) => Ok(buf),
            Err(e) => {
                self.teardown(&mut session, Some(&e));
                Err(e)
            }
        }
    }

    pub async fn read_real(&self, byte: u32) -> Result<f32, LinkError> {
        let raw = self.read_block(byte, 4).await?;
        Ok(decode_real([raw[0], raw[1], raw[2], raw[3]]))
    }

    pub async fn read_int(&self, byte: u32) -> Result<i16, LinkError> {
        let raw = self.read_block(byte, 2).await?;
        Ok(decode_int([raw[0], raw[1]]))
    }

    pub async fn read_bool(&self, byte: u32, bit: u8) -> Result<bool, LinkError> {
        let raw = self.read_block(byte, 1).await?;
        Ok(decode_bit(raw[0], bit))
    }

    pub async fn read_tag(&self, address: TagAddress) -> Result<TagValue, LinkError> {
        match address {
            TagAddress::Real { byte } => self.read_real(byte).await.map(TagValue::Real),
            TagAddress::Int { byte } => self.read_int(byte).await.map(TagValue::Int),
            TagAddress::Bit { byte, bit } => self.read_bool(byte, bit).await.map(TagValue::Bool),
        }
    }

    pub fn status(&self) -> LinkStatus {
        LinkStatus {
            ip: self.target.ip.clone(),
            rack: self.target.rack,
            slot: self.target.slot,
            db_number: self.target.db_number,
            connected: self.is_connected(),
            connects: self.connects.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            last_error: self.last_error.lock().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryPlc;
    use super::*;
    use crate::catalog::Catalog;
    use eclusa_devkit::DataBlock;

    fn link_for(plc: &MemoryPlc) -> DeviceLink {
        DeviceLink::new(Catalog::builtin().target().clone(), plc.connector(), LinkSettings::default())
    }

    #[tokio::test]
    async fn test_read_requires_connection() {
        let plc = MemoryPlc::new(DataBlock::new(16));
        let link = link_for(&plc);
        assert!(matches!(link.read_block(0, 4).await, Err(LinkError::NotConnected)));
        assert_eq!(plc.reads(), 0);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let plc = MemoryPlc::new(DataBlock::new(16));
        let link = link_for(&plc);
        link.connect().await.unwrap();
        link.connect().await.unwrap();
        assert!(link.is_connected());
        assert_eq!(plc.connects(), 1);
        assert_eq!(link.status().connects, 1);
    }

    #[tokio::test]
    async fn test_typed_reads() {
        let mut block = DataBlock::new(16);
        block.set_real(0, 50.0).set_int(4, -300).set_bit(6, 3, true);
        let plc = MemoryPlc::new(block);
        let link = link_for(&plc);
        link.connect().await.unwrap();

        assert_eq!(link.read_real(0).await.unwrap(), 50.0);
        assert_eq!(link.read_int(4).await.unwrap(), -300);
        assert!(link.read_bool(6, 3).await.unwrap());
        assert!(!link.read_bool(6, 2).await.unwrap());
        assert_eq!(
            link.read_tag(TagAddress::Bit { byte: 6, bit: 3 }).await.unwrap(),
            TagValue::Bool(true)
        );
    }

    #[tokio::test]
    async fn test_read_failure_tears_down_session() {
        let plc = MemoryPlc::new(DataBlock::new(16));
        let link = link_for(&plc);
        link.connect().await.unwrap();

        plc.fail_reads(true);
        assert!(matches!(link.read_real(0).await, Err(LinkError::Io(_))));
        assert!(!link.is_connected());
        let status = link.status();
        assert_eq!(status.disconnects, 1);
        assert!(status.last_error.is_some());

        // pas de nouvel essai sur le handle cassé
        let reads = plc.reads();
        assert!(matches!(link.read_real(0).await, Err(LinkError::NotConnected)));
        assert_eq!(plc.reads(), reads);

        plc.fail_reads(false);
        link.connect().await.unwrap();
        assert_eq!(link.read_real(0).await.unwrap(), 0.0);
        assert_eq!(plc.connects(), 2);
    }

    #[tokio::test]
    async fn test_refused_connect_is_not_fatal() {
        let plc = MemoryPlc::new(DataBlock::new(4));
        plc.refuse_connect(true);
        let link = link_for(&plc);
        assert!(link.connect().await.is_err());
        assert!(!link.is_connected());
        assert_eq!(link.status().connects, 0);

        plc.refuse_connect(false);
        assert!(link.connect().await.is_ok());
    }

    struct StalledConnector;

    #[async_trait]
    impl Connector for StalledConnector {
        async fn connect(&self, _target: &PlcTarget) -> Result<Box<dyn DeviceTransport>, LinkError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let settings = LinkSettings {
            connect_timeout: Duration::from_millis(20),
            read_timeout: Duration::from_millis(20),
        };
        let link = DeviceLink::new(Catalog::builtin().target().clone(), Arc::new(StalledConnector), settings);
        assert!(matches!(link.connect().await, Err(LinkError::Timeout(_))));
        assert!(!link.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_counts_once() {
        let plc = MemoryPlc::new(DataBlock::new(4));
        let link = link_for(&plc);
        link.connect().await.unwrap();
        link.disconnect().await;
        link.disconnect().await;
        assert!(!link.is_connected());
        assert_eq!(link.status().disconnects, 1);
    }
}
