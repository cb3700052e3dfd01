//! Automate en mémoire pour les tests, avec injection de pannes

use super::{Connector, DeviceTransport, LinkError};
use crate::catalog::PlcTarget;
use async_trait::async_trait;
use eclusa_devkit::DataBlock;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

struct Inner {
    block: Mutex<DataBlock>,
    fail_reads: AtomicBool,
    refuse_connect: AtomicBool,
    connects: AtomicUsize,
    reads: AtomicUsize,
}

#[derive(Clone)]
pub struct MemoryPlc {
    inner: Arc<Inner>,
}

impl MemoryPlc {
    pub fn new(block: DataBlock) -> Self {
        Self {
            inner: Arc::new(Inner {
                block: Mutex::new(block),
                fail_reads: AtomicBool::new(false),
                refuse_connect: AtomicBool::new(false),
                connects: AtomicUsize::new(0),
                reads: AtomicUsize::new(0),
            }),
        }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    pub fn update<F: FnOnce(&mut DataBlock)>(&self, f: F) {
        f(&mut self.inner.block.lock());
    }

    pub fn fail_reads(&self, fail: bool) {
        self.inner.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn refuse_connect(&self, refuse: bool) {
        self.inner.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.inner.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryPlc {
    async fn connect(&self, _target: &PlcTarget) -> Result<Box<dyn DeviceTransport>, LinkError> {
        if self.inner.refuse_connect.load(Ordering::SeqCst) {
            return Err(LinkError::Io(std::io::ErrorKind::ConnectionRefused.into()));
        }
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession { inner: self.inner.clone() }))
    }
}

struct MemorySession {
    inner: Arc<Inner>,
}

#[async_trait]
impl DeviceTransport for MemorySession {
    async fn read_db(&mut self, _db: u16, start: u32, buf: &mut [u8]) -> Result<(), LinkError> {
        self.inner.reads.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_reads.load(Ordering::SeqCst) {
            return Err(LinkError::Io(std::io::ErrorKind::ConnectionReset.into()));
        }
        let block = self.inner.block.lock();
        let bytes = block.slice(start as usize, buf.len()).ok_or(LinkError::Rejected(0x05))?;
        buf.copy_from_slice(bytes);
        Ok(())
    }
}
