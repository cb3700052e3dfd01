/*!
Faux automate S7 pour développement sans matériel

Écoute en TCP et répond au strict nécessaire du protocole S7comm sur ISO-on-TCP:
connexion COTP, "setup communication" et "read var" sur un unique data block.
Permet de tester le client S7 du kernel (trames, découpage PDU, erreurs) et de
simuler une coupure réseau (`set_online(false)`).
*/

use crate::block::DataBlock;
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const TPKT_VERSION: u8 = 0x03;
const COTP_CONNECT_REQUEST: u8 = 0xE0;
const S7_PROTOCOL_ID: u8 = 0x32;
const FUNC_SETUP_COMMUNICATION: u8 = 0xF0;
const FUNC_READ_VAR: u8 = 0x04;
const AREA_DB: u8 = 0x84;

const RETURN_SUCCESS: u8 = 0xFF;
const RETURN_OUT_OF_RANGE: u8 = 0x05;
const RETURN_OBJECT_MISSING: u8 = 0x0A;

struct Shared {
    memory: Mutex<DataBlock>,
    db_number: u16,
    pdu_size: u16,
    online: AtomicBool,
    connections: AtomicUsize,
    reads: AtomicUsize,
}

/// Automate simulé servant un data block
pub struct FakePlc {
    addr: SocketAddr,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl FakePlc {
    /// Démarre l'automate sur 127.0.0.1 (port libre choisi par l'OS)
    pub async fn start(db_number: u16, block: DataBlock) -> Result<Self> {
        Self::start_with_pdu(db_number, block, 240).await
    }

    /// Comme `start`, avec une taille de PDU négociée imposée
    pub async fn start_with_pdu(db_number: u16, block: DataBlock, pdu_size: u16) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shared = Arc::new(Shared {
            memory: Mutex::new(block),
            db_number,
            pdu_size,
            online: AtomicBool::new(true),
            connections: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
        });

        let accept_shared = shared.clone();
        let task = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        log::warn!("[fake-plc] accept failed: {}", e);
                        continue;
                    }
                };
                if !accept_shared.online.load(Ordering::SeqCst) {
                    log::info!("[fake-plc] offline, dropping connection from {}", peer);
                    drop(stream);
                    continue;
                }
                accept_shared.connections.fetch_add(1, Ordering::SeqCst);
                let session_shared = accept_shared.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_session(stream, session_shared).await {
                        log::debug!("[fake-plc] session {} ended: {}", peer, e);
                    }
                });
            }
        });

        log::info!("[fake-plc] listening on {} (DB{})", addr, db_number);
        Ok(Self { addr, shared, task })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Modifie le data block servi
    pub fn update<F: FnOnce(&mut DataBlock)>(&self, f: F) {
        let mut memory = self.shared.memory.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut memory);
    }

    /// Hors ligne: les sessions ouvertes sont coupées à la requête suivante
    /// et les nouvelles connexions sont refermées aussitôt
    pub fn set_online(&self, online: bool) {
        self.shared.online.store(online, Ordering::SeqCst);
    }

    /// Nombre de connexions acceptées depuis le démarrage
    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Nombre de requêtes "read var" servies
    pub fn reads(&self) -> usize {
        self.shared.reads.load(Ordering::SeqCst)
    }
}

impl Drop for FakePlc {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_session(mut stream: TcpStream, shared: Arc<Shared>) -> Result<()> {
    loop {
        let payload = read_tpkt(&mut stream).await?;
        if !shared.online.load(Ordering::SeqCst) {
            return Ok(());
        }
        let Some(reply) = respond(&payload, &shared) else {
            anyhow::bail!("unexpected frame of {} bytes", payload.len());
        };
        stream.write_all(&reply).await?;
    }
}

async fn read_tpkt(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != TPKT_VERSION {
        anyhow::bail!("bad TPKT version {:#x}", header[0]);
    }
    let total = u16::from_be_bytes([header[2], header[3]]) as usize;
    if total < 4 {
        anyhow::bail!("bad TPKT length {}", total);
    }
    let mut payload = vec![0u8; total - 4];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

fn tpkt(payload: Vec<u8>) -> Vec<u8> {
    let total = (payload.len() + 4) as u16;
    let mut frame = vec![TPKT_VERSION, 0x00];
    frame.extend_from_slice(&total.to_be_bytes());
    frame.extend(payload);
    frame
}

fn respond(payload: &[u8], shared: &Shared) -> Option<Vec<u8>> {
    if payload.len() >= 2 && payload[1] == COTP_CONNECT_REQUEST {
        // Connection confirm, on renvoie les paramètres TSAP tels quels
        let mut cc = vec![0x11, 0xD0, 0x00, 0x01, 0x00, 0x01, 0x00];
        cc.extend_from_slice(payload.get(7..)?);
        cc[0] = (cc.len() - 1) as u8;
        return Some(tpkt(cc));
    }

    // DT header (3) + job header (10) + code fonction
    if payload.len() < 14 || payload[3] != S7_PROTOCOL_ID {
        return None;
    }
    let sequence = [payload[7], payload[8]];
    match payload[13] {
        FUNC_SETUP_COMMUNICATION => {
            let requested = u16::from_be_bytes([*payload.get(19)?, *payload.get(20)?]);
            let pdu = requested.min(shared.pdu_size).to_be_bytes();
            let params = [FUNC_SETUP_COMMUNICATION, 0x00, 0x00, 0x01, 0x00, 0x01, pdu[0], pdu[1]];
            Some(tpkt(ack_data(sequence, &params, &[])))
        }
        FUNC_READ_VAR => {
            let item = payload.get(13..27)?;
            let length = u16::from_be_bytes([item[6], item[7]]) as usize;
            let db = u16::from_be_bytes([item[8], item[9]]);
            let area = item[10];
            let bit_address = u32::from_be_bytes([0, item[11], item[12], item[13]]);
            let start = (bit_address >> 3) as usize;

            shared.reads.fetch_add(1, Ordering::SeqCst);
            let memory = shared.memory.lock().unwrap_or_else(|e| e.into_inner());
            let data = if area != AREA_DB || db != shared.db_number {
                vec![RETURN_OBJECT_MISSING, 0x00, 0x00, 0x00]
            } else {
                match memory.slice(start, length) {
                    Some(bytes) => {
                        let bits = ((length * 8) as u16).to_be_bytes();
                        let mut data = vec![RETURN_SUCCESS, 0x04, bits[0], bits[1]];
                        data.extend_from_slice(bytes);
                        data
                    }
                    None => vec![RETURN_OUT_OF_RANGE, 0x00, 0x00, 0x00],
                }
            };
            Some(tpkt(ack_data(sequence, &[FUNC_READ_VAR, 0x01], &data)))
        }
        _ => None,
    }
}

fn ack_data(sequence: [u8; 2], params: &[u8], data: &[u8]) -> Vec<u8> {
    let par_len = (params.len() as u16).to_be_bytes();
    let data_len = (data.len() as u16).to_be_bytes();
    let mut out = vec![
        0x02, 0xF0, 0x80,
        S7_PROTOCOL_ID, 0x03, 0x00, 0x00,
        sequence[0], sequence[1],
        par_len[0], par_len[1],
        data_len[0], data_len[1],
        0x00, 0x00,
    ];
    out.extend_from_slice(params);
    out.extend_from_slice(data);
    out
}
