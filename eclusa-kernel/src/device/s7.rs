//! Client S7comm minimal sur ISO-on-TCP (RFC 1006)
//!
//! Trois échanges seulement : connexion COTP, "setup communication" (négociation
//! de la taille de PDU) puis "read var" sur la zone DB, découpé selon le PDU.

use super::{Connector, DeviceTransport, LinkError};
use crate::catalog::PlcTarget;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const TPKT_VERSION: u8 = 0x03;
const COTP_CONNECT_CONFIRM: u8 = 0xD0;
const S7_PROTOCOL_ID: u8 = 0x32;
const ROSCTR_ACK_DATA: u8 = 0x03;
const FUNC_SETUP_COMMUNICATION: u8 = 0xF0;
const FUNC_READ_VAR: u8 = 0x04;
const AREA_DB: u8 = 0x84;
const RETURN_SUCCESS: u8 = 0xFF;

const REQUESTED_PDU: u16 = 480;
const MAX_RACK: u16 = 7;
const MAX_SLOT: u16 = 31;
// En-têtes d'une réponse "read var" (ack header + params + en-tête d'item)
const READ_OVERHEAD: u16 = 18;

pub struct S7Connector {
    port: u16,
}

impl S7Connector {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

#[async_trait]
impl Connector for S7Connector {
    async fn connect(&self, target: &PlcTarget) -> Result<Box<dyn DeviceTransport>, LinkError> {
        let tsap = remote_tsap(target.rack, target.slot)?;
        let stream = TcpStream::connect((target.ip.as_str(), self.port)).await?;
        stream.set_nodelay(true)?;
        let session = S7Session::handshake(stream, tsap).await?;
        Ok(Box::new(session))
    }
}

pub struct S7Session {
    stream: TcpStream,
    pdu_size: u16,
    sequence: u16,
}

impl S7Session {
    async fn handshake(stream: TcpStream, remote_tsap: u8) -> Result<Self, LinkError> {
        let mut session = Self { stream, pdu_size: 0, sequence: 0 };

        let connection_request = [
            TPKT_VERSION, 0x00, 0x00, 0x16,
            0x11, 0xE0, 0x00, 0x00, 0x00, 0x01, 0x00,
            0xC0, 0x01, 0x0A,
            0xC1, 0x02, 0x01, 0x00,
            0xC2, 0x02, 0x01, remote_tsap,
        ];
        session.stream.write_all(&connection_request).await?;
        let reply = session.read_frame().await?;
        if reply.get(1) != Some(&COTP_CONNECT_CONFIRM) {
            return Err(LinkError::Protocol("COTP connection not confirmed".into()));
        }

        let seq = session.next_sequence().to_be_bytes();
        let pdu = REQUESTED_PDU.to_be_bytes();
        let setup = [
            TPKT_VERSION, 0x00, 0x00, 0x19,
            0x02, 0xF0, 0x80,
            S7_PROTOCOL_ID, 0x01, 0x00, 0x00, seq[0], seq[1], 0x00, 0x08, 0x00, 0x00,
            FUNC_SETUP_COMMUNICATION, 0x00, 0x00, 0x01, 0x00, 0x01, pdu[0], pdu[1],
        ];
        session.stream.write_all(&setup).await?;
        let reply = session.read_frame().await?;
        check_ack(&reply, seq)?;
        if reply.get(15) != Some(&FUNC_SETUP_COMMUNICATION) || reply.len() < 23 {
            return Err(LinkError::Protocol("malformed setup communication reply".into()));
        }
        let negotiated = u16::from_be_bytes([reply[21], reply[22]]);
        if negotiated <= READ_OVERHEAD {
            return Err(LinkError::Protocol(format!("negotiated PDU too small: {negotiated}")));
        }
        session.pdu_size = negotiated;
        debug!("[s7] session ready, PDU {} bytes", negotiated);
        Ok(session)
    }

    fn next_sequence(&mut self) -> u16 {
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }

    /// Lit une trame TPKT et renvoie son contenu sans l'en-tête
    async fn read_frame(&mut self) -> Result<Vec<u8>, LinkError> {
        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header).await?;
        if header[0] != TPKT_VERSION {
            return Err(LinkError::Protocol(format!("bad TPKT version {:#04x}", header[0])));
        }
        let total = u16::from_be_bytes([header[2], header[3]]) as usize;
        if total < 7 {
            return Err(LinkError::Protocol(format!("TPKT frame too short ({total} bytes)")));
        }
        let mut payload = vec![0u8; total - 4];
        self.stream.read_exact(&mut payload).await?;
        Ok(payload)
    }

    async fn read_chunk(&mut self, db: u16, start: u32, out: &mut [u8]) -> Result<(), LinkError> {
        let seq = self.next_sequence().to_be_bytes();
        let len = (out.len() as u16).to_be_bytes();
        let db_bytes = db.to_be_bytes();
        let address = (start * 8).to_be_bytes();
        let request = [
            TPKT_VERSION, 0x00, 0x00, 0x1F,
            0x02, 0xF0, 0x80,
            S7_PROTOCOL_ID, 0x01, 0x00, 0x00, seq[0], seq[1], 0x00, 0x0E, 0x00, 0x00,
            FUNC_READ_VAR, 0x01,
            0x12, 0x0A, 0x10, 0x02, len[0], len[1], db_bytes[0], db_bytes[1], AREA_DB,
            address[1], address[2], address[3],
        ];
        self.stream.write_all(&request).await?;

        let reply = self.read_frame().await?;
        check_ack(&reply, seq)?;
        if reply.len() < 21 || reply[15] != FUNC_READ_VAR {
            return Err(LinkError::Protocol("malformed read var reply".into()));
        }
        if reply[17] != RETURN_SUCCESS {
            return Err(LinkError::Rejected(reply[17] as u16));
        }
        let data = &reply[21..];
        if data.len() < out.len() {
            return Err(LinkError::Protocol(format!(
                "short read: expected {} bytes, got {}",
                out.len(),
                data.len()
            )));
        }
        out.copy_from_slice(&data[..out.len()]);
        Ok(())
    }
}

#[async_trait]
impl DeviceTransport for S7Session {
    async fn read_db(&mut self, db: u16, start: u32, buf: &mut [u8]) -> Result<(), LinkError> {
        let max_chunk = (self.pdu_size - READ_OVERHEAD) as usize;
        let mut offset = 0;
        while offset < buf.len() {
            let end = (offset + max_chunk).min(buf.len());
            self.read_chunk(db, start + offset as u32, &mut buf[offset..end]).await?;
            offset = end;
        }
        Ok(())
    }
}

/// TSAP distant : rack sur 3 bits, slot sur 5 bits
fn remote_tsap(rack: u16, slot: u16) -> Result<u8, LinkError> {
    if rack > MAX_RACK || slot > MAX_SLOT {
        return Err(LinkError::Protocol(format!(
            "invalid rack/slot {rack}/{slot} (rack 0-{MAX_RACK}, slot 0-{MAX_SLOT})"
        )));
    }
    Ok((rack * 0x20 + slot) as u8)
}

// Vérifie l'en-tête "ack data" d'une réponse (après DT COTP)
fn check_ack(reply: &[u8], sequence: [u8; 2]) -> Result<(), LinkError> {
    if reply.len() < 15 || reply[3] != S7_PROTOCOL_ID || reply[4] != ROSCTR_ACK_DATA {
        return Err(LinkError::Protocol("expected S7 ack data".into()));
    }
    if reply[13] != 0 || reply[14] != 0 {
        return Err(LinkError::Rejected(u16::from_be_bytes([reply[13], reply[14]])));
    }
    if reply[7..9] != sequence {
        return Err(LinkError::Protocol("sequence mismatch".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use eclusa_devkit::{DataBlock, FakePlc};

    fn target(db_number: u16) -> PlcTarget {
        PlcTarget { ip: "127.0.0.1".into(), rack: 0, slot: 1, db_number }
    }

    #[tokio::test]
    async fn test_handshake_and_typed_block() {
        let mut block = DataBlock::new(32);
        block.set_real(0, 50.0).set_int(4, -2).set_bit(6, 3, true);
        let plc = FakePlc::start(19, block).await.unwrap();

        let mut session = S7Connector::new(plc.port()).connect(&target(19)).await.unwrap();
        let mut buf = [0u8; 8];
        session.read_db(19, 0, &mut buf).await.unwrap();
        assert_eq!(&buf[..4], &[0x42, 0x48, 0x00, 0x00]);
        assert_eq!(&buf[4..6], &[0xFF, 0xFE]);
        assert_eq!(buf[6], 0b0000_1000);
        assert_eq!(plc.connections(), 1);
    }

    #[tokio::test]
    async fn test_read_split_by_pdu() {
        let bytes: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8).collect();
        let plc = FakePlc::start(19, DataBlock::from_bytes(bytes.clone())).await.unwrap();

        let mut session = S7Connector::new(plc.port()).connect(&target(19)).await.unwrap();
        let mut buf = vec![0u8; 300];
        session.read_db(19, 0, &mut buf).await.unwrap();
        assert_eq!(buf, bytes);
        // PDU 240 -> 222 octets par requête
        assert_eq!(plc.reads(), 2);
    }

    #[tokio::test]
    async fn test_small_negotiated_pdu() {
        let bytes: Vec<u8> = (0..100u8).collect();
        let plc = FakePlc::start_with_pdu(7, DataBlock::from_bytes(bytes.clone()), 64).await.unwrap();

        let stream = TcpStream::connect(plc.addr()).await.unwrap();
        let mut session = S7Session::handshake(stream, 1).await.unwrap();
        assert_eq!(session.pdu_size, 64);

        let mut buf = vec![0u8; 90];
        session.read_db(7, 10, &mut buf).await.unwrap();
        assert_eq!(buf, &bytes[10..]);
        assert_eq!(plc.reads(), 2);
    }

    #[tokio::test]
    async fn test_rejected_reads() {
        let plc = FakePlc::start(19, DataBlock::new(16)).await.unwrap();
        let mut session = S7Connector::new(plc.port()).connect(&target(19)).await.unwrap();

        let mut buf = [0u8; 4];
        assert!(matches!(session.read_db(20, 0, &mut buf).await, Err(LinkError::Rejected(0x0A))));
        assert!(matches!(session.read_db(19, 14, &mut buf).await, Err(LinkError::Rejected(0x05))));
    }

    #[test]
    fn test_remote_tsap_bounds() {
        assert_eq!(remote_tsap(0, 1).unwrap(), 0x01);
        assert_eq!(remote_tsap(1, 3).unwrap(), 0x23);
        assert_eq!(remote_tsap(7, 31).unwrap(), 0xFF);
        assert!(matches!(remote_tsap(8, 0), Err(LinkError::Protocol(_))));
        assert!(matches!(remote_tsap(0, 32), Err(LinkError::Protocol(_))));
        assert!(matches!(remote_tsap(u16::MAX, u16::MAX), Err(LinkError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_invalid_rack_rejected_before_connecting() {
        let plc = FakePlc::start(19, DataBlock::new(16)).await.unwrap();
        let target = PlcTarget { ip: "127.0.0.1".into(), rack: 2048, slot: 1, db_number: 19 };
        let result = S7Connector::new(plc.port()).connect(&target).await;
        assert!(matches!(result, Err(LinkError::Protocol(_))));
        assert_eq!(plc.connections(), 0);
    }

    #[tokio::test]
    async fn test_offline_plc_drops_session() {
        let plc = FakePlc::start(19, DataBlock::new(16)).await.unwrap();
        let mut session = S7Connector::new(plc.port()).connect(&target(19)).await.unwrap();
        plc.set_online(false);

        let mut buf = [0u8; 4];
        assert!(session.read_db(19, 0, &mut buf).await.is_err());
        assert!(S7Connector::new(plc.port()).connect(&target(19)).await.is_err());
    }
}
