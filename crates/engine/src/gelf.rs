// SPDX-License-Identifier: MIT

//! The Remote Log Sink: a GELF-shaped UDP datagram per log
//! line, compressed and chunked exactly the way the wire contract
//! spells out.
//!
//! Framing: messages over 1400 bytes are zstd-compressed; if still over
//! 1400 bytes after compression, the payload is split into chunks of at
//! most 1300 bytes, each prefixed with a 12-byte header (2 magic bytes
//! `1e 0f`, an 8-byte big-endian message id, a 1-byte chunk sequence
//! number, a 1-byte total chunk count). Anything over 65000 bytes
//! before compression is dropped rather than sent.

use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Map, Value};
use tokio::net::UdpSocket;

use crate::error::GelfError;

const GELF_MAGIC: [u8; 2] = [0x1e, 0x0f];
const COMPRESS_THRESHOLD: usize = 1400;
const CHUNK_SIZE: usize = 1300;
const HARD_LIMIT: usize = 65000;
const CHUNK_HEADER_LEN: usize = 12;

/// A single log line rendered onto the wire, shared read-only across
/// every `LogPipeline` in the process.
pub struct RemoteLogSink {
    socket: UdpSocket,
    level: i32,
    extra_fields: HashMap<String, Value>,
    next_msg_id: AtomicU64,
}

impl RemoteLogSink {
    /// Bind an ephemeral local UDP socket and connect it to `remote`
    /// (`host:port`), so later `send` calls are plain unconnected
    /// writes from the kernel's point of view.
    pub async fn connect(
        remote: &str,
        level: i32,
        extra_fields: HashMap<String, Value>,
    ) -> std::io::Result<Self> {
        let addr = remote
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no address"))?;
        let bind_addr = if addr.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(addr).await?;
        Ok(Self {
            socket,
            level,
            extra_fields,
            next_msg_id: AtomicU64::new(0),
        })
    }

    /// Encode and send one log line as a GELF-shaped message.
    pub async fn send(
        &self,
        host: &str,
        task: &str,
        short_message: &str,
        timestamp: f64,
    ) -> Result<(), GelfError> {
        let payload = self.encode(host, task, short_message, timestamp)?;
        if payload.len() > HARD_LIMIT {
            return Err(GelfError::TooLarge(payload.len()));
        }
        let wire = if payload.len() > COMPRESS_THRESHOLD {
            zstd::stream::encode_all(&payload[..], 0).map_err(GelfError::Compress)?
        } else {
            payload
        };
        if wire.len() > HARD_LIMIT {
            return Err(GelfError::TooLarge(wire.len()));
        }
        if wire.len() <= COMPRESS_THRESHOLD {
            self.socket.send(&wire).await?;
        } else {
            let id = self.next_msg_id.fetch_add(1, Ordering::Relaxed);
            for chunk in chunk_payload(&wire, id) {
                self.socket.send(&chunk).await?;
            }
        }
        Ok(())
    }

    fn encode(
        &self,
        host: &str,
        task: &str,
        short_message: &str,
        timestamp: f64,
    ) -> Result<Vec<u8>, GelfError> {
        let mut obj = Map::new();
        obj.insert("version".into(), Value::from("1.1"));
        obj.insert("host".into(), Value::from(host));
        obj.insert("short_message".into(), Value::from(short_message));
        obj.insert("timestamp".into(), Value::from(timestamp));
        obj.insert("level".into(), Value::from(self.level));
        obj.insert("_service".into(), Value::from(task));
        for (k, v) in &self.extra_fields {
            obj.entry(k.clone()).or_insert_with(|| v.clone());
        }
        Ok(serde_json::to_vec(&Value::Object(obj))?)
    }
}

fn chunk_payload(payload: &[u8], msg_id: u64) -> Vec<Vec<u8>> {
    let total = payload.chunks(CHUNK_SIZE).count().max(1);
    payload
        .chunks(CHUNK_SIZE)
        .enumerate()
        .map(|(seq, body)| {
            let mut buf = Vec::with_capacity(CHUNK_HEADER_LEN + body.len());
            buf.extend_from_slice(&GELF_MAGIC);
            buf.extend_from_slice(&msg_id.to_be_bytes());
            buf.push(seq as u8);
            buf.push(total as u8);
            buf.extend_from_slice(body);
            buf
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassemble(chunks: &[Vec<u8>]) -> Option<Vec<u8>> {
        if chunks.is_empty() {
            return None;
        }
        let total = chunks[0][11];
        if chunks.len() != total as usize {
            return None;
        }
        let mut ordered = chunks.to_vec();
        ordered.sort_by_key(|c| c[10]);
        let mut out = Vec::new();
        for (i, c) in ordered.iter().enumerate() {
            if c[0..2] != GELF_MAGIC || c[10] != i as u8 {
                return None;
            }
            out.extend_from_slice(&c[CHUNK_HEADER_LEN..]);
        }
        Some(out)
    }

    #[test]
    fn small_payload_is_not_chunked() {
        let payload = vec![b'x'; 100];
        assert_eq!(payload.chunks(CHUNK_SIZE).count(), 1);
    }

    #[test]
    fn chunk_round_trip_reassembles_original_bytes() {
        let payload: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
        let chunks = chunk_payload(&payload, 42);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.len() <= CHUNK_HEADER_LEN + CHUNK_SIZE));
        let rebuilt = reassemble(&chunks).unwrap();
        assert_eq!(rebuilt, payload);
    }

    #[test]
    fn chunk_header_carries_message_id_and_counts() {
        let payload = vec![7u8; 3000];
        let chunks = chunk_payload(&payload, 0xAABBCCDD);
        assert_eq!(chunks[0][2..10], 0xAABBCCDDu64.to_be_bytes());
        assert_eq!(chunks.last().unwrap()[10] as usize, chunks.len() - 1);
        for c in &chunks {
            assert_eq!(c[11] as usize, chunks.len());
        }
    }
}
