use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;

use super::transport::Transport;
use crate::sync::lock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub to: SocketAddr,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct MemoryTransport {
    outbox: Mutex<VecDeque<Datagram>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_sent(&self) -> Vec<Datagram> {
        lock(&self.outbox).drain(..).collect()
    }

    pub fn sent_len(&self) -> usize {
        lock(&self.outbox).len()
    }
}

impl Transport for MemoryTransport {
    fn send_to(&self, bytes: &[u8], addr: SocketAddr) -> io::Result<usize> {
        lock(&self.outbox).push_back(Datagram {
            to: addr,
            bytes: bytes.to_vec(),
        });
        Ok(bytes.len())
    }
}
