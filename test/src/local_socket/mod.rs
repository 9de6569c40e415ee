//! In-memory datagram link for end to end testing.
//! Routes packets between two endpoints without network I/O, optionally
//! losing, duplicating or swapping them.

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use log::trace;
use skein_shared::{Transport, TransportError, MTU_SIZE_BYTES};

const FAKE_CLIENT_ADDR: &str = "127.0.0.1:12345";
const FAKE_SERVER_ADDR: &str = "127.0.0.1:54321";

/// How one direction of a link mistreats datagrams. Each is a probability
/// between 0 and 1 drawn per datagram.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LinkConditions {
    pub loss: f32,
    pub duplicate: f32,
    /// Holds the datagram back until the next one has been sent
    pub reorder: f32,
}

impl LinkConditions {
    pub fn perfect() -> Self {
        Self::default()
    }

    pub fn lossy(loss: f32) -> Self {
        Self {
            loss,
            ..Default::default()
        }
    }
}

/// What a link did to the datagrams handed to it
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub sent: usize,
    pub lost: usize,
    pub duplicated: usize,
    pub reordered: usize,
}

struct Link {
    queue: VecDeque<Vec<u8>>,
    conditions: LinkConditions,
    rng: fastrand::Rng,
    stats: LinkStats,
    closed: bool,
    held: Option<Vec<u8>>,
    /// Every datagram handed to the link, before any loss
    history: Vec<Vec<u8>>,
}

impl Link {
    fn new(conditions: LinkConditions, seed: u64) -> Self {
        Self {
            queue: VecDeque::new(),
            conditions,
            rng: fastrand::Rng::with_seed(seed),
            stats: LinkStats::default(),
            closed: false,
            held: None,
            history: Vec::new(),
        }
    }

    fn push(&mut self, payload: &[u8]) {
        self.stats.sent += 1;
        self.history.push(payload.to_vec());
        if self.rng.f32() < self.conditions.loss {
            self.stats.lost += 1;
            return;
        }
        if self.held.is_none() && self.rng.f32() < self.conditions.reorder {
            self.stats.reordered += 1;
            self.held = Some(payload.to_vec());
            return;
        }
        self.queue.push_back(payload.to_vec());
        if self.rng.f32() < self.conditions.duplicate {
            self.stats.duplicated += 1;
            self.queue.push_back(payload.to_vec());
        }
        if let Some(held) = self.held.take() {
            self.queue.push_back(held);
        }
    }
}

/// One end of a `LocalSocketPair`
pub struct LocalSocket {
    outbound: Arc<Mutex<Link>>,
    inbound: Arc<Mutex<Link>>,
    peer_addr: SocketAddr,
}

impl LocalSocket {
    /// Datagrams waiting to be received on this end
    pub fn pending(&self) -> usize {
        self.inbound.lock().unwrap().queue.len()
    }

    /// Drops everything this end has not received yet
    pub fn discard_inbound(&mut self) -> usize {
        let mut inbound = self.inbound.lock().unwrap();
        let discarded = inbound.queue.len();
        inbound.queue.clear();
        discarded
    }

    /// Puts a datagram straight into this end's inbound queue
    pub fn inject(&mut self, payload: &[u8]) {
        self.inbound.lock().unwrap().queue.push_back(payload.to_vec());
    }

    pub fn set_outbound_conditions(&mut self, conditions: LinkConditions) {
        self.outbound.lock().unwrap().conditions = conditions;
    }

    /// Further sends from this end fail
    pub fn close(&mut self) {
        self.outbound.lock().unwrap().closed = true;
    }

    pub fn outbound_stats(&self) -> LinkStats {
        self.outbound.lock().unwrap().stats
    }

    /// Copies of every datagram this end has sent
    pub fn sent_history(&self) -> Vec<Vec<u8>> {
        self.outbound.lock().unwrap().history.clone()
    }
}

impl Transport for LocalSocket {
    fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let mut link = self.outbound.lock().unwrap();
        if link.closed {
            return Err(TransportError::Closed);
        }
        if payload.len() > MTU_SIZE_BYTES {
            return Err(TransportError::TooLarge {
                size: payload.len(),
                limit: MTU_SIZE_BYTES,
            });
        }
        trace!("link carries {} bytes", payload.len());
        link.push(payload);
        Ok(())
    }

    fn recv(&mut self) -> Option<(Vec<u8>, SocketAddr)> {
        let packet = self.inbound.lock().unwrap().queue.pop_front()?;
        Some((packet, self.peer_addr))
    }
}

/// Pair of connected client and server sockets for end to end testing
pub struct LocalSocketPair {
    pub client: LocalSocket,
    pub server: LocalSocket,
}

impl LocalSocketPair {
    pub fn new() -> Self {
        Self::with_conditions(LinkConditions::perfect(), 0)
    }

    /// Both directions share `conditions`, each with its own random stream
    pub fn with_conditions(conditions: LinkConditions, seed: u64) -> Self {
        let client_addr: SocketAddr = FAKE_CLIENT_ADDR.parse().unwrap();
        let server_addr: SocketAddr = FAKE_SERVER_ADDR.parse().unwrap();

        let client_to_server = Arc::new(Mutex::new(Link::new(conditions, seed)));
        let server_to_client = Arc::new(Mutex::new(Link::new(
            conditions,
            seed.wrapping_add(0x5eed),
        )));

        Self {
            client: LocalSocket {
                outbound: client_to_server.clone(),
                inbound: server_to_client.clone(),
                peer_addr: server_addr,
            },
            server: LocalSocket {
                outbound: server_to_client,
                inbound: client_to_server,
                peer_addr: client_addr,
            },
        }
    }
}

impl Default for LocalSocketPair {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod local_socket_tests {
    use super::*;

    #[test]
    fn perfect_link_delivers_in_order() {
        let LocalSocketPair {
            mut client,
            mut server,
        } = LocalSocketPair::new();
        client.send(&[1]).unwrap();
        client.send(&[2]).unwrap();

        assert_eq!(server.pending(), 2);
        assert_eq!(server.recv().map(|(packet, _)| packet), Some(vec![1]));
        assert_eq!(server.recv().map(|(packet, _)| packet), Some(vec![2]));
        assert!(server.recv().is_none());
        assert!(client.recv().is_none());
    }

    #[test]
    fn total_loss_delivers_nothing() {
        let mut pair = LocalSocketPair::with_conditions(LinkConditions::lossy(1.0), 3);
        for byte in 0..10u8 {
            pair.client.send(&[byte]).unwrap();
        }
        assert_eq!(pair.server.pending(), 0);
        assert_eq!(pair.client.outbound_stats().lost, 10);
        assert_eq!(pair.client.sent_history().len(), 10);
    }

    #[test]
    fn held_datagram_follows_the_next_one() {
        let conditions = LinkConditions {
            reorder: 1.0,
            ..Default::default()
        };
        let mut pair = LocalSocketPair::with_conditions(conditions, 9);
        pair.client.send(&[1]).unwrap();
        assert_eq!(pair.server.pending(), 0);
        pair.client.send(&[2]).unwrap();

        let order: Vec<Vec<u8>> = std::iter::from_fn(|| pair.server.recv())
            .map(|(packet, _)| packet)
            .collect();
        assert_eq!(order, vec![vec![2], vec![1]]);
    }

    #[test]
    fn closed_socket_refuses_to_send() {
        let mut pair = LocalSocketPair::new();
        pair.server.close();
        assert_eq!(pair.server.send(&[0]), Err(TransportError::Closed));
        assert!(pair.client.send(&[0]).is_ok());
    }

    #[test]
    fn oversized_datagram_is_refused() {
        let mut pair = LocalSocketPair::new();
        let result = pair.client.send(&vec![0; MTU_SIZE_BYTES + 1]);
        assert!(matches!(result, Err(TransportError::TooLarge { .. })));
    }
}
