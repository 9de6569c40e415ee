use std::net::SocketAddr;

pub mod error;

use error::TransportError;

/// A synchronous, non-blocking datagram socket. The endpoint only ever hands
/// over a finished buffer or takes a finished buffer out.
pub trait Transport {
    fn send(&mut self, payload: &[u8]) -> Result<(), TransportError>;

    fn recv(&mut self) -> Option<(Vec<u8>, SocketAddr)>;
}
