use std::{sync::Arc, time::Instant};

use log::debug;
use skein_shared::{
    BytesSendable, BytesSink, Endpoint, EndpointConfig, EndpointEvent, HeaderTable, HostType,
    MessageKind, MessageKinds, ReceivedMessage, Reliability, Sendable, SendableHandle, Transport,
};

use crate::local_socket::LocalSocket;

/// An endpoint wired to one end of an in-memory link
pub struct TestPeer {
    pub endpoint: Endpoint,
    pub socket: LocalSocket,
    sink: BytesSink,
    events: Vec<EndpointEvent>,
    rejected_packets: usize,
}

impl TestPeer {
    pub fn new(
        host_type: HostType,
        config: EndpointConfig,
        kinds: Arc<MessageKinds>,
        headers: Arc<HeaderTable>,
        socket: LocalSocket,
        now: Instant,
    ) -> Self {
        Self {
            endpoint: Endpoint::new(host_type, config, kinds, headers, now),
            socket,
            sink: BytesSink::new(),
            events: Vec::new(),
            rejected_packets: 0,
        }
    }

    pub fn update(&mut self, now: Instant) {
        self.endpoint.update(now, &mut self.socket, &mut self.sink);
        self.collect_events();
    }

    /// Feeds every datagram waiting on the socket to the endpoint
    pub fn receive_all(&mut self, now: Instant) -> usize {
        let mut received = 0;
        while let Some((packet, _)) = self.socket.recv() {
            received += 1;
            if let Err(error) = self
                .endpoint
                .receive(now, &packet, &mut self.socket, &mut self.sink)
            {
                debug!("{:?} dropped a packet: {}", self.endpoint.host_type(), error);
                self.rejected_packets += 1;
            }
        }
        self.collect_events();
        received
    }

    pub fn send(
        &mut self,
        now: Instant,
        kind: MessageKind,
        reliability: Reliability,
        payload: &[u8],
    ) -> SendableHandle {
        self.send_sendable(
            now,
            Box::new(BytesSendable::new(kind, reliability, payload.to_vec())),
        )
    }

    pub fn send_sendable(&mut self, now: Instant, sendable: Box<dyn Sendable>) -> SendableHandle {
        match self.endpoint.add_sendable(now, sendable, &[]) {
            Ok(handle) => handle,
            Err(error) => panic!("failed to queue a test message: {}", error),
        }
    }

    pub fn take_received(&mut self) -> Vec<ReceivedMessage> {
        self.sink.take_received()
    }

    /// Every event raised since the last call
    pub fn take_events(&mut self) -> Vec<EndpointEvent> {
        self.collect_events();
        std::mem::take(&mut self.events)
    }

    pub fn has_event(&self, event: &EndpointEvent) -> bool {
        self.events.contains(event)
    }

    pub fn rejected_packets(&self) -> usize {
        self.rejected_packets
    }

    fn collect_events(&mut self) {
        self.events.extend(self.endpoint.take_events());
    }
}
