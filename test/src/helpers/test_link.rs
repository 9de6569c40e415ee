use std::time::{Duration, Instant};

use skein_shared::{EndpointConfig, HeaderTable, HostType};

use crate::{
    helpers::TestPeer,
    local_socket::{LinkConditions, LocalSocketPair},
    test_protocol::protocol,
};

pub const TICK: Duration = Duration::from_millis(50);

/// Ticks allowed for a handshake, enough for several setup resends
const CONNECT_TICKS: usize = 40;

/// A client and a server endpoint joined by an in-memory link, driven by a
/// simulated clock
pub struct TestLink {
    pub client: TestPeer,
    pub server: TestPeer,
    pub now: Instant,
}

impl TestLink {
    pub fn new() -> Self {
        Self::with_conditions(LinkConditions::perfect(), 0)
    }

    pub fn with_conditions(conditions: LinkConditions, seed: u64) -> Self {
        Self::with_config(EndpointConfig::default(), conditions, seed)
    }

    /// Both endpoints use `config`, each with its own seed derived from `seed`
    pub fn with_config(config: EndpointConfig, conditions: LinkConditions, seed: u64) -> Self {
        let now = Instant::now();
        let kinds = protocol();
        let headers = HeaderTable::shared();
        let sockets = LocalSocketPair::with_conditions(conditions, seed);

        let client_config = EndpointConfig {
            seed: Some(seed.wrapping_mul(2).wrapping_add(1)),
            ..config.clone()
        };
        let server_config = EndpointConfig {
            seed: Some(seed.wrapping_mul(2).wrapping_add(2)),
            ..config
        };

        Self {
            client: TestPeer::new(
                HostType::Client,
                client_config,
                kinds.clone(),
                headers.clone(),
                sockets.client,
                now,
            ),
            server: TestPeer::new(
                HostType::Server,
                server_config,
                kinds,
                headers,
                sockets.server,
                now,
            ),
            now,
        }
    }

    /// Advances the clock one tick, updates both sides and then delivers
    /// whatever the link carried
    pub fn tick(&mut self) {
        self.now += TICK;
        self.client.update(self.now);
        self.server.update(self.now);
        self.client.receive_all(self.now);
        self.server.receive_all(self.now);
    }

    pub fn ticks(&mut self, count: usize) {
        for _ in 0..count {
            self.tick();
        }
    }

    /// Ticks until `done` holds, at most `max_ticks` times. Returns whether it held.
    pub fn run_until(
        &mut self,
        max_ticks: usize,
        mut done: impl FnMut(&mut TestLink) -> bool,
    ) -> bool {
        for _ in 0..max_ticks {
            if done(self) {
                return true;
            }
            self.tick();
        }
        done(self)
    }

    /// Runs the handshake to completion
    ///
    /// # Panics
    ///
    /// Panics if either side fails to connect
    pub fn connect(&mut self) {
        let connected = self.run_until(CONNECT_TICKS, |link| {
            link.client.endpoint.is_connected() && link.server.endpoint.is_connected()
        });
        if !connected {
            panic!(
                "handshake did not finish: client {:?}, server {:?}",
                self.client.endpoint.state(),
                self.server.endpoint.state()
            );
        }
    }
}

impl Default for TestLink {
    fn default() -> Self {
        Self::new()
    }
}
