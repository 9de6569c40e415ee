use std::{default::Default, time::Duration};

use crate::{
    connection::error::EndpointError,
    constants::{MIN_SEQUENCED_PACKET_BYTES, MTU_SIZE_BYTES},
    queue::queue_config::QueueSettings,
};

/// Contains Config properties which will be used by an Endpoint
#[derive(Clone, Debug)]
pub struct EndpointConfig {
    /// How long an out of order packet waits in the reorder queue for its
    /// predecessors before being processed anyway
    pub reorder_timeout: Duration,
    /// While the send window is full, the last packet is repeated this often
    pub stall_resend_interval: Duration,
    /// Length of a back-off window
    pub back_off_duration: Duration,
    /// Once packets arrive again, back-off ends after this long
    pub back_off_recovery: Duration,
    /// Backing off longer than this raises `EndpointEvent::BackoffTooLong`
    pub back_off_too_long: Duration,
    /// Backing off longer than this disconnects. `None` backs off forever.
    pub back_off_timeout: Option<Duration>,
    /// Disconnects when nothing has been received for this long
    pub inactivity_timeout: Duration,
    /// Added to `inactivity_timeout` while backing off
    pub back_off_inactivity_grace: Duration,
    /// ConnectionSetup and Disconnect packets are repeated this often
    pub setup_resend_interval: Duration,
    /// How long a closing connection waits for the peer's DisconnectAck
    pub disconnect_linger: Duration,
    /// A Heartbeat is queued when nothing has been sent for this long
    pub heartbeat_interval: Duration,
    /// Minimum spacing between sequenced packets
    pub packet_interval: Duration,
    /// Size the scheduler aims for when filling a packet
    pub target_packet_bytes: usize,
    /// Hard ceiling for an assembled packet, cipher overhead included
    pub max_packet_bytes: usize,
    /// Consecutive nacks that make the endpoint back off
    pub nack_back_off_threshold: u32,
    /// Nacks a reliable message survives before the connection gives up on it.
    /// `None` retries forever.
    pub reliable_retry_budget: Option<u32>,
    /// Reliable ordered messages also wait for the previous one's packet to
    /// resolve before being written
    pub legacy_ordered: bool,
    /// 32 byte AES-256-GCM key. Requires the `encryption` feature.
    pub encryption_key: Option<Vec<u8>>,
    /// Seeds the signing keys and the scheduler's random draws. `None` seeds
    /// from the system.
    pub seed: Option<u64>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            reorder_timeout: Duration::from_millis(33),
            stall_resend_interval: Duration::from_millis(500),
            back_off_duration: Duration::from_millis(200),
            back_off_recovery: Duration::from_millis(100),
            back_off_too_long: Duration::from_secs(5),
            back_off_timeout: None,
            inactivity_timeout: Duration::from_secs(30),
            back_off_inactivity_grace: Duration::from_secs(60),
            setup_resend_interval: Duration::from_millis(250),
            disconnect_linger: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(1),
            packet_interval: Duration::from_millis(33),
            target_packet_bytes: 1000,
            max_packet_bytes: MTU_SIZE_BYTES,
            nack_back_off_threshold: 8,
            reliable_retry_budget: None,
            legacy_ordered: false,
            encryption_key: None,
            seed: None,
        }
    }
}

impl EndpointConfig {
    /// Checks the packet size limits against each other
    pub fn validate(&self) -> Result<(), EndpointError> {
        if self.max_packet_bytes > MTU_SIZE_BYTES {
            return Err(EndpointError::InvalidConfig {
                reason: format!(
                    "max_packet_bytes {} exceeds the {} byte MTU",
                    self.max_packet_bytes, MTU_SIZE_BYTES
                ),
            });
        }
        if self.max_packet_bytes < MIN_SEQUENCED_PACKET_BYTES * 4 {
            return Err(EndpointError::InvalidConfig {
                reason: format!("max_packet_bytes {} is too small", self.max_packet_bytes),
            });
        }
        if self.target_packet_bytes > self.max_packet_bytes {
            return Err(EndpointError::InvalidConfig {
                reason: format!(
                    "target_packet_bytes {} exceeds max_packet_bytes {}",
                    self.target_packet_bytes, self.max_packet_bytes
                ),
            });
        }
        Ok(())
    }

    pub(crate) fn queue_settings(&self, seed: u64) -> QueueSettings {
        QueueSettings {
            legacy_ordered: self.legacy_ordered,
            reliable_retry_budget: self.reliable_retry_budget,
            seed,
        }
    }
}

#[cfg(test)]
mod endpoint_config_tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert_eq!(EndpointConfig::default().validate(), Ok(()));
    }

    #[test]
    fn target_above_ceiling_is_rejected() {
        let config = EndpointConfig {
            target_packet_bytes: 1100,
            max_packet_bytes: 1000,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(EndpointError::InvalidConfig { .. })
        ));
    }
}
