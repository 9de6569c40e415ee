use std::{
    collections::VecDeque,
    mem,
    sync::Arc,
    time::{Duration, Instant},
};

use log::{debug, info, trace, warn};
use skein_serde::{BitReader, BitWrite, BitWriter, SerdeErr};

use crate::{
    connection::{
        ack_block::{AckBlock, PendingAck},
        big_state::BigState,
        big_state_pool::BigStatePool,
        cipher::cipher_for_key,
        endpoint_config::EndpointConfig,
        error::{DisconnectReason, EndpointError, PacketError},
        events::EndpointEvent,
        header_table::HeaderTable,
        heartbeat::Heartbeat,
        message_sink::MessageSink,
        packet_type::PacketKind,
        packet_writer::PacketWriter,
        sequence_state::{
            InputSequenceState, OutputSequenceState, SequenceCounters, SequenceWindow,
        },
    },
    constants::{
        MAX_MESSAGES_PER_PACKET, MIN_SEQUENCED_PACKET_BYTES, PROTOCOL_VERSION,
        SEQUENCE_HEADER_BYTES, TRAILER_BYTES, WINDOW_SIZE,
    },
    messages::{
        handle::SendableHandle,
        message_kinds::{MessageKind, MessageKinds},
        sendable::Sendable,
    },
    queue::{
        message_queue::{MessageQueue, QueueError, SchedulingParams},
        slot_pool::SlotState,
    },
    sequence_list::SequenceList,
    transport::Transport,
    types::{HostType, SequenceNumber, Vec3},
    wrapping_number::{narrow_sequence, try_widen_sequence},
};

/// Retired big states are trimmed this often
const POOL_CLEANUP_INTERVAL: Duration = Duration::from_secs(1);
/// ConnectionSetup body: the protocol version
const SETUP_BODY_BYTES: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Handshaking,
    Connected,
    Disconnecting,
    Closed,
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Closed => "closed",
        }
    }
}

/// Running totals kept by an endpoint
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EndpointStats {
    pub packets_received: u64,
    pub packets_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    /// Malformed, undecodable or unexpected packets
    pub packets_dropped: u64,
    /// Sequences that never arrived and were nacked
    pub packets_skipped: u64,
    /// Late or duplicate sequences
    pub packets_reordered: u64,
    /// Sequences parked in the reorder queue
    pub packets_queued: u64,
    /// Packets repeated while the send window was full
    pub packets_repeated: u64,
    pub reorder_timeouts: u64,
    pub reorder_ready: u64,
    pub packets_acked: u64,
    pub packets_nacked: u64,
    /// Verdicts owed to the peer that are marked urgent
    pub urgent_acks: u32,
}

/// Observer the scheduler measures distance and direction bumps against
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Witness {
    pub position: Option<Vec3>,
    pub direction: Option<Vec3>,
    /// Field of view in radians
    pub fov: Option<f32>,
}

struct QueuedPacket {
    bytes: Vec<u8>,
    tag: u8,
    arrived: Instant,
}

struct BackOff {
    started: Instant,
    until: Instant,
    too_long_raised: bool,
}

/// A packet that passed every check but has not been applied yet
struct DecodedPacket<M> {
    big_state: BigState,
    acks: AckBlock,
    urgent: bool,
    had_data: bool,
    messages: Vec<(MessageKind, M)>,
}

/// One side of a connection: sequences, acknowledges and schedules messages
/// over an unreliable datagram transport.
///
/// The owner feeds inbound datagrams to `receive`, calls `update` once per
/// network tick and drains `take_events`. Nothing here blocks or touches a
/// socket directly.
pub struct Endpoint {
    host_type: HostType,
    config: EndpointConfig,
    kinds: Arc<MessageKinds>,
    headers: Arc<HeaderTable>,
    queue: MessageQueue,
    state: ConnectionState,
    rng: fastrand::Rng,
    start: Instant,
    witness: Witness,

    // output side
    out_seq: SequenceNumber,
    input_ack: SequenceNumber,
    basis_seq: SequenceNumber,
    output: SequenceWindow<OutputSequenceState>,
    output_pool: BigStatePool,
    state_blockers: u32,
    /// A state changing message went out and `NoBlockingMessages` is owed
    blocked: bool,
    consecutive_nacks: u32,
    sent_ack_needed: bool,
    last_packet: Option<Vec<u8>>,
    last_stall_resend: Option<Instant>,

    // input side
    input_seq: SequenceNumber,
    last_basis_seq: SequenceNumber,
    input: SequenceWindow<InputSequenceState>,
    input_pool: BigStatePool,
    pending_acks: VecDeque<PendingAck>,
    front_ack: SequenceNumber,
    recv_ack_needed: bool,
    reorder: SequenceList<QueuedPacket>,

    // timing
    last_receive: Instant,
    last_send: Option<Instant>,
    last_control_send: Option<Instant>,
    last_pool_cleanup: Instant,
    disconnect_started: Option<Instant>,
    disconnect_code: u8,
    rtt: Option<Duration>,
    back_off: Option<BackOff>,
    received_since_back_off: bool,

    events: Vec<EndpointEvent>,
    stats: EndpointStats,
}

impl Endpoint {
    /// Creates an endpoint in the handshaking state. Both peers must share the
    /// same message table and header tables.
    pub fn try_new(
        host_type: HostType,
        config: EndpointConfig,
        kinds: Arc<MessageKinds>,
        headers: Arc<HeaderTable>,
        now: Instant,
    ) -> Result<Self, EndpointError> {
        config.validate()?;
        let cipher = match &config.encryption_key {
            Some(key) => Some(cipher_for_key(key)?),
            None => None,
        };
        let rng = match config.seed {
            Some(seed) => fastrand::Rng::with_seed(seed),
            None => fastrand::Rng::new(),
        };
        let queue = MessageQueue::new(config.queue_settings(rng.u64(..)));

        // sequence zero on both sides holds the shared initial state
        let initial = BigState::new(cipher);
        let mut output: SequenceWindow<OutputSequenceState> = SequenceWindow::new();
        output.get_mut(0).big_state = Some(initial.clone());
        let mut input: SequenceWindow<InputSequenceState> = SequenceWindow::new();
        let slot = input.get_mut(0);
        slot.big_state = Some(initial);
        slot.last_valid = Some(0);

        Ok(Self {
            host_type,
            config,
            kinds,
            headers,
            queue,
            state: ConnectionState::Handshaking,
            rng,
            start: now,
            witness: Witness::default(),
            out_seq: 0,
            input_ack: 0,
            basis_seq: 0,
            output,
            output_pool: BigStatePool::new(),
            state_blockers: 0,
            blocked: false,
            consecutive_nacks: 0,
            sent_ack_needed: false,
            last_packet: None,
            last_stall_resend: None,
            input_seq: 1,
            last_basis_seq: 0,
            input,
            input_pool: BigStatePool::new(),
            pending_acks: VecDeque::new(),
            front_ack: 1,
            recv_ack_needed: false,
            reorder: SequenceList::new(),
            last_receive: now,
            last_send: None,
            last_control_send: None,
            last_pool_cleanup: now,
            disconnect_started: None,
            disconnect_code: 0,
            rtt: None,
            back_off: None,
            received_since_back_off: true,
            events: Vec::new(),
            stats: EndpointStats::default(),
        })
    }

    /// Creates an endpoint in the handshaking state
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid or its cipher cannot be built
    pub fn new(
        host_type: HostType,
        config: EndpointConfig,
        kinds: Arc<MessageKinds>,
        headers: Arc<HeaderTable>,
        now: Instant,
    ) -> Self {
        match Self::try_new(host_type, config, kinds, headers, now) {
            Ok(endpoint) => endpoint,
            Err(error) => panic!("failed to create endpoint: {}", error),
        }
    }

    // Accessors

    pub fn host_type(&self) -> HostType {
        self.host_type
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn stats(&self) -> EndpointStats {
        let mut stats = self.stats;
        stats.urgent_acks = self.urgent_acks();
        stats
    }

    /// Smoothed round trip time, once a packet has been acked
    pub fn rtt(&self) -> Option<Duration> {
        self.rtt
    }

    /// Highest sequence handed to the transport
    pub fn out_seq(&self) -> SequenceNumber {
        self.out_seq
    }

    /// Highest positively acked sequence, the basis new packets are coded against
    pub fn basis_seq(&self) -> SequenceNumber {
        self.basis_seq
    }

    /// Next sequence expected from the peer
    pub fn input_seq(&self) -> SequenceNumber {
        self.input_seq
    }

    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    /// Direct access to the queue, for configuration and spawn gating
    pub fn queue_mut(&mut self) -> &mut MessageQueue {
        &mut self.queue
    }

    pub fn set_witness(&mut self, witness: Witness) {
        self.witness = witness;
    }

    /// Nothing queued or owed that would wake the connection
    pub fn is_idle(&self) -> bool {
        self.urgent_acks() == 0 && self.queue.is_idle()
    }

    /// State changing messages are still travelling
    pub fn is_blocking_state_change(&self) -> bool {
        self.state_blockers > 0 || self.queue.is_blocking_state_change()
    }

    pub fn take_events(&mut self) -> Vec<EndpointEvent> {
        mem::take(&mut self.events)
    }

    fn urgent_acks(&self) -> u32 {
        self.pending_acks.iter().filter(|ack| ack.urgent).count() as u32
    }

    // Messages

    /// Queues a message behind the messages named in `after`
    pub fn add_sendable(
        &mut self,
        now: Instant,
        sendable: Box<dyn Sendable>,
        after: &[SendableHandle],
    ) -> Result<SendableHandle, QueueError> {
        let outcome = self.queue.add_sendable(now, sendable, after)?;
        if outcome.became_alerted {
            self.events.push(EndpointEvent::BecomeAlerted);
        }
        Ok(outcome.handle)
    }

    /// Replaces a queued message, see `MessageQueue::substitute_sendable`
    pub fn substitute_sendable(
        &mut self,
        now: Instant,
        handle: SendableHandle,
        sendable: Box<dyn Sendable>,
        after: &[SendableHandle],
    ) -> Result<SendableHandle, QueueError> {
        let outcome = self
            .queue
            .substitute_sendable(now, handle, sendable, after)?;
        if outcome.became_alerted {
            self.events.push(EndpointEvent::BecomeAlerted);
        }
        Ok(outcome.handle)
    }

    pub fn remove_sendable(&mut self, handle: SendableHandle) -> bool {
        self.queue.remove_sendable(handle)
    }

    pub fn find_sendable(&self, handle: SendableHandle) -> Option<&dyn Sendable> {
        self.queue.find_sendable(handle)
    }

    pub fn sendable_state(&self, handle: SendableHandle) -> Option<SlotState> {
        self.queue.state_of(handle)
    }

    /// Tears the queue down: in flight messages are nacked, everything queued
    /// is rejected, and new messages are refused from now on
    pub fn empty_messages(&mut self, now: Instant) {
        self.queue.set_empty_mode(true);
        let mut seq = self.input_ack + 1;
        while seq <= self.out_seq {
            let slot = self.output.get_mut(seq);
            let sent = mem::take(&mut slot.sent);
            slot.state_blockers = 0;
            self.queue.ack_messages(now, &sent, seq, false);
            seq += 1;
        }
        self.queue.empty();
        self.state_blockers = 0;
        self.blocked = false;
    }

    // Lifecycle

    /// Starts closing the connection. Disconnect packets are sent from `update`
    /// until the peer acknowledges or the linger time passes.
    pub fn disconnect(&mut self, now: Instant) {
        self.begin_disconnect(now, DisconnectReason::LocalDisconnect);
    }

    /// Suppresses sequenced sends for a while. Ignored unless a packet has
    /// arrived since the previous back-off began.
    pub fn back_off(&mut self, now: Instant) {
        if !self.received_since_back_off {
            trace!("back-off requested again before any packet arrived");
            return;
        }
        self.received_since_back_off = false;
        let until = now + self.config.back_off_duration;
        match &mut self.back_off {
            Some(back_off) => back_off.until = back_off.until.max(until),
            None => {
                warn!("backing off for {:?}", self.config.back_off_duration);
                self.back_off = Some(BackOff {
                    started: now,
                    until,
                    too_long_raised: false,
                });
            }
        }
    }

    pub fn is_backing_off(&self) -> bool {
        self.back_off.is_some()
    }

    /// Asks the peer to back off
    pub fn request_peer_back_off(
        &mut self,
        transport: &mut dyn Transport,
    ) -> Result<(), EndpointError> {
        if self.state != ConnectionState::Connected {
            return Err(EndpointError::InvalidState {
                state: self.state.name(),
                operation: "request a back-off",
            });
        }
        self.send_control(transport, PacketKind::BackOff, &[]);
        Ok(())
    }

    /// The once per tick entry point: timeouts, handshake and disconnect
    /// resends, reorder queue timeouts, heartbeats and sending
    pub fn update<S: MessageSink>(
        &mut self,
        now: Instant,
        transport: &mut dyn Transport,
        sink: &mut S,
    ) {
        match self.state {
            ConnectionState::Closed => return,
            ConnectionState::Disconnecting => {
                self.update_disconnecting(now, transport);
                return;
            }
            ConnectionState::Handshaking => {
                self.update_handshaking(now, transport);
                return;
            }
            ConnectionState::Connected => {}
        }

        self.drain_reorder_queue(now, sink);
        self.check_timeouts(now);
        self.update_back_off(now);
        if self.state != ConnectionState::Connected {
            return;
        }

        self.queue_heartbeat(now);
        self.send_packet(now, transport);
        self.check_unblocked();

        if now.saturating_duration_since(self.last_pool_cleanup) >= POOL_CLEANUP_INTERVAL {
            self.last_pool_cleanup = now;
            self.output_pool.perform_regular_cleanup();
            self.input_pool.perform_regular_cleanup();
        }
    }

    fn update_handshaking(&mut self, now: Instant, transport: &mut dyn Transport) {
        let silent = now.saturating_duration_since(self.last_receive);
        if silent >= self.config.inactivity_timeout {
            self.begin_disconnect(
                now,
                DisconnectReason::Timeout {
                    seconds: silent.as_secs(),
                },
            );
            return;
        }
        if self.control_resend_due(now) {
            self.last_control_send = Some(now);
            self.send_control(
                transport,
                PacketKind::ConnectionSetup,
                &PROTOCOL_VERSION.to_be_bytes(),
            );
        }
    }

    fn update_disconnecting(&mut self, now: Instant, transport: &mut dyn Transport) {
        let started = self.disconnect_started.unwrap_or(now);
        if now.saturating_duration_since(started) >= self.config.disconnect_linger {
            self.close();
            return;
        }
        if self.control_resend_due(now) {
            self.last_control_send = Some(now);
            let code = [self.disconnect_code];
            self.send_control(transport, PacketKind::Disconnect, &code);
        }
    }

    fn control_resend_due(&self, now: Instant) -> bool {
        self.last_control_send.map_or(true, |sent| {
            now.saturating_duration_since(sent) >= self.config.setup_resend_interval
        })
    }

    fn become_connected(&mut self) {
        if self.state != ConnectionState::Handshaking {
            return;
        }
        info!("{:?} endpoint connected", self.host_type);
        self.state = ConnectionState::Connected;
        self.last_control_send = None;
        self.events.push(EndpointEvent::Connected);
    }

    fn begin_disconnect(&mut self, now: Instant, reason: DisconnectReason) {
        if matches!(
            self.state,
            ConnectionState::Disconnecting | ConnectionState::Closed
        ) {
            return;
        }
        info!("{:?} endpoint disconnecting: {}", self.host_type, reason);
        self.empty_messages(now);
        self.reorder.clear();
        self.disconnect_code = reason.code();
        self.events.push(EndpointEvent::Disconnected(reason));
        self.state = ConnectionState::Disconnecting;
        self.disconnect_started = Some(now);
        self.last_control_send = None;
    }

    fn close(&mut self) {
        if self.state != ConnectionState::Closed {
            info!("{:?} endpoint closed", self.host_type);
        }
        self.state = ConnectionState::Closed;
        self.back_off = None;
        self.reorder.clear();
    }

    fn check_timeouts(&mut self, now: Instant) {
        let mut limit = self.config.inactivity_timeout;
        if self.back_off.is_some() {
            limit += self.config.back_off_inactivity_grace;
        }
        if now.saturating_duration_since(self.last_receive) >= limit {
            self.begin_disconnect(
                now,
                DisconnectReason::Timeout {
                    seconds: limit.as_secs(),
                },
            );
        }
    }

    fn update_back_off(&mut self, now: Instant) {
        let Some(back_off) = self.back_off.as_mut() else {
            return;
        };
        if self.received_since_back_off && now >= back_off.until {
            info!("back-off ended");
            self.back_off = None;
            return;
        }

        let silent = now.saturating_duration_since(self.last_receive.max(back_off.started));
        if silent >= self.config.back_off_too_long && !back_off.too_long_raised {
            back_off.too_long_raised = true;
            warn!("no packets for {:?} while backing off", silent);
            self.events.push(EndpointEvent::BackoffTooLong);
        }

        let backing_off_for = now.saturating_duration_since(back_off.started);
        if let Some(timeout) = self.config.back_off_timeout {
            if backing_off_for >= timeout {
                self.begin_disconnect(
                    now,
                    DisconnectReason::BackOffTimeout {
                        seconds: backing_off_for.as_secs(),
                    },
                );
            }
        }
    }

    fn mark_received(&mut self, now: Instant) {
        self.last_receive = now;
        self.received_since_back_off = true;
        if let Some(back_off) = &mut self.back_off {
            back_off.until = back_off.until.min(now + self.config.back_off_recovery);
        }
    }

    fn queue_heartbeat(&mut self, now: Instant) {
        let quiet = self.last_send.map_or(true, |sent| {
            now.saturating_duration_since(sent) >= self.config.heartbeat_interval
        });
        if quiet && self.queue.is_empty() {
            if let Err(error) = self.queue.add_sendable(now, Box::new(Heartbeat), &[]) {
                debug!("heartbeat not queued: {}", error);
            }
        }
    }

    fn send_control(&mut self, transport: &mut dyn Transport, kind: PacketKind, body: &[u8]) {
        let mut packet = Vec::with_capacity(1 + body.len());
        packet.push(self.headers.header_for(kind));
        packet.extend_from_slice(body);
        trace!("sending {:?}", kind);
        self.transmit(transport, &packet);
    }

    fn transmit(&mut self, transport: &mut dyn Transport, packet: &[u8]) {
        match transport.send(packet) {
            Ok(()) => self.stats.bytes_sent += packet.len() as u64,
            Err(error) => warn!("transport send failed: {}", error),
        }
    }

    // Sending

    fn send_packet(&mut self, now: Instant, transport: &mut dyn Transport) {
        if self.back_off.is_some() {
            return;
        }
        if let Some(sent) = self.last_send {
            if now.saturating_duration_since(sent) < self.config.packet_interval {
                return;
            }
        }

        let seq = self.out_seq + 1;
        if seq >= self.basis_seq + WINDOW_SIZE {
            self.resend_stalled(now, transport);
            return;
        }
        self.drop_delivered_acks();

        let overhead = self
            .output
            .get(self.basis_seq)
            .big_state
            .as_ref()
            .map_or(0, |state| state.overhead());
        let mut params = SchedulingParams::new(
            now,
            seq,
            self.config
                .target_packet_bytes
                .saturating_sub(SEQUENCE_HEADER_BYTES + TRAILER_BYTES + overhead),
        );
        params.next = now + self.config.packet_interval;
        params.transport_latency = self.rtt.map_or(Duration::ZERO, |rtt| rtt / 2);
        params.witness_position = self.witness.position;
        params.witness_direction = self.witness.direction;
        params.witness_fov = self.witness.fov;

        let messages_to_write = self.queue.are_messages_to_write(&params);
        let return_ack_needed =
            messages_to_write || self.pending_acks.iter().any(|ack| ack.had_data);
        let forced = self.recv_ack_needed
            || self.sent_ack_needed
            || return_ack_needed
            || self.queue.is_blocking_state_change()
            || self.state_blockers > 0;
        if !forced {
            return;
        }

        self.write_packet(now, seq, &params, return_ack_needed, overhead, transport);
    }

    /// Forgets verdicts the peer has confirmed receiving: everything its
    /// basis packet already accounts for
    fn drop_delivered_acks(&mut self) {
        let delivered = self.output.get(self.basis_seq).counters.acked_or_nacked;
        while self.front_ack <= delivered {
            if self.pending_acks.pop_front().is_none() {
                break;
            }
            self.front_ack += 1;
        }
    }

    fn write_packet(
        &mut self,
        now: Instant,
        seq: SequenceNumber,
        params: &SchedulingParams,
        return_ack_needed: bool,
        overhead: usize,
        transport: &mut dyn Transport,
    ) {
        let basis_seq = self.basis_seq;
        let Some(basis_state) = self.output.get(basis_seq).big_state.as_ref() else {
            warn!("basis sequence {} holds no state, cannot send", basis_seq);
            return;
        };
        let mut big_state = self.output_pool.acquire_clone(basis_state);
        big_state.begin_packet();

        let mut counters = self.output.get(basis_seq).counters;
        counters.packets += 1;
        for ack in &self.pending_acks {
            counters.acked_or_nacked += 1;
            if ack.received {
                counters.acks += 1;
            }
        }

        let key = self.rng.u8(..);
        let sent_ms = now.saturating_duration_since(self.start).as_millis() as u32;
        let mut writer = BitWriter::with_capacity(self.config.max_packet_bytes);
        AckBlock::write(
            &mut writer,
            self.pending_acks.iter().map(|ack| ack.received),
            return_ack_needed,
        );
        writer.write_bits(u64::from(key), 8);
        writer.write_bits(u64::from(sent_ms), 32);

        let usable_bytes = self
            .config
            .max_packet_bytes
            .saturating_sub(SEQUENCE_HEADER_BYTES + TRAILER_BYTES + overhead);
        // end of stream id, urgent bit, signing check and padding
        let reserve = big_state.worst_case_id_bits(self.kinds.id_bits()) + 1 + 8 + 7;
        let limit_bits = ((usable_bytes * 8) as u32).saturating_sub(reserve);

        let kinds = Arc::clone(&self.kinds);
        let mut output = PacketWriter::new(&kinds, &mut big_state, writer, limit_bits);
        let summary = self.queue.build_packet(&mut output, params);
        if !summary.header_written {
            output.write_end_of_stream();
        }
        let contents = output.into_parts();

        let mut writer = contents.writer;
        writer.write_bit(contents.urgent);
        writer.write_bits(u64::from(key ^ 0xff), 8);
        let body = writer.to_bytes();

        let tag = (seq - basis_seq - 1) as u8;
        let kind = if contents.in_sync {
            PacketKind::SyncTransportSeq(tag)
        } else {
            PacketKind::TransportSeq(tag)
        };
        let mut packet = Vec::with_capacity(
            SEQUENCE_HEADER_BYTES + body.len() + TRAILER_BYTES + overhead,
        );
        packet.push(self.headers.header_for(kind));
        packet.push(self.headers.obfuscate_sequence(narrow_sequence(seq)));
        packet.extend_from_slice(&body);
        let hash = quick_hash(&packet);
        packet.push(key);
        packet.push(hash ^ key);
        let encrypted = big_state.encrypt(self.host_type, seq, &mut packet);

        self.queue.finish_frame(Some(seq));
        let slot = self.output.get_mut(seq);
        debug_assert!(slot.is_available());
        slot.release(&mut self.output_pool);
        slot.big_state = Some(big_state);
        slot.counters = counters;
        slot.sent = contents.sent;
        slot.state_blockers = contents.state_blockers;
        slot.sent_at = Some(now);

        self.state_blockers += contents.state_blockers;
        self.blocked |= contents.state_blockers > 0;
        self.out_seq = seq;
        self.sent_ack_needed = return_ack_needed;
        self.recv_ack_needed = false;
        self.last_send = Some(now);

        match encrypted {
            Ok(()) => {
                trace!(
                    "sending sequence {} ({} messages, {} bytes)",
                    seq,
                    summary.messages_written,
                    packet.len()
                );
                self.stats.packets_sent += 1;
                self.transmit(transport, &packet);
                self.events.push(EndpointEvent::SendingPacket {
                    seq,
                    bytes: packet.len(),
                });
                self.last_packet = Some(packet);
            }
            Err(error) => warn!("sequence {} not sent: {}", seq, error),
        }

        if contents.connection_failed {
            self.begin_disconnect(
                now,
                DisconnectReason::protocol_error("a message reported the connection as failed"),
            );
        }
    }

    /// The window is full: repeat the last packet now and then so the peer
    /// notices and answers with its verdicts
    fn resend_stalled(&mut self, now: Instant, transport: &mut dyn Transport) {
        let due = self.last_stall_resend.map_or(true, |sent| {
            now.saturating_duration_since(sent) >= self.config.stall_resend_interval
        });
        if !due {
            return;
        }
        self.last_stall_resend = Some(now);
        if let Some(packet) = self.last_packet.take() {
            warn!(
                "send window full at sequence {} (basis {}), repeating",
                self.out_seq, self.basis_seq
            );
            self.stats.packets_repeated += 1;
            self.transmit(transport, &packet);
            self.last_packet = Some(packet);
        }
    }

    // Acknowledgement

    /// Applies the peer's verdict on output sequence `seq`
    fn ack_packet(
        &mut self,
        now: Instant,
        seq: SequenceNumber,
        ok: bool,
    ) -> Result<(), DisconnectReason> {
        if seq <= self.input_ack {
            return Ok(());
        }
        if seq > self.out_seq {
            return Err(DisconnectReason::protocol_error(format!(
                "verdict for sequence {} which was never sent (last sent {})",
                seq, self.out_seq
            )));
        }
        if seq != self.input_ack + 1 {
            return Err(DisconnectReason::protocol_error(format!(
                "verdict for sequence {} skips sequence {}",
                seq,
                self.input_ack + 1
            )));
        }
        if self.output.get(seq).is_available() {
            return Err(DisconnectReason::protocol_error(format!(
                "verdict for sequence {} whose slot is empty",
                seq
            )));
        }

        self.input_ack = seq;
        let slot = self.output.get_mut(seq);
        let sent = mem::take(&mut slot.sent);
        let blockers = mem::take(&mut slot.state_blockers);
        let sent_at = slot.sent_at.take();

        if ok {
            if self.basis_seq != seq {
                self.output
                    .get_mut(self.basis_seq)
                    .release(&mut self.output_pool);
            }
            self.basis_seq = seq;
            self.consecutive_nacks = 0;
            self.stats.packets_acked += 1;
            if let Some(sent_at) = sent_at {
                self.record_rtt(now.saturating_duration_since(sent_at));
            }
        } else {
            self.output.get_mut(seq).release(&mut self.output_pool);
            self.consecutive_nacks += 1;
            self.stats.packets_nacked += 1;
            debug!("sequence {} was lost", seq);
        }

        let exhausted = self.queue.ack_messages(now, &sent, seq, ok);

        self.state_blockers = self.state_blockers.saturating_sub(blockers);

        if self.consecutive_nacks >= self.config.nack_back_off_threshold {
            self.consecutive_nacks = 0;
            self.back_off(now);
        }

        match exhausted.into_iter().next() {
            Some(description) => Err(DisconnectReason::RetriesExhausted { description }),
            None => Ok(()),
        }
    }

    /// Delivered blockers leave the queue's count when their slots are
    /// reclaimed, which happens on the next scheduling pass
    fn check_unblocked(&mut self) {
        if self.blocked && !self.is_blocking_state_change() {
            self.blocked = false;
            self.events.push(EndpointEvent::NoBlockingMessages);
        }
    }

    fn record_rtt(&mut self, sample: Duration) {
        self.rtt = Some(match self.rtt {
            Some(rtt) => (rtt * 7 + sample) / 8,
            None => sample,
        });
    }

    // Receiving

    /// Processes one inbound datagram. Errors describe why it was dropped;
    /// they never end the connection.
    pub fn receive<S: MessageSink>(
        &mut self,
        now: Instant,
        packet: &[u8],
        transport: &mut dyn Transport,
        sink: &mut S,
    ) -> Result<(), PacketError> {
        self.stats.bytes_received += packet.len() as u64;
        let result = self.receive_inner(now, packet, transport, sink);
        if let Err(error) = &result {
            self.drop_packet(error);
        }
        result
    }

    fn receive_inner<S: MessageSink>(
        &mut self,
        now: Instant,
        packet: &[u8],
        transport: &mut dyn Transport,
        sink: &mut S,
    ) -> Result<(), PacketError> {
        let Some(&first) = packet.first() else {
            return Err(PacketError::TooShort {
                length: 0,
                required: 1,
            });
        };
        // SECURITY: the header byte is untrusted
        let Some(kind) = self.headers.try_kind_for(first) else {
            return Err(PacketError::UnknownHeader { byte: first });
        };

        match kind {
            PacketKind::ConnectionSetup => self.receive_setup(now, packet, transport),
            PacketKind::SetupAck => {
                self.mark_received(now);
                self.become_connected();
                Ok(())
            }
            PacketKind::Disconnect => {
                self.mark_received(now);
                let code = packet.get(1).copied().unwrap_or(0);
                self.send_control(transport, PacketKind::DisconnectAck, &[]);
                if matches!(
                    self.state,
                    ConnectionState::Handshaking | ConnectionState::Connected
                ) {
                    self.begin_disconnect(now, DisconnectReason::RemoteDisconnect { code });
                }
                self.close();
                Ok(())
            }
            PacketKind::DisconnectAck => {
                if self.state == ConnectionState::Disconnecting {
                    self.close();
                }
                Ok(())
            }
            PacketKind::BackOff => {
                self.back_off(now);
                self.mark_received(now);
                Ok(())
            }
            PacketKind::TransportSeq(tag) | PacketKind::SyncTransportSeq(tag) => {
                match self.state {
                    ConnectionState::Disconnecting | ConnectionState::Closed => {
                        return Err(PacketError::NotConnected)
                    }
                    // the peer only sends sequenced data once it has our setup
                    ConnectionState::Handshaking => self.become_connected(),
                    ConnectionState::Connected => {}
                }
                let may_queue = matches!(kind, PacketKind::TransportSeq(_));
                let result = self.receive_sequenced(now, packet, tag, may_queue, sink);
                self.drain_reorder_queue(now, sink);
                result
            }
        }
    }

    fn drop_packet(&mut self, error: &PacketError) {
        self.stats.packets_dropped += 1;
        match error {
            PacketError::Duplicate { .. } | PacketError::NotConnected => {
                debug!("dropping packet: {}", error)
            }
            _ => warn!("dropping packet: {}", error),
        }
    }

    fn receive_setup(
        &mut self,
        now: Instant,
        packet: &[u8],
        transport: &mut dyn Transport,
    ) -> Result<(), PacketError> {
        if packet.len() < 1 + SETUP_BODY_BYTES {
            return Err(PacketError::TooShort {
                length: packet.len(),
                required: 1 + SETUP_BODY_BYTES,
            });
        }
        let mut version = [0u8; SETUP_BODY_BYTES];
        version.copy_from_slice(&packet[1..1 + SETUP_BODY_BYTES]);
        let remote = u32::from_be_bytes(version);
        self.mark_received(now);

        if remote != PROTOCOL_VERSION {
            let reason = DisconnectReason::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote,
            };
            self.send_control(transport, PacketKind::Disconnect, &[reason.code()]);
            self.begin_disconnect(now, reason);
            return Ok(());
        }
        if self.state == ConnectionState::Closed {
            return Err(PacketError::NotConnected);
        }
        self.send_control(transport, PacketKind::SetupAck, &[]);
        self.become_connected();
        Ok(())
    }

    fn receive_sequenced<S: MessageSink>(
        &mut self,
        now: Instant,
        packet: &[u8],
        tag: u8,
        may_queue: bool,
        sink: &mut S,
    ) -> Result<(), PacketError> {
        let required = MIN_SEQUENCED_PACKET_BYTES
            + self
                .input
                .get(self.last_basis_seq)
                .big_state
                .as_ref()
                .map_or(0, |state| state.overhead());
        if packet.len() < required {
            return Err(PacketError::TooShort {
                length: packet.len(),
                required,
            });
        }

        let expected = self.input_seq;
        let low = self.headers.clarify_sequence(packet[1]);
        let seq = try_widen_sequence(low, expected).map_err(|_| PacketError::OutOfWindow {
            seq: u32::from(low),
            expected,
        })?;
        if seq < expected {
            self.stats.packets_reordered += 1;
            // a repeat means the peer is waiting on our verdicts
            self.recv_ack_needed = true;
            return Err(PacketError::Duplicate { seq, expected });
        }
        if seq > expected + WINDOW_SIZE {
            return Err(PacketError::OutOfWindow { seq, expected });
        }

        if may_queue && seq > expected {
            if self.reorder.contains_scan_from_back(seq) {
                self.stats.packets_reordered += 1;
                return Err(PacketError::Duplicate { seq, expected });
            }
            if self.reorder.len() >= WINDOW_SIZE as usize {
                return Err(PacketError::OutOfWindow { seq, expected });
            }
            trace!("sequence {} arrived early, expecting {}", seq, expected);
            self.stats.packets_queued += 1;
            let queued = QueuedPacket {
                bytes: packet.to_vec(),
                tag,
                arrived: now,
            };
            if let Err(error) = self.reorder.try_insert_scan_from_back(seq, queued) {
                debug!("{}", error);
            }
            return Ok(());
        }

        let basis = seq
            .checked_sub(u32::from(tag) + 1)
            .ok_or(PacketError::BasisMismatch { seq, basis: 0 })?;
        if basis < self.last_basis_seq || !self.input.get(basis).is_valid_for(basis) {
            return Err(PacketError::BasisMismatch { seq, basis });
        }

        let decoded = self.decode_sequenced(seq, basis, packet, sink)?;
        self.apply_sequenced(now, seq, basis, decoded, sink);
        Ok(())
    }

    /// Decodes a packet against a scratch copy of its basis state. Nothing on
    /// the endpoint changes unless every check passes.
    fn decode_sequenced<S: MessageSink>(
        &mut self,
        seq: SequenceNumber,
        basis: SequenceNumber,
        packet: &[u8],
        sink: &mut S,
    ) -> Result<DecodedPacket<S::Message>, PacketError> {
        let Some(basis_state) = self.input.get(basis).big_state.as_ref() else {
            return Err(PacketError::BasisMismatch { seq, basis });
        };
        let mut state = self.input_pool.acquire_clone(basis_state);
        state.begin_packet();

        match decode_body(
            &self.kinds,
            &mut state,
            self.host_type.invert(),
            seq,
            packet,
            sink,
        ) {
            Ok((acks, urgent, messages)) => Ok(DecodedPacket {
                big_state: state,
                acks,
                urgent,
                had_data: !messages.is_empty(),
                messages: messages
                    .into_iter()
                    .filter_map(|(kind, message)| message.map(|message| (kind, message)))
                    .collect(),
            }),
            Err(error) => {
                self.input_pool.release(state);
                Err(error)
            }
        }
    }

    fn apply_sequenced<S: MessageSink>(
        &mut self,
        now: Instant,
        seq: SequenceNumber,
        basis: SequenceNumber,
        decoded: DecodedPacket<S::Message>,
        sink: &mut S,
    ) {
        // the peer has moved past everything older than its new basis
        let stale_end = basis.min(self.last_basis_seq + WINDOW_SIZE);
        for old in self.last_basis_seq..stale_end {
            if old % WINDOW_SIZE == basis % WINDOW_SIZE {
                continue;
            }
            let slot = self.input.get_mut(old);
            if slot.last_valid == Some(old) {
                slot.release(&mut self.input_pool);
            }
        }
        self.last_basis_seq = basis;

        let basis_counters = self.input.get(basis).counters;
        let verdicts: Vec<(SequenceNumber, bool)> = decoded
            .acks
            .sequences(basis_counters.acked_or_nacked)
            .collect();
        let counters = SequenceCounters {
            acks: basis_counters.acks + verdicts.iter().filter(|(_, ok)| *ok).count() as u32,
            acked_or_nacked: basis_counters.acked_or_nacked + verdicts.len() as u32,
            packets: basis_counters.packets + 1,
        };

        let slot = self.input.get_mut(seq);
        slot.release(&mut self.input_pool);
        slot.big_state = Some(decoded.big_state);
        slot.counters = counters;
        slot.last_valid = Some(seq);

        while self.input_seq < seq {
            debug!("sequence {} never arrived", self.input_seq);
            self.pending_acks.push_back(PendingAck::skipped());
            self.stats.packets_skipped += 1;
            self.input_seq += 1;
        }
        self.pending_acks
            .push_back(PendingAck::received(decoded.had_data, decoded.urgent));
        self.input_seq = seq + 1;
        self.recv_ack_needed = decoded.acks.return_needed;
        self.stats.packets_received += 1;
        self.mark_received(now);

        for (out_seq, ok) in verdicts {
            if let Err(reason) = self.ack_packet(now, out_seq, ok) {
                warn!("{}", reason);
                self.begin_disconnect(now, reason);
                return;
            }
        }

        for (kind, message) in decoded.messages {
            sink.dispatch(seq, kind, message);
        }
    }

    /// Processes parked packets that became next in line, or that waited
    /// longer than the reorder timeout
    fn drain_reorder_queue<S: MessageSink>(&mut self, now: Instant, sink: &mut S) {
        loop {
            let Some((seq, _)) = self.reorder.front() else {
                break;
            };
            let ready = *seq <= self.input_seq;
            let timed_out = self.reorder.iter().any(|(_, queued)| {
                now.saturating_duration_since(queued.arrived) >= self.config.reorder_timeout
            });
            if !ready && !timed_out {
                break;
            }
            let Some((_, queued)) = self.reorder.pop_front() else {
                break;
            };
            if ready {
                self.stats.reorder_ready += 1;
            } else {
                self.stats.reorder_timeouts += 1;
            }
            if self.state != ConnectionState::Connected {
                self.reorder.clear();
                break;
            }
            if let Err(error) = self.receive_sequenced(now, &queued.bytes, queued.tag, false, sink)
            {
                self.drop_packet(&error);
            }
        }
    }
}

type DecodedBody<M> = (AckBlock, bool, Vec<(MessageKind, Option<M>)>);

/// Decrypts, verifies and decodes a sequenced packet with `state`. Heartbeats
/// appear as messages without a body.
fn decode_body<S: MessageSink>(
    kinds: &MessageKinds,
    state: &mut BigState,
    sender: HostType,
    seq: SequenceNumber,
    packet: &[u8],
    sink: &mut S,
) -> Result<DecodedBody<S::Message>, PacketError> {
    let mut plain = packet.to_vec();
    state
        .decrypt(sender, seq, &mut plain)
        .map_err(|_| PacketError::DecryptFailed { seq })?;
    if plain.len() < MIN_SEQUENCED_PACKET_BYTES {
        return Err(PacketError::TooShort {
            length: plain.len(),
            required: MIN_SEQUENCED_PACKET_BYTES,
        });
    }

    let hashed = plain.len() - TRAILER_BYTES;
    let key = plain[hashed];
    if quick_hash(&plain[..hashed]) != plain[hashed + 1] ^ key {
        return Err(PacketError::HashMismatch { seq });
    }

    let malformed = |error: SerdeErr| PacketError::Malformed {
        seq,
        reason: error.to_string(),
    };
    let mut reader = BitReader::new(&plain[SEQUENCE_HEADER_BYTES..hashed]);
    let acks = AckBlock::read(&mut reader).map_err(malformed)?;
    let signing = reader.read_bits(8).map_err(malformed)? as u8;
    if signing != key {
        return Err(PacketError::HashMismatch { seq });
    }
    let _sent_ms = reader.read_bits(32).map_err(malformed)?;

    let id_bits = kinds.id_bits();
    let mut messages = Vec::new();
    loop {
        let id = state.read_id(&mut reader, id_bits).map_err(malformed)?;
        // SECURITY: ids come off the wire
        let kind = kinds.kind_for(id).map_err(|error| PacketError::Malformed {
            seq,
            reason: error.to_string(),
        })?;
        let flags = kinds.flags(id);
        if kind == MessageKind::END_OF_STREAM {
            state.after_message(id, flags);
            break;
        }
        if messages.len() >= MAX_MESSAGES_PER_PACKET as usize {
            return Err(PacketError::TooManyMessages {
                seq,
                limit: MAX_MESSAGES_PER_PACKET,
            });
        }
        let message = if kind == MessageKind::HEARTBEAT {
            None
        } else {
            Some(sink.decode(kind, &mut reader).map_err(malformed)?)
        };
        state.after_message(id, flags);
        messages.push((kind, message));
    }

    let urgent = reader.read_bit().map_err(malformed)?;
    let check = reader.read_bits(8).map_err(malformed)? as u8;
    if check != key ^ 0xff {
        return Err(PacketError::HashMismatch { seq });
    }
    Ok((acks, urgent, messages))
}

/// Cheap integrity check over the clear packet bytes
pub fn quick_hash(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |hash, byte| hash.wrapping_mul(5).wrapping_add(*byte))
}
