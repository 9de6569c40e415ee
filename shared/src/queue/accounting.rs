use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use crate::types::GroupKey;

/// Window over which recent sends count towards bandwidth usage
pub const BANDWIDTH_WINDOW: Duration = Duration::from_secs(1);

const RECENT_SENDS_CAPACITY: usize = 1024;

/// Fraction of the budget a group may use inside a single frame
const FRAME_BANDWIDTH_SHARE: f32 = 0.15;

/// Usage above which random early detection starts rejecting sends
const EARLY_DROP_THRESHOLD: f32 = 0.8;

/// Priority bump by distance from the witness: `a * exp(-b * d^2) + c`
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct DistanceScaler {
    a: f32,
    b: f32,
    c: f32,
}

impl DistanceScaler {
    /// A curve worth `close` at the witness and falling towards `-far`,
    /// reaching zero at `normal_distance`. Returns `None` for negative bumps.
    pub fn from_curve(normal_distance: f32, close: f32, far: f32) -> Option<Self> {
        if close < 0.0 || far < 0.0 || normal_distance <= 0.0 {
            return None;
        }
        let min_bump = -far.max(0.001);
        let max_bump = close.max(0.001);
        let a = max_bump - min_bump;
        Some(Self {
            a,
            b: -(-min_bump / a).ln() / (normal_distance * normal_distance),
            c: min_bump,
        })
    }

    pub fn bump(&self, distance: f32) -> f32 {
        self.a * (-self.b * distance * distance).exp() + self.c
    }
}

/// Priority bump by how directly the witness faces the message's subject:
/// `a * (1 - (0.5 - 0.5 * clamp(cos, 0, 1))^p) + b`
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct DirectionScaler {
    a: f32,
    b: f32,
    power: f32,
}

impl DirectionScaler {
    /// `field_of_interest` is in degrees and must exceed 10. The bump is
    /// `front` straight ahead, stays close to it inside the field of interest
    /// and falls off towards `-back` beyond it.
    pub fn from_curve(field_of_interest: f32, front: f32, back: f32) -> Option<Self> {
        if field_of_interest <= 10.0 || front < 0.0 || back < 0.0 {
            return None;
        }
        if front == 0.0 && back == 0.0 {
            return Some(Self::default());
        }
        let half_angle = (field_of_interest / 2.0).to_radians();
        Some(Self {
            a: front + back,
            b: -back,
            power: (1.0f32 - 0.98).ln() / (0.5 - 0.5 * half_angle.cos()).ln(),
        })
    }

    pub fn bump(&self, cos_angle: f32) -> f32 {
        let scale = 1.0 - (0.5 - 0.5 * cos_angle.clamp(0.0, 1.0)).powf(self.power);
        self.a * scale + self.b
    }
}

/// Priority bump decaying after a pulse: `a * exp(-ln2 / half_life * t)`
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct PulseScaler {
    a: f32,
    b: f32,
}

impl PulseScaler {
    /// Returns `None` unless `half_life` exceeds 10ms
    pub fn new(bump: f32, half_life: f32) -> Option<Self> {
        if half_life <= 0.01 {
            return None;
        }
        Some(Self {
            a: bump,
            b: std::f32::consts::LN_2 / half_life,
        })
    }

    pub fn bump(&self, seconds_since_pulse: f32) -> f32 {
        self.a * (-self.b * seconds_since_pulse).exp()
    }
}

/// Bandwidth, priority and latency policy for one accounting group
#[derive(Clone, Debug, PartialEq)]
pub struct AccountingGroupPolicy {
    /// Base scheduling priority, 0 to 16
    pub priority: f32,
    /// Bytes per second; zero or negative means unlimited
    pub max_bandwidth: f32,
    /// Seconds until a message is late; negative disables deadlines
    pub max_latency: f32,
    /// Seconds after which an unreliable message may be dropped; zero or negative disables
    pub discard_latency: f32,
    pub distance: DistanceScaler,
    pub direction: DirectionScaler,
    /// Pulse curves, kept sorted by key
    pub pulses: Vec<(GroupKey, PulseScaler)>,
    /// Messages beyond their draw distance drop to the lowest priority
    pub drawn: bool,
}

impl Default for AccountingGroupPolicy {
    fn default() -> Self {
        Self {
            priority: 0.0,
            max_bandwidth: -1.0,
            max_latency: -1.0,
            discard_latency: -1.0,
            distance: DistanceScaler::default(),
            direction: DirectionScaler::default(),
            pulses: Vec::new(),
            drawn: false,
        }
    }
}

impl AccountingGroupPolicy {
    pub fn add_pulse(&mut self, key: GroupKey, scaler: PulseScaler) {
        let position = self.pulses.partition_point(|(existing, _)| *existing < key);
        self.pulses.insert(position, (key, scaler));
    }
}

/// Live state of an accounting group
pub struct AccountingGroup {
    pub id: GroupKey,
    pub policy: AccountingGroupPolicy,
    recent_sends: VecDeque<(Instant, f32)>,
    bandwidth_this_frame: f32,
    total_bytes_sent: u64,
}

impl AccountingGroup {
    pub fn new(id: GroupKey, policy: AccountingGroupPolicy) -> Self {
        Self {
            id,
            policy,
            recent_sends: VecDeque::new(),
            bandwidth_this_frame: 0.0,
            total_bytes_sent: 0,
        }
    }

    pub fn begin_frame(&mut self) {
        self.bandwidth_this_frame = 0.0;
    }

    pub fn push_send(&mut self, now: Instant, bytes: usize) {
        while let Some((time, _)) = self.recent_sends.front() {
            if now.saturating_duration_since(*time) <= BANDWIDTH_WINDOW
                && self.recent_sends.len() < RECENT_SENDS_CAPACITY
            {
                break;
            }
            self.recent_sends.pop_front();
        }
        self.recent_sends.push_back((now, bytes as f32));
        self.bandwidth_this_frame += bytes as f32;
        self.total_bytes_sent += bytes as u64;
    }

    /// Bytes sent within the last bandwidth window
    pub fn bandwidth_used(&self, now: Instant) -> f32 {
        self.recent_sends
            .iter()
            .filter(|(time, _)| now.saturating_duration_since(*time) <= BANDWIDTH_WINDOW)
            .map(|(_, bytes)| *bytes)
            .sum()
    }

    pub fn sends_in_window(&self, now: Instant) -> usize {
        self.recent_sends
            .iter()
            .filter(|(time, _)| now.saturating_duration_since(*time) <= BANDWIDTH_WINDOW)
            .count()
    }

    /// Whether the group is over budget. Without random early detection this
    /// is a plain threshold on the last second's usage. With it, a single
    /// frame may not use more than 15% of the budget, and beyond 80% usage
    /// sends are rejected with a probability rising linearly to certainty.
    pub fn bandwidth_exceeded(
        &self,
        now: Instant,
        random_early_drop: bool,
        rng: &fastrand::Rng,
    ) -> bool {
        let max_bandwidth = self.policy.max_bandwidth;
        if max_bandwidth <= 0.0 {
            return false;
        }
        let usage = self.bandwidth_used(now) / max_bandwidth;
        if !random_early_drop {
            return usage > 1.0;
        }
        if self.bandwidth_this_frame > FRAME_BANDWIDTH_SHARE * max_bandwidth {
            return true;
        }
        if usage >= 1.0 {
            return true;
        }
        if usage > EARLY_DROP_THRESHOLD {
            let drop_chance = (usage - EARLY_DROP_THRESHOLD) / (1.0 - EARLY_DROP_THRESHOLD);
            return rng.f32() < drop_chance;
        }
        false
    }

    pub fn total_bytes_sent(&self) -> u64 {
        self.total_bytes_sent
    }

    pub fn stats(&self, now: Instant) -> GroupStats {
        GroupStats {
            id: self.id,
            sends: self.sends_in_window(now),
            bandwidth_used: self.bandwidth_used(now),
            total_bytes_sent: self.total_bytes_sent,
            priority: self.policy.priority,
            max_latency: self.policy.max_latency,
            discard_latency: self.policy.discard_latency,
        }
    }
}

/// Snapshot of one accounting group's usage
#[derive(Clone, Debug, PartialEq)]
pub struct GroupStats {
    pub id: GroupKey,
    pub sends: usize,
    pub bandwidth_used: f32,
    pub total_bytes_sent: u64,
    pub priority: f32,
    pub max_latency: f32,
    pub discard_latency: f32,
}
