use std::cmp::Ordering;

use crate::queue::accounting::AccountingGroupPolicy;

/// Coarse urgency of a queued message, most urgent first
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LatencyClass {
    /// Past its discard deadline; unreliable messages are dropped
    Discardable,
    /// Past its maximum latency
    Expired,
    /// Will be past its maximum latency by the next send opportunity
    NearlyExpired,
    DontCare,
    /// Its group is over budget this frame
    DontBother,
    /// Blocked on a dependency or a gate
    CantSend,
}

pub const LATENCY_CLASS_COUNT: usize = 6;

/// Number of sorter buckets: each class, split by the bandwidth flag
pub const LATENCY_BUCKET_COUNT: usize = LATENCY_CLASS_COUNT * 2;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OrderingInfo {
    pub latency_class: LatencyClass,
    pub bandwidth_exceeded: bool,
    pub scheduling_order: f32,
}

impl Default for OrderingInfo {
    fn default() -> Self {
        Self {
            latency_class: LatencyClass::DontCare,
            bandwidth_exceeded: false,
            scheduling_order: 0.0,
        }
    }
}

impl OrderingInfo {
    pub fn latency_bucket(&self) -> usize {
        let exceeded =
            self.latency_class == LatencyClass::DontCare && self.bandwidth_exceeded;
        self.latency_class as usize * 2 + usize::from(exceeded)
    }

    /// `Less` means `self` is scheduled first: lower latency class, then
    /// within DontCare groups under budget, then higher scheduling order
    pub fn compare(&self, other: &OrderingInfo) -> Ordering {
        self.latency_class
            .cmp(&other.latency_class)
            .then_with(|| {
                if self.latency_class == LatencyClass::DontCare {
                    self.bandwidth_exceeded.cmp(&other.bandwidth_exceeded)
                } else {
                    Ordering::Equal
                }
            })
            .then_with(|| {
                other
                    .scheduling_order
                    .partial_cmp(&self.scheduling_order)
                    .unwrap_or(Ordering::Equal)
            })
    }

    /// Integer key the sorter buckets scheduling orders by
    pub fn order_key(&self) -> u32 {
        (10000.0 * self.scheduling_order + 0.5) as u32
    }
}

/// Classifies a message given how late it will be if sent now and at the next opportunity
pub fn latency_class_for(
    policy: Option<&AccountingGroupPolicy>,
    expected_time_now: f32,
    expected_time_next: f32,
) -> LatencyClass {
    let Some(policy) = policy else {
        return LatencyClass::DontCare;
    };
    if policy.discard_latency > 0.0 && expected_time_now > policy.discard_latency {
        return LatencyClass::Discardable;
    }
    if policy.max_latency < 0.0 {
        return LatencyClass::DontCare;
    }
    if expected_time_now > policy.max_latency {
        return LatencyClass::Expired;
    }
    if expected_time_next > policy.max_latency {
        return LatencyClass::NearlyExpired;
    }
    LatencyClass::DontCare
}

/// Amount a message's scheduling order grows by in one frame. Low priorities
/// advance erratically, high priorities almost deterministically.
/// `random` is uniform in `[0, 1)`.
pub fn scheduling_weight(priority: f32, random: f32) -> f32 {
    let randomness = 1.0 / (priority * priority + 1.0);
    let weight = (1.0 - randomness + random * randomness) / (1.0 - randomness * 0.5);
    weight * 2.0f32.powf(priority) / 65535.0
}
