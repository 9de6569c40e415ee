use std::fmt;

pub type SequenceNumber = u32;
pub type MessageId = u32;
pub type SlotIndex = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HostType {
    Server,
    Client,
}

impl HostType {
    pub fn invert(self) -> Self {
        match self {
            HostType::Server => HostType::Client,
            HostType::Client => HostType::Server,
        }
    }

    pub(crate) fn to_byte(self) -> u8 {
        match self {
            HostType::Server => 0x53,
            HostType::Client => 0x43,
        }
    }
}

/// Delivery guarantees requested by a sendable
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Reliability {
    Unreliable,
    UnreliableOrdered,
    ReliableOrdered,
    ReliableUnordered,
}

impl Reliability {
    pub fn is_reliable(self) -> bool {
        matches!(self, Reliability::ReliableOrdered | Reliability::ReliableUnordered)
    }

    pub fn is_ordered(self) -> bool {
        matches!(self, Reliability::ReliableOrdered | Reliability::UnreliableOrdered)
    }
}

/// A four character key naming an accounting group or a priority pulse.
/// The zero key means "no group".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct GroupKey(u32);

impl GroupKey {
    pub const NONE: GroupKey = GroupKey(0);

    pub const fn new(key: &[u8; 4]) -> Self {
        Self(u32::from_be_bytes(*key))
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.to_be_bytes() {
            let c = if byte.is_ascii_graphic() { byte as char } else { '?' };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl fmt::Debug for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupKey({})", self)
    }
}

/// Identifies the logical object a message updates, so updates to the same
/// object can be scheduled together
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn dot(&self, other: &Vec3) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn length(&self) -> f32 {
        self.dot(self).sqrt()
    }

    pub fn distance(&self, other: &Vec3) -> f32 {
        self.sub(other).length()
    }

    pub fn sub(&self, other: &Vec3) -> Vec3 {
        Vec3::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }

    /// Unit vector in the same direction, or `fallback` for a zero length vector
    pub fn normalized_or(&self, fallback: Vec3) -> Vec3 {
        let length = self.length();
        if length <= f32::EPSILON {
            return fallback;
        }
        Vec3::new(self.x / length, self.y / length, self.z / length)
    }
}
