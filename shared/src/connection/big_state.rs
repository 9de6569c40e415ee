use std::{collections::HashMap, sync::Arc};

use skein_serde::{BitReader, BitWrite, SerdeErr};

use crate::{
    connection::{
        cipher::{packet_nonce, PacketCipher},
        error::CipherError,
    },
    constants::SEQUENCE_HEADER_BYTES,
    messages::message_kinds::MessageFlags,
    types::{HostType, MessageId, SequenceNumber},
};

/// Tier widths of the normal table: three frequent ids, then the escape
const NORMAL_TIER_BITS: &[u8] = &[2];
/// Tier widths of the object update table
const OBJECT_TIER_BITS: &[u8] = &[1, 2, 5];
/// Counts are halved once any of them reaches this value
const ADAPTATION_LIMIT: u32 = 1024;

/// Which id table codes the next message
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdTable {
    Normal,
    ObjectUpdate,
}

/// Frequency ranked message ids. The most frequent ids get the short codes
/// of the first tiers; everything else is escaped and written in full.
#[derive(Debug, PartialEq, Eq)]
struct TierTable {
    tier_bits: &'static [u8],
    counts: HashMap<MessageId, u32>,
    ranked: Vec<MessageId>,
}

impl TierTable {
    fn new(tier_bits: &'static [u8]) -> Self {
        Self {
            tier_bits,
            counts: HashMap::new(),
            ranked: Vec::new(),
        }
    }

    fn capacity(&self) -> usize {
        self.tier_bits
            .iter()
            .map(|bits| (1usize << bits) - 1)
            .sum()
    }

    fn worst_case_bits(&self, id_bits: u8) -> u32 {
        self.tier_bits.iter().map(|bits| u32::from(*bits)).sum::<u32>() + u32::from(id_bits)
    }

    fn encode(&self, writer: &mut dyn BitWrite, id: MessageId, id_bits: u8) {
        let mut offset = 0;
        for bits in self.tier_bits {
            let escape = (1usize << bits) - 1;
            let end = (offset + escape).min(self.ranked.len());
            let start = offset.min(end);
            if let Some(position) = self.ranked[start..end].iter().position(|x| *x == id) {
                writer.write_bits(position as u64, *bits);
                return;
            }
            writer.write_bits(escape as u64, *bits);
            offset += escape;
        }
        writer.write_bits(u64::from(id), id_bits);
    }

    fn decode(&self, reader: &mut BitReader, id_bits: u8) -> Result<MessageId, SerdeErr> {
        let mut offset = 0;
        for bits in self.tier_bits {
            let escape = (1usize << bits) - 1;
            let value = reader.read_bits(*bits)? as usize;
            if value < escape {
                // SECURITY: a tier slot the sender could not have used
                return self
                    .ranked
                    .get(offset + value)
                    .copied()
                    .ok_or(SerdeErr::InvalidValue {
                        value: value as u64,
                        type_name: "message id tier",
                    });
            }
            offset += escape;
        }
        Ok(reader.read_bits(id_bits)? as MessageId)
    }

    fn record(&mut self, id: MessageId) {
        let count = self.counts.entry(id).or_insert(0);
        *count += 1;
        if *count >= ADAPTATION_LIMIT {
            self.counts.retain(|_, count| {
                *count /= 2;
                *count > 0
            });
        }
        self.rerank();
    }

    fn rerank(&mut self) {
        let mut ids: Vec<(MessageId, u32)> =
            self.counts.iter().map(|(id, count)| (*id, *count)).collect();
        ids.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ids.truncate(self.capacity());
        self.ranked.clear();
        self.ranked.extend(ids.into_iter().map(|(id, _)| id));
    }
}

impl Clone for TierTable {
    fn clone(&self) -> Self {
        Self {
            tier_bits: self.tier_bits,
            counts: self.counts.clone(),
            ranked: self.ranked.clone(),
        }
    }

    fn clone_from(&mut self, source: &Self) {
        self.tier_bits = source.tier_bits;
        self.counts.clone_from(&source.counts);
        self.ranked.clone_from(&source.ranked);
    }
}

/// Coding and encryption context of one sequence slot.
///
/// Every packet is coded against a snapshot cloned from the basis slot, so the
/// receiver can decode it with its own copy of the same snapshot. Both sides
/// update the tables identically as messages are written and read.
pub struct BigState {
    normal: TierTable,
    object: TierTable,
    table: IdTable,
    cipher: Option<Arc<dyn PacketCipher>>,
}

impl BigState {
    pub fn new(cipher: Option<Arc<dyn PacketCipher>>) -> Self {
        Self {
            normal: TierTable::new(NORMAL_TIER_BITS),
            object: TierTable::new(OBJECT_TIER_BITS),
            table: IdTable::Normal,
            cipher,
        }
    }

    pub fn table(&self) -> IdTable {
        self.table
    }

    /// Every packet starts in the normal table
    pub fn begin_packet(&mut self) {
        self.table = IdTable::Normal;
    }

    /// Largest number of bits a single id can take
    pub fn worst_case_id_bits(&self, id_bits: u8) -> u32 {
        self.normal
            .worst_case_bits(id_bits)
            .max(self.object.worst_case_bits(id_bits))
    }

    pub fn write_id(&self, writer: &mut dyn BitWrite, id: MessageId, id_bits: u8) {
        self.current().encode(writer, id, id_bits);
    }

    pub fn read_id(&self, reader: &mut BitReader, id_bits: u8) -> Result<MessageId, SerdeErr> {
        self.current().decode(reader, id_bits)
    }

    /// Adapts the current table to a message that was just coded, then
    /// switches tables if the message asks for it
    pub fn after_message(&mut self, id: MessageId, flags: MessageFlags) {
        match self.table {
            IdTable::Normal => self.normal.record(id),
            IdTable::ObjectUpdate => self.object.record(id),
        }
        if flags.contains(MessageFlags::END_OBJECT_UPDATE) {
            self.table = IdTable::Normal;
        } else if flags.contains(MessageFlags::BEGIN_OBJECT_UPDATE) {
            self.table = IdTable::ObjectUpdate;
        }
    }

    fn current(&self) -> &TierTable {
        match self.table {
            IdTable::Normal => &self.normal,
            IdTable::ObjectUpdate => &self.object,
        }
    }

    /// Bytes the cipher appends to a packet
    pub fn overhead(&self) -> usize {
        self.cipher.as_ref().map_or(0, |cipher| cipher.overhead())
    }

    /// Encrypts everything after the sequence header, which stays in clear
    /// and is authenticated instead
    pub fn encrypt(
        &self,
        sender: HostType,
        seq: SequenceNumber,
        packet: &mut Vec<u8>,
    ) -> Result<(), CipherError> {
        let Some(cipher) = &self.cipher else {
            return Ok(());
        };
        let mut body = packet.split_off(SEQUENCE_HEADER_BYTES.min(packet.len()));
        cipher.encrypt(&packet_nonce(sender, seq), packet, &mut body)?;
        packet.extend_from_slice(&body);
        Ok(())
    }

    pub fn decrypt(
        &self,
        sender: HostType,
        seq: SequenceNumber,
        packet: &mut Vec<u8>,
    ) -> Result<(), CipherError> {
        let Some(cipher) = &self.cipher else {
            return Ok(());
        };
        let mut body = packet.split_off(SEQUENCE_HEADER_BYTES.min(packet.len()));
        cipher.decrypt(&packet_nonce(sender, seq), packet, &mut body)?;
        packet.extend_from_slice(&body);
        Ok(())
    }

    /// Forgets ids `newest` no longer counts, so a recycled state does not
    /// keep growing
    pub fn simplify(&mut self, newest: &BigState) {
        self.normal
            .counts
            .retain(|id, _| newest.normal.counts.contains_key(id));
        self.object
            .counts
            .retain(|id, _| newest.object.counts.contains_key(id));
        for table in [&mut self.normal, &mut self.object] {
            if table.counts.capacity() > 2 * table.counts.len() + 16 {
                table.counts.shrink_to_fit();
            }
            table.rerank();
        }
    }
}

impl Clone for BigState {
    fn clone(&self) -> Self {
        Self {
            normal: self.normal.clone(),
            object: self.object.clone(),
            table: self.table,
            cipher: self.cipher.clone(),
        }
    }

    fn clone_from(&mut self, source: &Self) {
        self.normal.clone_from(&source.normal);
        self.object.clone_from(&source.object);
        self.table = source.table;
        self.cipher.clone_from(&source.cipher);
    }
}
