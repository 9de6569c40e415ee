use crate::error::SerdeErr;

pub struct BitReader<'b> {
    buffer: &'b [u8],
    position: u32,
}

impl<'b> BitReader<'b> {
    pub fn new(buffer: &'b [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    pub fn bits_read(&self) -> u32 {
        self.position
    }

    pub fn bits_remaining(&self) -> u32 {
        (self.buffer.len() as u32 * 8).saturating_sub(self.position)
    }

    pub fn read_bit(&mut self) -> Result<bool, SerdeErr> {
        if self.bits_remaining() == 0 {
            return Err(SerdeErr::Underflow {
                requested: 1,
                remaining: 0,
            });
        }
        let byte = self.buffer[(self.position / 8) as usize];
        let bit = byte & (1 << (self.position % 8)) != 0;
        self.position += 1;
        Ok(bit)
    }

    /// Reads `bits` bits, least significant first
    pub fn read_bits(&mut self, bits: u8) -> Result<u64, SerdeErr> {
        debug_assert!(bits <= 64);
        let remaining = self.bits_remaining();
        if u32::from(bits) > remaining {
            return Err(SerdeErr::Underflow {
                requested: u32::from(bits),
                remaining,
            });
        }
        let mut output: u64 = 0;
        for index in 0..bits {
            if self.read_bit()? {
                output |= 1 << index;
            }
        }
        Ok(output)
    }

    pub fn read_byte(&mut self) -> Result<u8, SerdeErr> {
        Ok(self.read_bits(8)? as u8)
    }
}
