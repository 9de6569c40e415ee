use crate::{bit_reader::BitReader, bit_writer::BitWrite, error::SerdeErr, serde::Serde};

pub type UnsignedInteger<const BITS: u8> = SerdeInteger<false, BITS>;
pub type UnsignedVariableInteger<const BITS: u8> = SerdeInteger<true, BITS>;

/// An unsigned integer written with a fixed number of bits, or, when
/// `VARIABLE`, in `BITS` sized groups each preceded by a "proceed" bit.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct SerdeInteger<const VARIABLE: bool, const BITS: u8> {
    value: u64,
}

impl<const VARIABLE: bool, const BITS: u8> SerdeInteger<VARIABLE, BITS> {
    /// Creates the integer, returning `None` if a fixed width cannot hold `value`
    pub fn try_new(value: u64) -> Option<Self> {
        if BITS == 0 || BITS > 63 {
            return None;
        }
        if !VARIABLE && value >= (1u64 << BITS) {
            return None;
        }
        Some(Self { value })
    }

    /// Creates the integer
    ///
    /// # Panics
    /// Panics if a fixed width integer cannot hold `value`
    pub fn new<T: Into<u64>>(value: T) -> Self {
        let value = value.into();
        match Self::try_new(value) {
            Some(integer) => integer,
            None => panic!("with {} bits, can't encode number {}", BITS, value),
        }
    }

    pub fn get(&self) -> u64 {
        self.value
    }
}

impl<const VARIABLE: bool, const BITS: u8> Serde for SerdeInteger<VARIABLE, BITS> {
    fn ser(&self, writer: &mut dyn BitWrite) {
        if !VARIABLE {
            writer.write_bits(self.value, BITS);
            return;
        }

        let mut value = self.value;
        loop {
            let proceed = value >= (1u64 << BITS);
            writer.write_bit(proceed);
            writer.write_bits(value, BITS);
            value >>= BITS;
            if !proceed {
                return;
            }
        }
    }

    fn de(reader: &mut BitReader) -> Result<Self, SerdeErr> {
        if !VARIABLE {
            return Ok(Self {
                value: reader.read_bits(BITS)?,
            });
        }

        let mut value: u64 = 0;
        let mut shift: u32 = 0;
        loop {
            let proceed = reader.read_bit()?;
            let group = reader.read_bits(BITS)?;
            // SECURITY: an endless run of proceed bits must not overflow the accumulator
            if shift >= 64 {
                return Err(SerdeErr::InvalidValue {
                    value: group,
                    type_name: "UnsignedVariableInteger",
                });
            }
            value |= group << shift;
            shift += u32::from(BITS);
            if !proceed {
                return Ok(Self { value });
            }
        }
    }

    fn bit_length(&self) -> u32 {
        if !VARIABLE {
            return u32::from(BITS);
        }
        let mut output = 0;
        let mut value = self.value;
        loop {
            output += 1 + u32::from(BITS);
            if value < (1u64 << BITS) {
                return output;
            }
            value >>= BITS;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{BitReader, BitWriter, Serde, UnsignedInteger, UnsignedVariableInteger};

    #[test]
    fn fixed_width_rejects_overflow() {
        assert!(UnsignedInteger::<4>::try_new(15).is_some());
        assert!(UnsignedInteger::<4>::try_new(16).is_none());
    }

    #[test]
    #[should_panic(expected = "can't encode number")]
    fn fixed_width_new_panics_on_overflow() {
        let _ = UnsignedInteger::<2>::new(4u8);
    }

    #[test]
    fn read_write_unsigned() {
        let mut writer = BitWriter::new();

        let in_1 = UnsignedInteger::<7>::new(123u8);
        let in_2 = UnsignedInteger::<20>::new(535221u32);
        let in_3 = UnsignedInteger::<2>::new(3u8);

        in_1.ser(&mut writer);
        in_2.ser(&mut writer);
        in_3.ser(&mut writer);

        let buffer = writer.to_bytes();
        let mut reader = BitReader::new(&buffer);

        assert_eq!(in_1, Serde::de(&mut reader).unwrap());
        assert_eq!(in_2, Serde::de(&mut reader).unwrap());
        assert_eq!(in_3, Serde::de(&mut reader).unwrap());
    }

    #[test]
    fn read_write_unsigned_variable() {
        let mut writer = BitWriter::new();

        let in_1 = UnsignedVariableInteger::<3>::new(23u8);
        let in_2 = UnsignedVariableInteger::<5>::new(153u8);
        let in_3 = UnsignedVariableInteger::<2>::new(3u8);

        in_1.ser(&mut writer);
        in_2.ser(&mut writer);
        in_3.ser(&mut writer);

        assert_eq!(
            writer.bits_written(),
            in_1.bit_length() + in_2.bit_length() + in_3.bit_length()
        );

        let buffer = writer.to_bytes();
        let mut reader = BitReader::new(&buffer);

        assert_eq!(in_1, Serde::de(&mut reader).unwrap());
        assert_eq!(in_2, Serde::de(&mut reader).unwrap());
        assert_eq!(in_3, Serde::de(&mut reader).unwrap());
    }
}
