use crate::serde::bit_writer::dequantize;
use crate::serde::error::SerdeErr;

/// Reads bits back out of a byte buffer in the same most-significant-first
/// order that [`BitWriter`](crate::serde::BitWriter) produced them.
pub struct BitReader<'a> {
    buffer: &'a [u8],
    byte_index: usize,
    bit_index: u8,
}

impl<'a> BitReader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            byte_index: 0,
            bit_index: 0,
        }
    }

    pub fn read_bit(&mut self) -> Result<bool, SerdeErr> {
        let Some(byte) = self.buffer.get(self.byte_index) else {
            return Err(SerdeErr::Exhausted { needed: 1 });
        };
        let bit = (byte >> (7 - self.bit_index)) & 1 != 0;
        self.bit_index += 1;
        if self.bit_index == 8 {
            self.bit_index = 0;
            self.byte_index += 1;
        }
        Ok(bit)
    }

    pub fn read_bits(&mut self, bits: u32) -> Result<u32, SerdeErr> {
        debug_assert!(bits <= 32);
        let mut output = 0u32;
        for _ in 0..bits {
            output <<= 1;
            if self.read_bit()? {
                output |= 1;
            }
        }
        Ok(output)
    }

    pub fn read_quantized_f32(
        &mut self,
        min: f32,
        max: f32,
        bits: u32,
    ) -> Result<f32, SerdeErr> {
        let code = self.read_bits(bits)?;
        Ok(dequantize(code, min, max, bits))
    }

    pub fn bits_remaining(&self) -> u32 {
        let consumed = self.byte_index as u32 * 8 + self.bit_index as u32;
        self.buffer.len() as u32 * 8 - consumed
    }
}

#[cfg(test)]
mod tests {
    use super::BitReader;
    use crate::serde::bit_writer::BitWriter;

    #[test]
    fn read_write_mixed_widths() {
        let mut writer = BitWriter::new();
        writer.write_bits(123, 7);
        writer.write_bits(535221, 20);
        writer.write_bits(3, 2);
        let buffer = writer.to_bytes();

        let mut reader = BitReader::new(&buffer);
        assert_eq!(reader.read_bits(7).unwrap(), 123);
        assert_eq!(reader.read_bits(20).unwrap(), 535221);
        assert_eq!(reader.read_bits(2).unwrap(), 3);
    }

    #[test]
    fn exhausted_read_errors() {
        let buffer = [0u8];
        let mut reader = BitReader::new(&buffer);
        assert!(reader.read_bits(8).is_ok());
        assert!(reader.read_bit().is_err());
    }

    #[test]
    fn quantized_float_round_trip() {
        let mut writer = BitWriter::new();
        writer.write_quantized_f32(42.5, -100.0, 100.0, 16);
        let buffer = writer.to_bytes();
        let mut reader = BitReader::new(&buffer);
        let out = reader.read_quantized_f32(-100.0, 100.0, 16).unwrap();
        assert!((out - 42.5).abs() < 0.01);
    }
}
