/// Writes values into a byte buffer one bit at a time, most significant bit
/// first, so that multi-bit fields land in the documented big-endian layouts.
pub struct BitWriter {
    bytes: Vec<u8>,
    current: u8,
    filled: u8,
}

impl BitWriter {
    pub fn new() -> Self {
        Self {
            bytes: Vec::new(),
            current: 0,
            filled: 0,
        }
    }

    pub fn write_bit(&mut self, bit: bool) {
        self.current <<= 1;
        if bit {
            self.current |= 1;
        }
        self.filled += 1;
        if self.filled == 8 {
            self.bytes.push(self.current);
            self.current = 0;
            self.filled = 0;
        }
    }

    /// Writes the low `bits` bits of `value`, most significant first.
    pub fn write_bits(&mut self, value: u32, bits: u32) {
        debug_assert!(bits <= 32);
        for shift in (0..bits).rev() {
            self.write_bit((value >> shift) & 1 != 0);
        }
    }

    /// Quantizes `value` over `[min, max]` to `bits` bits and writes it.
    /// Out-of-range values clamp to the range ends, never wrap.
    pub fn write_quantized_f32(&mut self, value: f32, min: f32, max: f32, bits: u32) {
        self.write_bits(quantize(value, min, max, bits), bits);
    }

    pub fn bit_count(&self) -> u32 {
        self.bytes.len() as u32 * 8 + self.filled as u32
    }

    /// Flushes, padding the final partial byte with zero bits.
    pub fn to_bytes(mut self) -> Vec<u8> {
        if self.filled > 0 {
            self.current <<= 8 - self.filled;
            self.bytes.push(self.current);
        }
        self.bytes
    }
}

impl Default for BitWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Uniform linear map from `[min, max]` to `[0, 2^bits - 1]`, rounding to
/// nearest. Inputs outside the range are clamped before mapping.
pub fn quantize(value: f32, min: f32, max: f32, bits: u32) -> u32 {
    let clamped = value.clamp(min, max);
    let normalized = if max > min {
        (clamped - min) / (max - min)
    } else {
        0.0
    };
    let max_int = (1u32 << bits) - 1;
    (normalized * max_int as f32).round() as u32
}

/// Inverse of [`quantize`]: maps a `bits`-wide integer code back into
/// `[min, max]`.
pub fn dequantize(code: u32, min: f32, max: f32, bits: u32) -> f32 {
    let max_int = (1u32 << bits) - 1;
    min + (max - min) * (code as f32 / max_int as f32)
}

#[cfg(test)]
mod tests {
    use super::{dequantize, quantize, BitWriter};

    #[test]
    fn msb_first_layout() {
        let mut writer = BitWriter::new();
        writer.write_bits(0b101, 3);
        writer.write_bits(0b11111, 5);
        let bytes = writer.to_bytes();
        assert_eq!(bytes, vec![0b1011_1111]);
    }

    #[test]
    fn partial_byte_zero_padded() {
        let mut writer = BitWriter::new();
        writer.write_bits(0b11, 2);
        assert_eq!(writer.to_bytes(), vec![0b1100_0000]);
    }

    #[test]
    fn quantize_clamps_out_of_range() {
        assert_eq!(quantize(-5.0, -1.0, 1.0, 10), 0);
        assert_eq!(quantize(5.0, -1.0, 1.0, 10), 1023);
    }

    #[test]
    fn quantize_round_trip_within_step() {
        let step = 2.0 / 1023.0;
        for i in 0..100 {
            let v = -1.0 + (i as f32) * 0.02;
            let q = quantize(v, -1.0, 1.0, 10);
            let out = dequantize(q, -1.0, 1.0, 10);
            assert!((v - out).abs() <= step, "{v} -> {out}");
        }
    }
}
