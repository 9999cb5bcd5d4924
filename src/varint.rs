use derive_more::{Deref, From};

/// Largest number of bytes a varint may occupy.
pub const MAX_VARINT_LENGTH: usize = 9;

/// Variable length integer, as used by the record format and the material formats.
///
/// The first eight bytes each carry seven bits with the high bit flagging continuation. A ninth
/// byte, when present, carries a full eight bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deref, From)]
pub struct VarInt(u64);

impl VarInt {
    /// Decode a varint from the start of `buf`, producing the value and the number of bytes it
    /// occupied. Will be [`None`] if the buffer ends before the varint terminates.
    pub fn read(buf: &[u8]) -> Option<(Self, usize)> {
        let mut value: u64 = 0;

        for (i, &b) in buf.iter().take(MAX_VARINT_LENGTH).enumerate() {
            if i == MAX_VARINT_LENGTH - 1 {
                value = (value << 8) | b as u64;
                return Some((Self(value), MAX_VARINT_LENGTH));
            }

            value = (value << 7) | (b & 0b0111_1111) as u64;

            if b >> 7 == 0 {
                return Some((Self(value), i + 1));
            }
        }

        None
    }

    /// Decode a varint, advancing `buf` past it.
    pub fn advance(buf: &mut &[u8]) -> Option<Self> {
        let (value, length) = Self::read(buf)?;
        *buf = &buf[length..];
        Some(value)
    }

    /// Value reinterpreted as a signed integer, as stored for rowids.
    pub fn signed(self) -> i64 {
        self.0 as i64
    }

    /// Append the encoded varint to `out`.
    pub fn write(self, out: &mut Vec<u8>) {
        let mut n = self.0;

        if n & 0xff00_0000_0000_0000 != 0 {
            let mut bytes = [0u8; MAX_VARINT_LENGTH];
            bytes[8] = n as u8;
            n >>= 8;

            for b in bytes[..8].iter_mut().rev() {
                *b = (n as u8 & 0b0111_1111) | 0b1000_0000;
                n >>= 7;
            }

            out.extend_from_slice(&bytes);
            return;
        }

        let mut bytes = Vec::with_capacity(MAX_VARINT_LENGTH);
        loop {
            bytes.push((n as u8 & 0b0111_1111) | 0b1000_0000);
            n >>= 7;

            if n == 0 {
                break;
            }
        }

        // The lowest group was pushed first and ends the varint.
        bytes[0] &= 0b0111_1111;
        out.extend(bytes.iter().rev());
    }

    pub fn to_bytes(self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(MAX_VARINT_LENGTH);
        self.write(&mut bytes);
        bytes
    }

    /// Number of bytes the encoded varint will occupy.
    pub fn encoded_len(self) -> usize {
        if self.0 & 0xff00_0000_0000_0000 != 0 {
            return MAX_VARINT_LENGTH;
        }

        let bits = u64::BITS - self.0.leading_zeros();
        (bits as usize).div_ceil(7).max(1)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    mod read {
        use super::*;

        #[test]
        fn n0() {
            assert_eq!(VarInt::read(&[0b0000_0000]), Some((VarInt(0), 1)));
        }

        #[test]
        fn n127() {
            assert_eq!(VarInt::read(&[0b0111_1111]), Some((VarInt(127), 1)));
        }

        #[test]
        fn n255() {
            assert_eq!(
                VarInt::read(&[0b1000_0001, 0b0111_1111, 0xaa]),
                Some((VarInt(255), 2))
            );
        }

        #[test]
        fn truncated() {
            assert_eq!(VarInt::read(&[0b1000_0001, 0b1000_0000]), None);
            assert_eq!(VarInt::read(&[]), None);
        }

        #[test]
        fn ninth_byte_is_full() {
            let bytes = [0xff; 9];
            assert_eq!(VarInt::read(&bytes), Some((VarInt(u64::MAX), 9)));
        }

        #[test]
        fn negative_rowid() {
            let (value, length) = VarInt::read(&[0xff; 9]).unwrap();
            assert_eq!(length, 9);
            assert_eq!(value.signed(), -1);
        }
    }

    mod write {
        use super::*;

        #[test]
        fn n0() {
            assert_eq!(VarInt(0).to_bytes(), &[0b0000_0000]);
        }

        #[test]
        fn n127() {
            assert_eq!(VarInt(127).to_bytes(), &[0b0111_1111]);
        }

        #[test]
        fn n255() {
            assert_eq!(VarInt(255).to_bytes(), &[0b1000_0001, 0b0111_1111]);
        }

        #[test]
        fn i64_max() {
            assert_eq!(
                VarInt(i64::MAX as u64).to_bytes(),
                &[0xbf, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]
            );
        }

        #[test]
        fn encoded_len_matches() {
            for n in [0, 127, 128, 16_383, 16_384, 1 << 55, (1 << 56) - 1, 1 << 56, u64::MAX] {
                assert_eq!(VarInt(n).encoded_len(), VarInt(n).to_bytes().len(), "{n}");
                let encoded = VarInt(n).to_bytes();
                assert_eq!(VarInt::read(&encoded), Some((VarInt(n), encoded.len())));
            }
        }
    }
}
