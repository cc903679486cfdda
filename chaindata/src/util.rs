//! Small shared codecs.

/// Appends `value` to `out` as a Bitcoin-style compact-size integer.
pub fn write_compact_size(value: u64, out: &mut Vec<u8>) {
    match value {
        0..=0xfc => out.push(value as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(value as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
}

/// Reads a compact-size integer from the front of `bytes`, returning the
/// value and the number of bytes consumed.
pub fn read_compact_size(bytes: &[u8]) -> Option<(u64, usize)> {
    let first = *bytes.first()?;
    match first {
        0..=0xfc => Some((first as u64, 1)),
        0xfd => {
            let raw: [u8; 2] = bytes.get(1..3)?.try_into().ok()?;
            Some((u16::from_le_bytes(raw) as u64, 3))
        }
        0xfe => {
            let raw: [u8; 4] = bytes.get(1..5)?.try_into().ok()?;
            Some((u32::from_le_bytes(raw) as u64, 5))
        }
        0xff => {
            let raw: [u8; 8] = bytes.get(1..9)?.try_into().ok()?;
            Some((u64::from_le_bytes(raw), 9))
        }
    }
}

/// Little-endian `u32` from the front of a slice.
pub fn read_u32_le(bytes: &[u8]) -> Option<u32> {
    Some(u32::from_le_bytes(bytes.get(..4)?.try_into().ok()?))
}

/// Little-endian `u64` from the front of a slice.
pub fn read_u64_le(bytes: &[u8]) -> Option<u64> {
    Some(u64::from_le_bytes(bytes.get(..8)?.try_into().ok()?))
}

/// Big-endian fixed-width key for integer-keyed tables. Big-endian keeps
/// lexicographic cursor order equal to numeric order.
pub fn int_key(value: u64) -> [u8; 8] {
    value.to_be_bytes()
}

/// Reverse of [`int_key`].
pub fn read_int_key(bytes: &[u8]) -> Option<u64> {
    Some(u64::from_be_bytes(bytes.get(..8)?.try_into().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_size_roundtrip() {
        for value in [0u64, 1, 0xfc, 0xfd, 0xffff, 0x1_0000, 0xffff_ffff, u64::MAX] {
            let mut buf = Vec::new();
            write_compact_size(value, &mut buf);
            let (decoded, used) = read_compact_size(&buf).expect("decode");
            assert_eq!(decoded, value);
            assert_eq!(used, buf.len());
        }
    }

    #[test]
    fn compact_size_rejects_truncation() {
        let mut buf = Vec::new();
        write_compact_size(0xffff, &mut buf);
        assert!(read_compact_size(&buf[..2]).is_none());
    }

    #[test]
    fn int_key_preserves_order() {
        let keys: Vec<[u8; 8]> = [0u64, 1, 255, 256, 65_536, u64::MAX]
            .iter()
            .map(|v| int_key(*v))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(read_int_key(&int_key(77)), Some(77));
    }
}
