pub struct Utils;

impl Utils {
    /// Reads a little-endian u16 at `offset`.
    pub fn u16ify(array: &[u8], offset: usize) -> u16 {
        u16::from_le_bytes([array[offset], array[offset + 1]])
    }

    pub fn hex(data: &[u8]) -> String {
        data.iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Hex dump limited to `max` bytes, with a trailing ellipsis when cut short.
    pub fn hex_truncated(data: &[u8], max: usize) -> String {
        if data.len() <= max {
            Self::hex(data)
        } else {
            format!("{} ...", Self::hex(&data[..max]))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u16ify_is_little_endian() {
        assert_eq!(Utils::u16ify(&[0x00, 0x73, 0x00], 1), 0x0073);
        assert_eq!(Utils::u16ify(&[0x34, 0x12], 0), 0x1234);
    }

    #[test]
    fn hex_truncates() {
        assert_eq!(Utils::hex(&[0xa1, 0x1a]), "A1 1A");
        assert_eq!(Utils::hex_truncated(&[1, 2, 3], 2), "01 02 ...");
    }
}
