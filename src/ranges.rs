/// Total number of range buckets in the SHA-1 prefix space (16^5 = 1,048,576)
pub const TOTAL_RANGES: u32 = 0x100000;

/// Highest valid range index
pub const LAST_RANGE: u32 = 0xFFFFF;

const HEX: &[u8; 16] = b"0123456789ABCDEF";

/// Convert a range index to its five uppercase hex digits (stack allocated)
#[inline]
pub fn range_to_hex(index: u32) -> [u8; 5] {
    [
        HEX[((index >> 16) & 0xF) as usize],
        HEX[((index >> 12) & 0xF) as usize],
        HEX[((index >> 8) & 0xF) as usize],
        HEX[((index >> 4) & 0xF) as usize],
        HEX[(index & 0xF) as usize],
    ]
}

/// Canonical textual key for a range index: exactly five uppercase hex
/// digits, zero-padded (`"00000"`..`"FFFFF"`).
#[inline]
pub fn to_range_string(index: u32) -> String {
    range_to_hex(index).iter().copied().map(char::from).collect()
}
