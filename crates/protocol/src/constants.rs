/// Size of one content block in bytes.
///
/// Files are split into ciphertext blocks of this size before upload; the
/// last block of a file may be shorter. Block boundaries are fixed by the
/// server, so this value is part of the shared vocabulary rather than a
/// pipeline tuning knob.
pub const BLOCK_SIZE: u64 = 4 * 1024 * 1024;

/// Number of block-equivalents a transfer of `size` bytes contributes to the
/// admission load metric. A non-empty transfer always counts at least one.
pub fn block_equivalents(size: u64) -> u64 {
    size.div_ceil(BLOCK_SIZE).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_equivalents_rounds_up() {
        assert_eq!(block_equivalents(0), 1);
        assert_eq!(block_equivalents(1), 1);
        assert_eq!(block_equivalents(BLOCK_SIZE), 1);
        assert_eq!(block_equivalents(BLOCK_SIZE + 1), 2);
        assert_eq!(block_equivalents(10 * BLOCK_SIZE), 10);
    }
}
