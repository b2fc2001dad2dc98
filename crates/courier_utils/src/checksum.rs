//! CRC32 helpers used to protect message frames end to end.
//!
//! The hash is incremental: [`resume`] continues a previously computed value
//! over more input, which lets frame checksums cover the metadata and the
//! payload without concatenating them.

/// CRC32 of `data`.
pub fn compute(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Continue the CRC32 `current` over `data`.
pub fn resume(current: u32, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(current);
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        assert_eq!(compute(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn resume_matches_single_pass() {
        let data = b"metadata-and-payload";
        let (head, tail) = data.split_at(8);
        assert_eq!(resume(compute(head), tail), compute(data));
    }

    #[test]
    fn resume_from_zero_is_compute() {
        assert_eq!(resume(0, b"hello"), compute(b"hello"));
    }

    #[test]
    fn different_input_changes_value() {
        assert_ne!(compute(b"hello-1"), compute(b"hello-2"));
    }
}
