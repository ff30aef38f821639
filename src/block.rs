//! Fixed-size block math shared by the file center and download manager.
//!
//! Every file is divided into fixed-size blocks except for the last one,
//! which is whatever remains. This mirrors `cratetorrent`'s piece/block
//! length helpers, just generalized from a 16 KiB BitTorrent block to the
//! 20 MiB block this protocol uses.

/// The size, in bytes, of a block. The last block of a file may be shorter.
pub const BLOCK_SIZE: u64 = 20 * 1024 * 1024;

/// Returns the number of blocks a file of `file_len` bytes is divided into.
///
/// An empty file still has exactly one (zero-length) block, matching
/// `download_manager.py`'s treatment of a freshly-added empty file.
pub fn block_count(file_len: u64) -> u64 {
    if file_len == 0 {
        1
    } else {
        (file_len + BLOCK_SIZE - 1) / BLOCK_SIZE
    }
}

/// Returns the length, in bytes, of the block at `index` in a file of
/// `file_len` bytes.
///
/// # Panics
///
/// Panics if `index` is beyond the last block of the file.
pub fn block_len(file_len: u64, index: u64) -> u64 {
    let offset = index * BLOCK_SIZE;
    assert!(offset < file_len || (file_len == 0 && index == 0));
    if file_len == 0 {
        0
    } else {
        std::cmp::min(file_len - offset, BLOCK_SIZE)
    }
}

/// Returns the number of blocks re-fetched by a partial update, per
/// `download_manager.py::new_partial_update`'s `math.ceil(num_blocks *
/// 0.002)`. Since `ceil` of any positive fraction is at least 1, this
/// already never returns 0 for a non-empty file, so no explicit floor is
/// needed to match the literal source despite spec prose calling out a
/// "minimum 1" (see DESIGN.md).
pub fn partial_update_block_count(num_blocks: u64) -> u64 {
    ((num_blocks as f64) * 0.002).ceil() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_count_exact_multiple() {
        assert_eq!(block_count(2 * BLOCK_SIZE), 2);
    }

    #[test]
    fn block_count_with_remainder() {
        assert_eq!(block_count(2 * BLOCK_SIZE + 1), 3);
    }

    #[test]
    fn block_count_empty_file() {
        assert_eq!(block_count(0), 1);
    }

    #[test]
    fn block_len_last_block_is_short() {
        let file_len = 2 * BLOCK_SIZE + 234;
        assert_eq!(block_len(file_len, 0), BLOCK_SIZE);
        assert_eq!(block_len(file_len, 1), BLOCK_SIZE);
        assert_eq!(block_len(file_len, 2), 234);
    }

    #[test]
    fn partial_update_count_never_zero_for_nonempty_file() {
        assert_eq!(partial_update_block_count(1), 1);
        assert_eq!(partial_update_block_count(499), 1);
        assert_eq!(partial_update_block_count(500), 1);
        assert_eq!(partial_update_block_count(501), 2);
        assert_eq!(partial_update_block_count(10_000), 20);
    }
}
