//! File descriptor hygiene for freshly forked children.

use vigil_common::constants::MAX_FILE_DESCRIPTORS_CEILING;

/// Closes every descriptor above stderr in the calling process. Bounded by
/// the descriptor ceiling the supervisor enforces on its children.
pub fn close_all_nonstd() {
    let ceiling = i32::try_from(MAX_FILE_DESCRIPTORS_CEILING).unwrap_or(i32::MAX);
    for fd in 3..=ceiling {
        // SAFETY: in the child after fork no Rust object owns these
        // descriptors; closing an unused number is harmless (EBADF).
        let _ = unsafe { libc::close(fd) };
    }
}
