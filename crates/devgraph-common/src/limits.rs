//! Fixed resource limits and alignment helpers.

/// Maximum number of host buffers that can be mapped into one device context.
pub const MAX_BUFFERS: usize = 16;

/// Maximum number of command streams a device context may drive in parallel.
pub const MAX_COMMAND_STREAMS: usize = 32;

/// Default page size used when splitting buffers into device views.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Default maximum extent of a single device-addressable view (256 MiB).
pub const DEFAULT_MAX_VIEW_LENGTH: usize = 256 * 1024 * 1024;

/// Alignment of tensors bump-allocated inside a host arena.
pub const TENSOR_ALIGNMENT: usize = 32;

/// Integer ceiling division.
///
/// # Panics
///
/// Panics if `divisor` is zero.
#[must_use]
pub const fn ceil_div(value: usize, divisor: usize) -> usize {
    value.div_ceil(divisor)
}

/// Round `value` up to the next multiple of `align`.
///
/// Returns `None` on overflow or when `align` is zero.
#[must_use]
pub const fn align_up(value: usize, align: usize) -> Option<usize> {
    value.checked_next_multiple_of(align)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceil_div_rounds_up() {
        assert_eq!(ceil_div(0, 4), 0);
        assert_eq!(ceil_div(1, 4), 1);
        assert_eq!(ceil_div(8, 4), 2);
        assert_eq!(ceil_div(9, 4), 3);
    }

    #[test]
    fn align_up_to_page() {
        assert_eq!(align_up(1, DEFAULT_PAGE_SIZE), Some(4096));
        assert_eq!(align_up(4096, DEFAULT_PAGE_SIZE), Some(4096));
        assert_eq!(align_up(4097, DEFAULT_PAGE_SIZE), Some(8192));
        assert_eq!(align_up(0, DEFAULT_PAGE_SIZE), Some(0));
    }

    #[test]
    fn align_up_rejects_zero_alignment() {
        assert_eq!(align_up(10, 0), None);
    }

    #[test]
    fn align_up_overflow() {
        assert_eq!(align_up(usize::MAX, 4096), None);
    }
}
