/// Alignment unit of the heap. Every header, block and payload is a multiple of it.
pub const ALIGNMENT: usize = 16;

/// Rounds `$value` up to the next multiple of `$unit`, which must be a power of two.
///
/// # Examples
///
/// ```rust
/// use tagalloc::align_to;
///
/// assert_eq!(align_to!(1, 4096), 4096);
/// assert_eq!(align_to!(4096, 4096), 4096);
/// assert_eq!(align_to!(4097, 4096), 8192);
/// ```
#[macro_export]
macro_rules! align_to {
  ($value:expr, $unit:expr) => {
    ($value + $unit - 1) & !($unit - 1)
  };
}

/// Rounds `$value` up to the heap's [`ALIGNMENT`](crate::align::ALIGNMENT).
///
/// # Examples
///
/// ```rust
/// use tagalloc::align;
///
/// assert_eq!(align!(0), 0);
/// assert_eq!(align!(13), 16);
/// assert_eq!(align!(32), 32);
/// ```
#[macro_export]
macro_rules! align {
  ($value:expr) => {
    $crate::align_to!($value, $crate::align::ALIGNMENT)
  };
}

/// Overflow-checked [`align!`]; `None` when the rounded value does not fit in `usize`.
pub fn checked_align(value: usize) -> Option<usize> {
  value
    .checked_add(ALIGNMENT - 1)
    .map(|v| v & !(ALIGNMENT - 1))
}
