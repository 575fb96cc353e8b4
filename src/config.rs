/// When an empty region goes back to the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReclaimPolicy {
  /// Unmap an empty region unless it holds the only free block of the heap.
  #[default]
  KeepLastFree,
  /// Unmap every region as soon as it is empty.
  Always,
  /// Keep regions mapped until the heap is reset or dropped.
  Never,
}

/// Tunables of a [`Heap`](crate::Heap).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapConfig {
  /// Upper bound, in OS pages, of the increment added by one grow step.
  pub max_region_pages: usize,
  pub reclaim: ReclaimPolicy,
  /// Run the heap checker after every allocate/release and log what it finds.
  pub check_each_op: bool,
}

impl Default for HeapConfig {
  fn default() -> Self {
    Self {
      max_region_pages: 32,
      reclaim: ReclaimPolicy::default(),
      check_each_op: false,
    }
  }
}

impl HeapConfig {
  pub fn with_max_region_pages(
    mut self,
    pages: usize,
  ) -> Self {
    self.max_region_pages = pages.max(1);
    self
  }

  pub fn with_reclaim(
    mut self,
    reclaim: ReclaimPolicy,
  ) -> Self {
    self.reclaim = reclaim;
    self
  }

  pub fn with_check_each_op(
    mut self,
    check: bool,
  ) -> Self {
    self.check_each_op = check;
    self
  }
}
