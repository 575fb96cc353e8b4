use std::{io::Read, ptr};

use tagalloc::{Heap, HeapConfig, ReclaimPolicy, RegionSource};

/// Waits until the user presses ENTER.
/// Useful when you want to inspect the process mappings with tools like
/// `pmap` or `/proc/<pid>/maps` while the heap grows and shrinks.
fn block_until_enter_pressed() {
  println!("\n>>> Press ENTER to continue...");
  let _ = std::io::stdin().bytes().next();
}

fn print_stats<S: RegionSource>(
  label: &str,
  heap: &Heap<S>,
) {
  let stats = heap.stats();
  println!(
    "[{}] PID = {}, heap = {} bytes in {} region(s), maps = {}, unmaps = {}, free blocks = {}",
    label,
    std::process::id(),
    stats.heap_size,
    stats.regions,
    stats.maps,
    stats.unmaps,
    heap.free_blocks(),
  );
}

fn main() {
  // Empty regions go straight back to the OS so step 6 is visible.
  let mut heap = Heap::with_config(HeapConfig::default().with_reclaim(ReclaimPolicy::Always));

  print_stats("start", &heap);
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 1) Allocate a u32. The first allocation maps the first region.
  // --------------------------------------------------------------------
  let first_block = heap.allocate(4).expect("allocate u32");
  println!("\n[1] Allocate u32 at {:?}", first_block);

  let first_ptr = first_block.cast::<u32>();
  unsafe { first_ptr.write(0xDEADBEEF) };
  println!("[1] Value written = 0x{:X}", unsafe { first_ptr.read() });
  print_stats("1", &heap);

  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 2) Allocate 12 bytes. Sizes are rounded up to 16.
  // --------------------------------------------------------------------
  let second_block = heap.allocate(12).expect("allocate [u8; 12]");
  println!("\n[2] Allocate [u8; 12] at {:?}", second_block);
  unsafe { ptr::write_bytes(second_block.as_ptr(), 0xAB, 12) };
  println!(
    "[2] Distance from first block = {} bytes",
    second_block.as_ptr() as usize - first_block.as_ptr() as usize
  );

  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 3) Every payload is 16-byte aligned.
  // --------------------------------------------------------------------
  let third_block = heap.allocate(8).expect("allocate u64");
  println!(
    "\n[3] Allocate u64 at {:?}, addr % 16 = {}",
    third_block,
    third_block.as_ptr() as usize % 16
  );

  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 4) Release the first block and ask for a smaller one: first-fit
  //    hands the freed block out again.
  // --------------------------------------------------------------------
  unsafe { heap.release(first_block) };
  println!("\n[4] Released first_block at {:?}", first_block);

  let fourth_block = heap.allocate(2).expect("allocate [u8; 2]");
  println!(
    "[4] fourth_block == first_block? {}",
    if fourth_block == first_block {
      "Yes, it reused the freed block"
    } else {
      "No, it allocated somewhere else"
    }
  );

  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 5) A large allocation maps a new region.
  // --------------------------------------------------------------------
  print_stats("before large alloc", &heap);
  let big_block = heap.allocate(64 * 1024).expect("allocate 64 KiB");
  println!("\n[5] Allocate 64 KiB at {:?}", big_block);
  print_stats("after large alloc", &heap);

  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 6) Releasing it empties its region, which is unmapped.
  // --------------------------------------------------------------------
  unsafe { heap.release(big_block) };
  println!("\n[6] Released the 64 KiB block");
  print_stats("after release", &heap);

  let violations = heap.check();
  println!("[6] Heap check: {} violation(s)", violations.len());

  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 7) init() hands every remaining region back.
  // --------------------------------------------------------------------
  heap.init();
  println!("\n[7] Heap reset");
  print_stats("end", &heap);
}
