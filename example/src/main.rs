//! An example of using `tag_alloc` as the global allocator of an ordinary
//! host binary.
//!
//! Everything this program allocates (vectors, strings, tree nodes) comes
//! out of the boundary-tag heap, and the final `check` walks that heap to
//! prove the collection churn left every invariant intact.

use std::collections::BTreeMap;

use tag_alloc::TagAlloc;

#[global_allocator]
static ALLOC: TagAlloc = TagAlloc::INIT;

fn main() {
    let mut log: Vec<String> = Vec::new();
    for i in 0..256u32 {
        log.push(format!("entry {i}: {:x}", u64::from(i).wrapping_mul(0x9e37_79b9)));
    }

    let mut index: BTreeMap<u32, usize> = BTreeMap::new();
    for (i, line) in log.iter().enumerate() {
        index.insert(i as u32, line.len());
    }
    let total: usize = index.values().sum();

    // Drop and shrink so the heap sees frees and coalescing, not just
    // growth.
    drop(index);
    log.truncate(16);
    log.shrink_to_fit();

    ALLOC
        .check()
        .expect("heap invariants hold after collection churn");
    println!("indexed {total} bytes of log text; heap checks out");
}
