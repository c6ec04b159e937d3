//! Demonstrates basic usage of `BlockPool`: typed values, growth and element reuse.

use std::num::NonZero;

use block_pool::{BlockPool, DropPolicy};

fn main() {
    println!("=== BlockPool Basic Example ===");
    println!();

    let mut pool = BlockPool::builder().layout_of::<[u64; 4]>().build();

    println!("Element layout: {:?}", pool.item_layout());
    println!("Element stride: {} bytes", pool.element_stride());
    println!();

    // SAFETY: The pool was created with the layout of [u64; 4].
    let values: Vec<_> = (0..100_u64)
        .map(|i| unsafe { pool.insert([i; 4]) }.expect("pool has no capacity limit"))
        .collect();

    println!(
        "After 100 inserts: len = {}, capacity = {}, blocks = {}",
        pool.len(),
        pool.capacity(),
        pool.block_count()
    );

    let reused = *values.get(10).expect("100 values were inserted");

    // SAFETY: The value was inserted as [u64; 4] above and is removed only once.
    let removed = unsafe { pool.remove(reused) };
    println!("Removed value {removed:?}");

    let element = pool.alloc().expect("pool has no capacity limit");
    println!(
        "Next allocation reuses the freed element: {}",
        element.cast::<[u64; 4]>() == reused
    );

    // SAFETY: The element was allocated above and never initialized.
    unsafe { pool.free(element) };

    for value in values.into_iter().filter(|value| *value != reused) {
        // SAFETY: Every remaining value was inserted as [u64; 4] and not yet removed.
        drop(unsafe { pool.remove(value) });
    }

    println!("After removing everything: len = {}", pool.len());
    println!();

    println!("=== Capacity limit ===");

    let mut limited = BlockPool::builder()
        .layout_of::<u32>()
        .capacity_limit(NonZero::new(3).expect("3 is not zero"))
        .drop_policy(DropPolicy::MayReleaseOccupied)
        .build();

    for attempt in 1..=4 {
        let outcome = limited.alloc().map_or("exhausted", |_| "allocated");
        println!("Allocation {attempt}: {outcome}");
    }
}
