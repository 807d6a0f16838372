#![allow(clippy::unwrap_used, missing_docs)]

use std::collections::HashSet;
use std::sync::Arc;

use pointer_fs::handles::{HandleTable, InvalidHandle, MANAGED_HANDLE_BASE, is_managed};

#[test]
fn live_handles_never_collide() {
    let table = HandleTable::new();
    let handles: Vec<u64> = (0..64u64).map(|i| table.allocate(Arc::new(i))).collect();

    let unique: HashSet<u64> = handles.iter().copied().collect();
    assert_eq!(unique.len(), handles.len(), "all live handles must differ");

    for (i, handle) in handles.iter().enumerate() {
        assert!(is_managed(*handle));
        assert_eq!(*table.lookup(*handle).unwrap(), i as u64);
    }
}

#[test]
fn released_handles_stop_resolving() {
    let table = HandleTable::new();
    let handle = table.allocate(Arc::new("x"));

    assert!(table.lookup(handle).is_some());
    table.release(handle).unwrap();
    assert!(table.lookup(handle).is_none(), "freed slot must not resolve");
}

#[test]
fn most_recently_freed_slot_is_reused_first() {
    let table = HandleTable::new();
    let a = table.allocate(Arc::new("a"));
    let b = table.allocate(Arc::new("b"));
    let c = table.allocate(Arc::new("c"));

    table.release(b).unwrap();
    table.release(a).unwrap();

    // Free list is a stack: a went on top of b.
    assert_eq!(table.allocate(Arc::new("d")), a);
    assert_eq!(table.allocate(Arc::new("e")), b);

    // c was never freed and must still resolve to its object.
    assert_eq!(*table.lookup(c).unwrap(), "c");
}

#[test]
fn reused_slots_never_alias_live_objects() {
    let table = HandleTable::new();
    let first = table.allocate(Arc::new("first"));
    table.release(first).unwrap();

    let second = table.allocate(Arc::new("second"));
    assert_eq!(second, first, "slot may be recycled");
    assert_eq!(
        *table.lookup(second).unwrap(),
        "second",
        "recycled handle must see only the new object"
    );
}

#[test]
fn double_release_is_rejected() {
    let table = HandleTable::new();
    let handle = table.allocate(Arc::new(1u8));

    table.release(handle).unwrap();
    assert_eq!(table.release(handle), Err(InvalidHandle(handle)));

    // The rejected release must not corrupt the free list.
    let reused = table.allocate(Arc::new(2u8));
    assert_eq!(reused, handle);
    assert_eq!(*table.lookup(reused).unwrap(), 2);
}

#[test]
fn out_of_range_handles_are_rejected() {
    let table: HandleTable<u8> = HandleTable::new();
    assert_eq!(
        table.release(MANAGED_HANDLE_BASE + 17),
        Err(InvalidHandle(MANAGED_HANDLE_BASE + 17))
    );
}

#[test]
fn native_partition_handles_never_resolve() {
    let table = HandleTable::new();
    let _ = table.allocate(Arc::new("x"));

    for native in [0u64, 1, 3, MANAGED_HANDLE_BASE - 1] {
        assert!(!is_managed(native));
        assert!(table.lookup(native).is_none());
        assert!(table.release(native).is_err());
    }
}

#[test]
fn concurrent_allocate_and_release_stay_consistent() {
    let table = Arc::new(HandleTable::new());

    let threads: Vec<_> = (0..8)
        .map(|t| {
            let table = Arc::clone(&table);
            std::thread::spawn(move || {
                let mut seen = Vec::new();
                for i in 0..200u64 {
                    let handle = table.allocate(Arc::new(t * 1000 + i));
                    assert_eq!(*table.lookup(handle).unwrap(), t * 1000 + i);
                    seen.push(handle);
                    if i % 3 == 0 {
                        let handle = seen.swap_remove(0);
                        table.release(handle).unwrap();
                    }
                }
                for handle in seen {
                    table.release(handle).unwrap();
                }
            })
        })
        .collect();

    for thread in threads {
        thread.join().unwrap();
    }

    // Everything was released; freshly allocated handles resolve again.
    let handle = table.allocate(Arc::new(42u64));
    assert_eq!(*table.lookup(handle).unwrap(), 42);
}
