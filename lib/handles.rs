//! Slot arena for managed file handles.
//!
//! The filesystem layer hands out two kinds of handles: native ones
//! owned by the pass-through layer, and managed ones indexing into
//! this table. The spaces are partitioned by [`MANAGED_HANDLE_BASE`]
//! so a handle's kind is decidable from its value alone.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

/// Managed handles live at `MANAGED_HANDLE_BASE + slot`; everything
/// below belongs to the native pass-through space.
pub const MANAGED_HANDLE_BASE: u64 = 1 << 32;

/// Whether a handle value belongs to the managed partition.
#[must_use]
pub fn is_managed(handle: u64) -> bool {
    handle >= MANAGED_HANDLE_BASE
}

/// The handle is outside the managed partition's live range, or the
/// slot it names is not allocated.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid managed handle {0}")]
pub struct InvalidHandle(pub u64);

enum Slot<T> {
    Occupied(Arc<T>),
    Free { next: Option<usize> },
}

struct Slots<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<usize>,
}

/// Growable slot arena with a stack-discipline free list.
///
/// `allocate` and `release` are O(1); the most recently freed slot is
/// reused first. A slot index is only ever reachable through one live
/// handle at a time.
pub struct HandleTable<T> {
    inner: Mutex<Slots<T>>,
}

impl<T> HandleTable<T> {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Slots {
                slots: Vec::new(),
                free_head: None,
            }),
        }
    }

    /// Store `obj` and return its handle.
    pub fn allocate(&self, obj: Arc<T>) -> u64 {
        let mut inner = self.inner.lock();
        let index = match inner.free_head {
            Some(index) => {
                let next = match &inner.slots[index] {
                    Slot::Free { next } => *next,
                    Slot::Occupied(_) => {
                        unreachable!("free list head points at an occupied slot")
                    }
                };
                inner.free_head = next;
                inner.slots[index] = Slot::Occupied(obj);
                index
            }
            None => {
                inner.slots.push(Slot::Occupied(obj));
                inner.slots.len() - 1
            }
        };
        MANAGED_HANDLE_BASE + index as u64
    }

    /// Free a handle, returning the object it referenced.
    ///
    /// Out-of-range and already-free handles are caller contract
    /// violations and surface as [`InvalidHandle`].
    pub fn release(&self, handle: u64) -> Result<Arc<T>, InvalidHandle> {
        let index = Self::slot_index(handle)?;
        let mut inner = self.inner.lock();
        if index >= inner.slots.len() {
            return Err(InvalidHandle(handle));
        }

        let free_head = inner.free_head;
        match std::mem::replace(&mut inner.slots[index], Slot::Free { next: free_head }) {
            Slot::Occupied(obj) => {
                inner.free_head = Some(index);
                Ok(obj)
            }
            original @ Slot::Free { .. } => {
                // Double free: put the slot back exactly as it was.
                inner.slots[index] = original;
                Err(InvalidHandle(handle))
            }
        }
    }

    /// Look up a live handle. Handles in the native partition and
    /// freed slots yield `None`.
    #[must_use]
    pub fn lookup(&self, handle: u64) -> Option<Arc<T>> {
        let index = Self::slot_index(handle).ok()?;
        let inner = self.inner.lock();
        match inner.slots.get(index)? {
            Slot::Occupied(obj) => Some(Arc::clone(obj)),
            Slot::Free { .. } => None,
        }
    }

    fn slot_index(handle: u64) -> Result<usize, InvalidHandle> {
        handle
            .checked_sub(MANAGED_HANDLE_BASE)
            .and_then(|index| usize::try_from(index).ok())
            .ok_or(InvalidHandle(handle))
    }
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
