//! Private heap scoped to one search. Every buffer the search needs is
//! drawn from here, so tearing the arena down is the one cleanup point that
//! cannot miss anything.

use std::{
    ffi::c_void,
    ptr::{self, NonNull},
};

use super::{Capabilities, RtlAllocateHeapFn, RtlDestroyHeapFn, RtlFreeHeapFn};
use crate::error::SearchError;

const HEAP_NO_SERIALIZE: u32 = 0x0000_0001;
const HEAP_GROWABLE: u32 = 0x0000_0002;

// Sized so typical snapshot and name buffers never force OS-level growth.
const HEAP_RESERVE: usize = 2 * 1024 * 1024;
const HEAP_COMMIT: usize = 1024 * 1024;

/// A non-serialized, growable private heap. Not safe to share between
/// concurrent searches; each search owns its own arena.
pub struct Arena {
    heap: NonNull<c_void>,
    alloc: RtlAllocateHeapFn,
    free: RtlFreeHeapFn,
    destroy: RtlDestroyHeapFn,
}

impl Arena {
    pub fn open(caps: &Capabilities) -> Result<Self, SearchError> {
        let create = caps.rtl_create_heap()?;
        let alloc = caps.rtl_allocate_heap()?;
        let free = caps.rtl_free_heap()?;
        let destroy = caps.rtl_destroy_heap()?;

        let heap = unsafe {
            create(
                HEAP_NO_SERIALIZE | HEAP_GROWABLE,
                ptr::null_mut(),
                HEAP_RESERVE,
                HEAP_COMMIT,
                ptr::null_mut(),
                ptr::null_mut(),
            )
        };
        let heap = NonNull::new(heap).ok_or(SearchError::OutOfMemory(HEAP_RESERVE))?;
        Ok(Self {
            heap,
            alloc,
            free,
            destroy,
        })
    }

    /// Allocation failures propagate as `OutOfMemory`; they are never
    /// retried.
    pub fn alloc(&self, size: usize) -> Result<ArenaBox, SearchError> {
        let ptr = unsafe { (self.alloc)(self.heap.as_ptr(), 0, size) };
        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or(SearchError::OutOfMemory(size))?;
        Ok(ArenaBox {
            ptr,
            size,
            heap: self.heap,
            free: self.free,
        })
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe {
            (self.destroy)(self.heap.as_ptr());
        }
    }
}

/// One allocation out of the arena, freed on drop.
///
/// Must not outlive the [`Arena`] it came from; within this crate every
/// `ArenaBox` is either a local or stored in a field declared before its
/// arena, so it is always released first.
pub struct ArenaBox {
    ptr: NonNull<u8>,
    size: usize,
    heap: NonNull<c_void>,
    free: RtlFreeHeapFn,
}

impl ArenaBox {
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl Drop for ArenaBox {
    fn drop(&mut self) {
        unsafe {
            (self.free)(self.heap.as_ptr(), 0, self.ptr.as_ptr().cast());
        }
    }
}
