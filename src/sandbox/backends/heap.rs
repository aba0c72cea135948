//! Allocator for QuickJS runtimes that enforces the memory ceiling itself.
//!
//! QuickJS reports both an exhausted heap and an exhausted stack as ordinary
//! script errors, which plugin code can imitate. The allocator sits below the
//! engine, so it records what actually happened: whether an allocation was
//! refused, and how deep the native stack was when the engine last allocated.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use rquickjs::allocator::{Allocator, RustAllocator};

/// What the allocator observed, readable after the runtime is gone.
#[derive(Debug)]
pub struct HeapMeter {
    exhausted: AtomicBool,
    stack_low: AtomicUsize,
}

impl HeapMeter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            exhausted: AtomicBool::new(false),
            stack_low: AtomicUsize::new(usize::MAX),
        })
    }

    /// True once an allocation was refused for crossing the ceiling.
    pub fn exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Relaxed)
    }

    /// True if the engine allocated with the native stack at or below `limit`.
    ///
    /// A stack overflow error is allocated after the engine's stack check
    /// has already failed, so its allocation lands past the limit.
    pub fn stack_reached(&self, limit: usize) -> bool {
        self.stack_low.load(Ordering::Relaxed) <= limit
    }

    fn note_stack(&self) {
        self.stack_low.fetch_min(stack_position(), Ordering::Relaxed);
    }
}

/// Approximate address of the current native stack top.
#[inline(never)]
pub fn stack_position() -> usize {
    let marker = 0u8;
    std::hint::black_box(ptr::addr_of!(marker)) as usize
}

/// Counts live bytes and refuses allocations past `limit`.
pub struct MeteredAllocator {
    used: usize,
    limit: usize,
    meter: Arc<HeapMeter>,
}

impl MeteredAllocator {
    pub fn new(limit: usize, meter: Arc<HeapMeter>) -> Self {
        Self {
            used: 0,
            limit,
            meter,
        }
    }

    fn admit(&self, additional: usize) -> bool {
        if self.used.saturating_add(additional) > self.limit {
            self.meter.exhausted.store(true, Ordering::Relaxed);
            return false;
        }
        true
    }

    fn track(&mut self, ptr: *mut u8) {
        if !ptr.is_null() {
            // SAFETY: ptr was just returned by RustAllocator
            self.used += unsafe { RustAllocator::usable_size(ptr) };
        }
    }
}

// SAFETY: every pointer handed out comes from RustAllocator, and every
// pointer taken back is passed to it unchanged.
unsafe impl Allocator for MeteredAllocator {
    fn alloc(&mut self, size: usize) -> *mut u8 {
        self.meter.note_stack();
        if !self.admit(size) {
            return ptr::null_mut();
        }
        let ptr = RustAllocator.alloc(size);
        self.track(ptr);
        ptr
    }

    fn calloc(&mut self, count: usize, size: usize) -> *mut u8 {
        self.meter.note_stack();
        let Some(total) = count.checked_mul(size) else {
            self.meter.exhausted.store(true, Ordering::Relaxed);
            return ptr::null_mut();
        };
        if !self.admit(total) {
            return ptr::null_mut();
        }
        let ptr = RustAllocator.calloc(count, size);
        self.track(ptr);
        ptr
    }

    unsafe fn dealloc(&mut self, ptr: *mut u8) {
        self.used = self.used.saturating_sub(RustAllocator::usable_size(ptr));
        RustAllocator.dealloc(ptr);
    }

    unsafe fn realloc(&mut self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.alloc(new_size);
        }
        self.meter.note_stack();

        let old = RustAllocator::usable_size(ptr);
        if !self.admit(new_size.saturating_sub(old)) {
            return ptr::null_mut();
        }
        let moved = RustAllocator.realloc(ptr, new_size);
        if !moved.is_null() {
            self.used = self.used.saturating_sub(old) + RustAllocator::usable_size(moved);
        }
        moved
    }

    unsafe fn usable_size(ptr: *mut u8) -> usize {
        RustAllocator::usable_size(ptr)
    }
}
