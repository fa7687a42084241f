use super::free_list::FreeList;
use crate::error::{Result, SchedulerError};
use crate::fiber::{MIN_STACK_SIZE, STACK_ALIGN};
use parking_lot::Mutex;
use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

/// Alignment of the whole region, so page-sized blocks start on a page.
const ARENA_ALIGN: usize = 4096;

struct ArenaState {
    /// Blocks handed out by bumping so far. Never decreases.
    bumped: usize,
    free: FreeList,
}

/// A fixed-capacity region sliced into equally sized fiber stacks.
///
/// The whole region is reserved once up front; blocks are carved from it on
/// demand and recycled through an intrusive free list, so steady-state job
/// churn never reaches the system allocator. One short lock guards both the
/// bump cursor and the free list. It is only taken when a job is created or
/// destroyed, never around a context switch.
pub struct StackArena {
    base: NonNull<u8>,
    layout: Layout,
    block_size: usize,
    capacity: usize,
    state: Mutex<ArenaState>,
}

// SAFETY: the arena owns its region; all mutable bookkeeping is behind the
// mutex and blocks are only ever handed to one owner at a time.
unsafe impl Send for StackArena {}
unsafe impl Sync for StackArena {}

impl StackArena {
    /// Reserves room for `capacity` stacks of `block_size` bytes each.
    ///
    /// `block_size` is rounded up to the stack alignment.
    pub fn new(block_size: usize, capacity: usize) -> Result<Self> {
        if block_size < MIN_STACK_SIZE {
            return Err(SchedulerError::InvalidConfig(format!(
                "stack size {block_size} is below the minimum of {MIN_STACK_SIZE} bytes"
            )));
        }
        if capacity == 0 {
            return Err(SchedulerError::InvalidConfig("stack arena capacity must be greater than 0".into()));
        }

        let block_size = block_size.next_multiple_of(STACK_ALIGN);
        let bytes = block_size
            .checked_mul(capacity)
            .ok_or_else(|| SchedulerError::InvalidConfig("stack arena size overflows usize".into()))?;
        let layout = Layout::from_size_align(bytes, ARENA_ALIGN)
            .map_err(|e| SchedulerError::InvalidConfig(format!("stack arena layout: {e}")))?;

        // SAFETY: `layout` has a non-zero size.
        let base = NonNull::new(unsafe { alloc::alloc(layout) }).ok_or(SchedulerError::ArenaReservation { bytes })?;

        tracing::debug!(block_size, capacity, bytes, "reserved stack arena");

        Ok(StackArena {
            base,
            layout,
            block_size,
            capacity,
            state: Mutex::new(ArenaState {
                bumped: 0,
                free: FreeList::new(),
            }),
        })
    }

    /// Hands out a stack block, preferring recycled ones.
    ///
    /// Returns `None` once every block of the fixed capacity is in use.
    pub fn acquire_stack(&self) -> Option<NonNull<u8>> {
        let mut state = self.state.lock();
        if let Some(block) = state.free.pop() {
            return Some(block);
        }
        if state.bumped == self.capacity {
            return None;
        }

        let offset = state.bumped * self.block_size;
        state.bumped += 1;
        // SAFETY: `offset` is inside the reserved region.
        Some(unsafe { self.base.add(offset) })
    }

    /// Returns a block to the free list.
    ///
    /// # Safety
    ///
    /// `block` must come from [`StackArena::acquire_stack`] on this arena,
    /// must not have been released since, and must no longer be in use.
    pub unsafe fn release_stack(&self, block: NonNull<u8>) {
        debug_assert!(self.is_block_start(block), "{block:p} is not a block of this arena");
        let mut state = self.state.lock();
        // SAFETY: the block is ours again and large enough for a node.
        unsafe { state.free.push(block) };
    }

    /// Like [`StackArena::acquire_stack`] but wraps the block in a guard that
    /// releases it when dropped.
    pub fn lease(self: &Arc<Self>) -> Option<StackLease> {
        let block = self.acquire_stack()?;
        Some(StackLease {
            arena: Arc::clone(self),
            block,
        })
    }

    /// Whether `addr` points into the arena's region.
    pub fn contains(&self, addr: *const u8) -> bool {
        let base = self.base.as_ptr() as usize;
        (base..base + self.layout.size()).contains(&(addr as usize))
    }

    fn is_block_start(&self, block: NonNull<u8>) -> bool {
        let offset = (block.as_ptr() as usize).wrapping_sub(self.base.as_ptr() as usize);
        offset < self.layout.size() && offset % self.block_size == 0
    }

    /// Size in bytes of every block.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Maximum number of blocks.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Blocks carved from the region so far, free or not.
    pub fn allocated_blocks(&self) -> usize {
        self.state.lock().bumped
    }

    /// Blocks currently waiting on the free list.
    pub fn free_blocks(&self) -> usize {
        self.state.lock().free.len()
    }

    /// `(allocated, free)` read under one lock, so `free <= allocated`.
    pub fn block_counts(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.bumped, state.free.len())
    }

    /// Blocks currently owned by someone.
    pub fn in_use_blocks(&self) -> usize {
        let (allocated, free) = self.block_counts();
        allocated - free
    }
}

impl Drop for StackArena {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}

impl std::fmt::Debug for StackArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("StackArena")
            .field("block_size", &self.block_size)
            .field("capacity", &self.capacity)
            .field("allocated", &state.bumped)
            .field("free", &state.free.len())
            .finish()
    }
}

/// Exclusive ownership of one arena block; released exactly once on drop.
#[derive(Debug)]
pub struct StackLease {
    arena: Arc<StackArena>,
    block: NonNull<u8>,
}

// SAFETY: the lease is the block's only owner.
unsafe impl Send for StackLease {}

impl StackLease {
    /// Lowest address of the block.
    pub fn base(&self) -> NonNull<u8> {
        self.block
    }

    pub fn size(&self) -> usize {
        self.arena.block_size
    }
}

impl Drop for StackLease {
    fn drop(&mut self) {
        // SAFETY: the block was acquired by `lease` and is released only here.
        unsafe { self.arena.release_stack(self.block) };
    }
}
