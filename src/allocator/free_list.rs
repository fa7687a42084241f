use std::ptr::NonNull;

/// Node written into the first bytes of a released block.
#[repr(C)]
struct FreeNode {
    next: Option<NonNull<FreeNode>>,
}

/// An intrusive LIFO of released stack blocks.
///
/// The list stores no memory of its own: each node lives inside the block it
/// describes, so pushing can never fail.
#[derive(Debug, Default)]
pub struct FreeList {
    head: Option<NonNull<FreeNode>>,
    len: usize,
}

impl FreeList {
    pub const fn new() -> Self {
        FreeList { head: None, len: 0 }
    }

    /// Records `block` as free.
    ///
    /// # Safety
    ///
    /// `block` must be writable, aligned for a pointer, at least a pointer in
    /// size, not already on the list, and unused until popped again.
    pub unsafe fn push(&mut self, block: NonNull<u8>) {
        let node = block.cast::<FreeNode>();
        // SAFETY: the caller hands the block over to us.
        unsafe { node.as_ptr().write(FreeNode { next: self.head }) };
        self.head = Some(node);
        self.len += 1;
    }

    /// Takes the most recently released block.
    pub fn pop(&mut self) -> Option<NonNull<u8>> {
        let node = self.head?;
        // SAFETY: every node on the list was written by `push`.
        self.head = unsafe { node.as_ref().next };
        self.len -= 1;
        Some(node.cast())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}
