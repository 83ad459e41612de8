use super::Locked;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

/// Size classes served from free lists. Drive descriptors and their strings
/// fall in the small classes; sector buffers go to the fallback heap.
const BLOCK_SIZES: &[usize] = &[8, 16, 32, 64, 128, 256, 512, 1024, 2048];

pub struct FixedSizeBlockAllocator {
    list_heads: [Option<&'static mut ListNode>; BLOCK_SIZES.len()],
    fallback_allocator: linked_list_allocator::Heap,
}

struct ListNode {
    next: Option<&'static mut ListNode>,
}

impl Default for FixedSizeBlockAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl FixedSizeBlockAllocator {
    #[must_use]
    pub const fn new() -> Self {
        const EMPTY: Option<&'static mut ListNode> = None;
        Self {
            list_heads: [EMPTY; BLOCK_SIZES.len()],
            fallback_allocator: linked_list_allocator::Heap::empty(),
        }
    }

    /// # Safety
    ///
    /// `[heap_start, heap_start + heap_size)` must be mapped, writable and
    /// otherwise unused. Call once.
    pub unsafe fn init(&mut self, heap_start: usize, heap_size: usize) {
        unsafe { self.fallback_allocator.init(heap_start as *mut u8, heap_size) };
    }

    fn fallback_alloc(&mut self, layout: Layout) -> *mut u8 {
        self.fallback_allocator
            .allocate_first_fit(layout)
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }
}

fn list_index(layout: &Layout) -> Option<usize> {
    let required_block_size = layout.size().max(layout.align());
    BLOCK_SIZES.iter().position(|&s| s >= required_block_size)
}

unsafe impl GlobalAlloc for Locked<FixedSizeBlockAllocator> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut allocator = self.lock();

        let Some(index) = list_index(&layout) else {
            return allocator.fallback_alloc(layout);
        };

        if let Some(node) = allocator.list_heads[index].take() {
            allocator.list_heads[index] = node.next.take();
            return ptr::from_mut::<ListNode>(node).cast::<u8>();
        }

        let block_size = BLOCK_SIZES[index];
        // Block sizes are powers of two, so each block is its own alignment.
        Layout::from_size_align(block_size, block_size)
            .map_or(ptr::null_mut(), |layout| allocator.fallback_alloc(layout))
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let mut allocator = self.lock();

        if let Some(index) = list_index(&layout) {
            let new_node = ListNode {
                next: allocator.list_heads[index].take(),
            };

            debug_assert!(size_of::<ListNode>() <= BLOCK_SIZES[index]);
            debug_assert!(align_of::<ListNode>() <= BLOCK_SIZES[index]);

            #[allow(clippy::cast_ptr_alignment)]
            let new_node_ptr = ptr.cast::<ListNode>();

            unsafe { new_node_ptr.write(new_node) };

            allocator.list_heads[index] = Some(unsafe { &mut *new_node_ptr });
        } else if let Some(ptr) = NonNull::new(ptr) {
            unsafe { allocator.fallback_allocator.deallocate(ptr, layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::boxed::Box;

    #[repr(align(4096))]
    struct Arena([u8; 64 * 1024]);

    fn allocator() -> Locked<FixedSizeBlockAllocator> {
        let arena: &'static mut Arena = Box::leak(Box::new(Arena([0; 64 * 1024])));
        let allocator = Locked::new(FixedSizeBlockAllocator::new());
        unsafe {
            allocator
                .lock()
                .init(arena.0.as_mut_ptr() as usize, arena.0.len());
        }
        allocator
    }

    #[test]
    fn small_blocks_are_recycled() {
        let allocator = allocator();
        let layout = Layout::from_size_align(24, 8).unwrap();

        let a = unsafe { allocator.alloc(layout) };
        assert!(!a.is_null());
        assert_eq!(a as usize % 32, 0);

        unsafe { allocator.dealloc(a, layout) };
        let b = unsafe { allocator.alloc(layout) };
        assert_eq!(a, b);
    }

    #[test]
    fn large_requests_use_the_fallback_heap() {
        let allocator = allocator();
        let layout = Layout::from_size_align(4 * 512, 2).unwrap();
        let big = Layout::from_size_align(8 * 512, 8).unwrap();

        let a = unsafe { allocator.alloc(layout) };
        let b = unsafe { allocator.alloc(big) };
        assert!(!a.is_null() && !b.is_null());
        assert_ne!(a, b);

        unsafe { allocator.dealloc(b, big) };
        unsafe { allocator.dealloc(a, layout) };
    }

    #[test]
    fn exhausted_heap_returns_null() {
        let allocator = allocator();
        let layout = Layout::from_size_align(128 * 1024, 8).unwrap();

        assert!(unsafe { allocator.alloc(layout) }.is_null());
    }
}
