//! Block bookkeeping for a single memory heap.
//!
//! A [`BlockList`] partitions the address range `[0, size)` of one heap into [`MemoryBlock`]s that are either free or in use.
//! The blocks form a doubly linked list in address order and tile the range exactly: every block starts where the previous one ends.
//! Blocks live in an arena owned by the list and refer to their neighbours by index, so handing a [`BlockId`] to a caller never
//! gives out a pointer into the list.
//!
//! Placement is first-fit in address order. Freed blocks are coalesced with free neighbours immediately, so two free blocks
//! are never adjacent.
//!
//! # Example
//! ```
//! # use phobos_heap::allocator::block::BlockList;
//! # use anyhow::Result;
//! # fn main() -> Result<()> {
//! let mut blocks = BlockList::new(1024);
//! let a = blocks.allocate(100, 16, 1)?.expect("fits in an empty list");
//! let b = blocks.allocate(200, 16, 1)?.expect("fits");
//! assert_eq!(a.offset, 0);
//! assert_eq!(b.offset, 112);
//! blocks.free(a.block)?;
//! blocks.free(b.block)?;
//! assert!(blocks.is_empty());
//! # Ok(())
//! # }
//! ```

use anyhow::Result;
use ash::vk;

use crate::Error;
use crate::util::align::{align_up, is_aliasing};

/// Handle to a block inside a [`BlockList`]. The generation is bumped every time the block is freed or its arena slot is reused,
/// so a handle to a freed block never refers to a different allocation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct BlockId {
    index: u32,
    generation: u32,
}

/// One span of a heap's address range.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemoryBlock {
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
    total_size: vk::DeviceSize,
    free: bool,
    prev: Option<u32>,
    next: Option<u32>,
}

impl MemoryBlock {
    /// Start of the block inside the heap, including leading alignment padding.
    pub fn offset(&self) -> vk::DeviceSize {
        self.offset
    }

    /// Number of bytes usable by the allocation occupying this block.
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Number of bytes this block spans, padding included.
    pub fn total_size(&self) -> vk::DeviceSize {
        self.total_size
    }

    /// Alignment padding in front of the allocation.
    pub fn padding(&self) -> vk::DeviceSize {
        self.total_size - self.size
    }

    /// Offset of the first byte after this block.
    pub fn end(&self) -> vk::DeviceSize {
        self.offset + self.total_size
    }

    pub fn is_free(&self) -> bool {
        self.free
    }
}

/// Result of a successful placement.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BlockAllocation {
    /// The in-use block backing this allocation.
    pub block: BlockId,
    /// Aligned offset of the allocation inside the heap.
    pub offset: vk::DeviceSize,
}

#[derive(Debug, Clone)]
struct Slot {
    generation: u32,
    block: Option<MemoryBlock>,
}

/// Arena-backed list of blocks covering one heap.
#[derive(Debug, Clone)]
pub struct BlockList {
    size: vk::DeviceSize,
    head: u32,
    slots: Vec<Slot>,
    // Arena slots that currently hold no block.
    recycled: Vec<u32>,
    used: vk::DeviceSize,
}

impl BlockList {
    /// Create a list with a single free block spanning `[0, size)`.
    pub fn new(size: vk::DeviceSize) -> Self {
        debug_assert!(size > 0, "block list must cover at least one byte");
        Self {
            size,
            head: 0,
            slots: vec![Slot {
                generation: 0,
                block: Some(MemoryBlock {
                    offset: 0,
                    size,
                    total_size: size,
                    free: true,
                    prev: None,
                    next: None,
                }),
            }],
            recycled: Vec::new(),
            used: 0,
        }
    }

    /// Size of the address range covered by this list.
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Bytes covered by in-use blocks, alignment padding included.
    pub fn used_bytes(&self) -> vk::DeviceSize {
        self.used
    }

    /// Number of blocks currently in the list, free or not.
    pub fn len(&self) -> usize {
        self.slots.len() - self.recycled.len()
    }

    /// True if the list consists of a single free block spanning the whole range.
    pub fn is_empty(&self) -> bool {
        let head = self.block(self.head);
        head.free && head.next.is_none() && head.offset == 0 && head.total_size == self.size
    }

    /// Iterate over all blocks in address order.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            list: self,
            cursor: Some(self.head),
        }
    }

    /// Look up an in-use block. Returns `None` if the handle is stale.
    pub fn get(&self, id: BlockId) -> Option<&MemoryBlock> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.block.as_ref())
            .filter(|block| !block.free)
    }

    /// Find room for `size` bytes aligned to `alignment`. If `page_granularity` is larger than one, the allocation is placed so that it
    /// does not share a page of that size with its neighbours.
    ///
    /// Returns `Ok(None)` if no block can hold the allocation. This is an expected outcome, the caller should try another heap.
    /// # Errors
    /// * Fails if `size` is zero.
    pub fn allocate(
        &mut self,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
        page_granularity: vk::DeviceSize,
    ) -> Result<Option<BlockAllocation>> {
        if size == 0 {
            anyhow::bail!(Error::ZeroSizedAllocation);
        }

        let Some((index, aligned_offset, padding)) = self.find_fit(size, alignment, page_granularity) else {
            return Ok(None);
        };

        // Split off the remainder as a new free block
        let padded_size = padding + size;
        let block = *self.block(index);
        if block.size > padded_size {
            let remainder = self.insert(MemoryBlock {
                offset: block.offset + padded_size,
                size: block.size - padded_size,
                total_size: block.size - padded_size,
                free: true,
                prev: Some(index),
                next: block.next,
            });
            if let Some(next) = block.next {
                self.block_mut(next).prev = Some(remainder);
            }
            self.block_mut(index).next = Some(remainder);
        }

        let block = self.block_mut(index);
        block.size = size;
        block.total_size = padded_size;
        block.free = false;
        self.used += padded_size;

        #[cfg(debug_assertions)]
        self.validate();

        Ok(Some(BlockAllocation {
            block: BlockId {
                index,
                generation: self.slots[index as usize].generation,
            },
            offset: aligned_offset,
        }))
    }

    /// Release an in-use block and merge it with free neighbours.
    /// # Errors
    /// * Fails if the handle is stale or refers to a block that is already free. The list is left untouched.
    pub fn free(&mut self, id: BlockId) -> Result<()> {
        if self.get(id).is_none() {
            error!("Tried to free block {id:?}, which is not in use in this heap");
            anyhow::bail!(Error::InvalidAllocation);
        }

        let mut index = id.index;
        self.slots[index as usize].generation = self.slots[index as usize].generation.wrapping_add(1);
        let block = self.block_mut(index);
        block.free = true;
        block.size = block.total_size;
        let total_size = block.total_size;
        let prev = block.prev;
        self.used -= total_size;

        if let Some(prev) = prev {
            if self.block(prev).free {
                self.merge_next_into(prev);
                index = prev;
            }
        }

        if let Some(next) = self.block(index).next {
            if self.block(next).free {
                self.merge_next_into(index);
            }
        }

        #[cfg(debug_assertions)]
        self.validate();

        Ok(())
    }

    fn find_fit(
        &self,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
        page_granularity: vk::DeviceSize,
    ) -> Option<(u32, vk::DeviceSize, vk::DeviceSize)> {
        let mut cursor = Some(self.head);
        while let Some(index) = cursor {
            let block = self.block(index);
            cursor = block.next;
            if !block.free || block.size < size {
                continue;
            }

            let mut aligned_offset = align_up(block.offset, alignment);
            if page_granularity > 1 {
                if let Some(prev) = block.prev.map(|prev| self.block(prev)) {
                    if is_aliasing(prev.offset, prev.total_size, aligned_offset, page_granularity) {
                        aligned_offset = align_up(aligned_offset, page_granularity);
                    }
                }

                if let Some(next) = block.next.map(|next| self.block(next)) {
                    if is_aliasing(aligned_offset, size, next.offset, page_granularity) {
                        continue;
                    }
                }
            }

            let padding = aligned_offset - block.offset;
            if block.size >= padding + size {
                return Some((index, aligned_offset, padding));
            }
        }
        None
    }

    // Absorb the block after `index` into it and drop the absorbed block from the arena.
    fn merge_next_into(&mut self, index: u32) {
        let Some(next) = self.block(index).next else {
            return;
        };
        let absorbed = self.remove(next);
        if let Some(after) = absorbed.next {
            self.block_mut(after).prev = Some(index);
        }
        let block = self.block_mut(index);
        block.next = absorbed.next;
        block.size += absorbed.total_size;
        block.total_size += absorbed.total_size;
    }

    fn insert(&mut self, block: MemoryBlock) -> u32 {
        match self.recycled.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.generation = slot.generation.wrapping_add(1);
                slot.block = Some(block);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    block: Some(block),
                });
                (self.slots.len() - 1) as u32
            }
        }
    }

    fn remove(&mut self, index: u32) -> MemoryBlock {
        let slot = &mut self.slots[index as usize];
        slot.generation = slot.generation.wrapping_add(1);
        self.recycled.push(index);
        slot.block.take().expect("removed block must be linked")
    }

    fn block(&self, index: u32) -> &MemoryBlock {
        self.slots[index as usize]
            .block
            .as_ref()
            .expect("linked block index must refer to a live block")
    }

    fn block_mut(&mut self, index: u32) -> &mut MemoryBlock {
        self.slots[index as usize]
            .block
            .as_mut()
            .expect("linked block index must refer to a live block")
    }

    /// Walk the list and assert all structural invariants.
    #[cfg(debug_assertions)]
    fn validate(&self) {
        let head = self.block(self.head);
        assert!(head.prev.is_none(), "head block has a predecessor");
        assert_eq!(head.offset, 0, "head block does not start at zero");

        let mut visited = 0usize;
        let mut used = 0;
        let mut tail = self.head;
        let mut cursor = Some(self.head);
        while let Some(index) = cursor {
            let block = self.block(index);
            visited += 1;
            assert!(visited <= self.len(), "block list contains a cycle");
            assert!(block.size <= block.total_size, "block usable size exceeds its span");
            if block.free {
                assert_eq!(block.size, block.total_size, "free block lost its padding");
            } else {
                used += block.total_size;
            }

            if let Some(next_index) = block.next {
                let next = self.block(next_index);
                assert_eq!(next.prev, Some(index), "broken back link");
                assert!(block.end() <= next.offset, "blocks overlap");
                assert_eq!(block.end(), next.offset, "gap between blocks");
                assert!(!(block.free && next.free), "adjacent free blocks were not merged");
            }
            tail = index;
            cursor = block.next;
        }

        assert_eq!(visited, self.len(), "arena holds blocks that are not linked");
        assert_eq!(self.block(tail).end(), self.size, "blocks do not cover the whole range");
        assert_eq!(used, self.used, "used byte count is out of sync");

        // Walking back from the tail must visit the same number of blocks.
        let mut backwards = 0usize;
        let mut cursor = Some(tail);
        while let Some(index) = cursor {
            backwards += 1;
            cursor = self.block(index).prev;
        }
        assert_eq!(backwards, visited, "forward and backward chains differ");
    }
}

/// Iterator over the blocks of a [`BlockList`] in address order.
#[derive(Debug)]
pub struct Blocks<'a> {
    list: &'a BlockList,
    cursor: Option<u32>,
}

impl<'a> Iterator for Blocks<'a> {
    type Item = &'a MemoryBlock;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.list.block(self.cursor?);
        self.cursor = block.next;
        Some(block)
    }
}
