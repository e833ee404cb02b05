//! Block-structured dense array backing a leaf.
//!
//! Slots `[0, len)` are live, slots `[len, capacity)` are `None`. The first block
//! grows by doubling up to `block_size`; beyond that, whole blocks of
//! `block_size` are appended, so growth never copies more than one block.

pub(crate) struct BlockArray<T> {
    blocks: Vec<Vec<Option<T>>>,
    len: usize,
    /// Total slots across all blocks.
    capacity: usize,
    block_size: usize,
    min_size: usize,
}

impl<T> BlockArray<T> {
    pub(crate) fn new(block_size: usize, min_size: usize) -> Self {
        Self {
            blocks: Vec::new(),
            len: 0,
            capacity: 0,
            block_size,
            min_size: min_size.min(block_size),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn min_size(&self) -> usize {
        self.min_size
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    #[cfg(test)]
    pub(crate) fn block_count(&self) -> usize {
        self.blocks.len()
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.blocks.iter().map(Vec::len).sum()
    }

    // Only the first block may be shorter than `block_size`, and only while it is
    // the sole block, so plain division locates any slot.
    fn locate(&self, index: usize) -> (usize, usize) {
        (index / self.block_size, index % self.block_size)
    }

    pub(crate) fn get(&self, index: usize) -> Option<&T> {
        if index >= self.len {
            return None;
        }
        let (b, o) = self.locate(index);
        self.blocks[b][o].as_ref()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.blocks.iter().flatten().take(self.len).flatten()
    }

    pub(crate) fn push(&mut self, value: T) {
        if self.len == self.capacity {
            self.grow();
        }
        let (b, o) = self.locate(self.len);
        self.blocks[b][o] = Some(value);
        self.len += 1;
    }

    fn grow(&mut self) {
        let cap = self.capacity;
        match self.blocks.len() {
            0 => {
                self.blocks.push(empty_block(self.min_size));
                self.capacity = self.min_size;
            }
            1 if cap < self.block_size => {
                let next = (cap * 2).min(self.block_size);
                self.blocks[0].resize_with(next, || None);
                self.capacity = next;
            }
            _ => {
                self.blocks.push(empty_block(self.block_size));
                self.capacity += self.block_size;
            }
        }
    }

    /// Remove the slot at `index`, moving the last live slot into its place.
    pub(crate) fn swap_remove(&mut self, index: usize) -> Option<T> {
        if index >= self.len {
            return None;
        }
        let last = self.len - 1;
        let tail = self.take(last);
        let out = if index == last {
            tail
        } else {
            let (b, o) = self.locate(index);
            std::mem::replace(&mut self.blocks[b][o], tail)
        };
        self.len = last;
        self.maybe_shrink();
        out
    }

    /// Take the value out of a live slot, leaving a hole. Used by compaction,
    /// which must refill or truncate before anything else touches the array.
    pub(crate) fn take(&mut self, index: usize) -> Option<T> {
        let (b, o) = self.locate(index);
        self.blocks.get_mut(b)?.get_mut(o)?.take()
    }

    pub(crate) fn put(&mut self, index: usize, value: T) {
        let (b, o) = self.locate(index);
        self.blocks[b][o] = Some(value);
    }

    /// Finish a compaction: `[0, len)` must be filled and everything past it empty.
    pub(crate) fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.capacity);
        self.len = len;
        self.maybe_shrink();
    }

    /// Release storage once utilisation drops below a quarter.
    fn maybe_shrink(&mut self) {
        let cap = self.capacity;
        if cap <= self.min_size || self.len * 4 >= cap {
            return;
        }

        if self.blocks.len() > 1 {
            // Keep the blocks in use plus one spare so an add right after a
            // remove does not reallocate.
            let used = self.len.div_ceil(self.block_size).max(1);
            let keep = (used + 1).min(self.blocks.len());
            self.blocks.truncate(keep);
            // With more than one block, every block is full size.
            self.capacity = keep * self.block_size;
        } else {
            let target = (self.len * 2).next_power_of_two().max(self.min_size);
            if target < cap {
                self.blocks[0].truncate(target);
                self.blocks[0].shrink_to_fit();
                self.capacity = target;
            }
        }
    }
}

fn empty_block<T>(size: usize) -> Vec<Option<T>> {
    let mut block = Vec::with_capacity(size);
    block.resize_with(size, || None);
    block
}
