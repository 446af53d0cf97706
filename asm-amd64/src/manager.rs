//! Block lifecycle management for executable memory.

use crate::memory::{ExecutableMemory, PAGE_SIZE};

/// Pages per freshly mapped block.
pub const PAGES_PER_BLOCK: usize = 4;

/// How many completely empty blocks may linger before the emptiest one is
/// returned to the operating system.
pub const MAX_IDLE_BLOCKS: usize = 2;

/// Owns a list of [`ExecutableMemory`] blocks and places generated code into
/// them.
///
/// Allocation copies the caller's bytes into a fitting block and runs a patch
/// callback inside the writable window, so relocations can be written before
/// the block flips back to executable. The writable and executable states
/// never overlap with execution: single-threaded callers only.
#[derive(Default)]
pub struct MemoryManager {
    blocks: Vec<ExecutableMemory>,
}

impl MemoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies `bytes` into executable memory and returns the executable
    /// entry pointer.
    ///
    /// `patch` runs while the destination is writable; it receives the
    /// writable slice holding the copy and the address the bytes will
    /// execute at.
    pub fn add(
        &mut self,
        bytes: &[u8],
        patch: impl FnOnce(&mut [u8], usize),
    ) -> Result<*const u8, String> {
        if let Some((block, offset)) = self.place(bytes.len())? {
            let memory = &mut self.blocks[block];
            let entry = unsafe { memory.executable().add(offset) };

            memory.make_writable();
            // SAFETY: the frame at `offset` spans at least `bytes.len()`.
            let destination = unsafe {
                std::slice::from_raw_parts_mut(memory.writable().add(offset), bytes.len())
            };
            destination.copy_from_slice(bytes);
            patch(destination, entry as usize);
            memory.make_executable();

            return Ok(entry);
        }

        Err("Failed to insert code block".to_string())
    }

    /// Releases the allocation behind an executable entry pointer. Frees the
    /// backing block once it is empty and enough other blocks are idle.
    pub fn remove(&mut self, entry: *const u8) {
        let position = self
            .blocks
            .iter()
            .position(|memory| entry >= memory.executable() && entry < memory.executable_end());

        let Some(position) = position else { return };

        let offset = entry as usize - self.blocks[position].executable() as usize;
        self.blocks[position].deallocate(offset);

        if self.blocks[position].is_empty() && self.idle_blocks() > MAX_IDLE_BLOCKS {
            self.blocks.remove(position);
        }
    }

    /// Total bytes across all blocks.
    pub fn total_capacity(&self) -> usize {
        self.blocks.iter().map(ExecutableMemory::total_bytes).sum()
    }

    /// Total unallocated bytes across all blocks.
    pub fn total_capacity_left(&self) -> usize {
        self.blocks.iter().map(ExecutableMemory::bytes_left).sum()
    }

    /// Count of completely empty blocks.
    pub fn idle_blocks(&self) -> usize {
        self.blocks.iter().filter(|memory| memory.is_empty()).count()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Finds (or creates) a block with a frame for `len` bytes.
    fn place(&mut self, len: usize) -> Result<Option<(usize, usize)>, String> {
        for (position, memory) in self.blocks.iter_mut().enumerate() {
            if let Some(offset) = memory.allocate(len) {
                return Ok(Some((position, offset)));
            }
        }

        // No block fits; map a new one, oversized requests get their own
        // generously rounded block.
        let mut pages = PAGES_PER_BLOCK;
        if PAGES_PER_BLOCK * PAGE_SIZE < len {
            pages = (len / PAGE_SIZE + 1) * 4;
        }

        let mut memory = ExecutableMemory::new(pages)?;
        let offset = memory.allocate(len);
        self.blocks.insert(0, memory);

        Ok(offset.map(|offset| (0, offset)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_copies_and_returns_executable_entry() {
        let mut manager = MemoryManager::new();
        let code = [0xC3u8; 32]; // RET sled

        let mut seen_entry = 0;
        let entry = manager
            .add(&code, |writable, entry| {
                assert_eq!(writable.len(), 32);
                writable[0] = 0x90;
                seen_entry = entry;
            })
            .unwrap();

        assert_eq!(entry as usize, seen_entry);
        assert_eq!(unsafe { *entry }, 0x90);
        assert_eq!(manager.block_count(), 1);
        assert_eq!(manager.total_capacity(), PAGES_PER_BLOCK * PAGE_SIZE);
    }

    #[test]
    fn oversized_requests_get_a_bigger_block() {
        let mut manager = MemoryManager::new();
        let code = vec![0x90u8; PAGES_PER_BLOCK * PAGE_SIZE + 1];

        let entry = manager.add(&code, |_, _| {}).unwrap();
        assert!(!entry.is_null());
        assert!(manager.total_capacity() > PAGES_PER_BLOCK * PAGE_SIZE);
    }

    #[test]
    fn remove_reclaims_surplus_idle_blocks() {
        let mut manager = MemoryManager::new();
        let block_size = PAGES_PER_BLOCK * PAGE_SIZE;

        // Force four distinct blocks by filling each completely.
        let entries: Vec<_> = (0..4)
            .map(|_| manager.add(&vec![0x90u8; block_size], |_, _| {}).unwrap())
            .collect();
        assert_eq!(manager.block_count(), 4);

        // Free them all: up to MAX_IDLE_BLOCKS + 1 empty blocks may stay
        // around (the budget is only enforced when exceeded).
        for entry in entries {
            manager.remove(entry);
        }
        assert!(manager.idle_blocks() <= MAX_IDLE_BLOCKS + 1);
        assert!(manager.block_count() < 4);
    }

    #[test]
    fn reuses_space_within_a_block() {
        let mut manager = MemoryManager::new();

        let first = manager.add(&[0x90u8; 64], |_, _| {}).unwrap();
        let _second = manager.add(&[0x90u8; 64], |_, _| {}).unwrap();
        assert_eq!(manager.block_count(), 1);

        manager.remove(first);
        let third = manager.add(&[0x90u8; 64], |_, _| {}).unwrap();
        assert_eq!(third, first, "freed frame should be reused best-fit");
        assert_eq!(manager.block_count(), 1);
    }
}
