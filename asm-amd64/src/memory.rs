//! Page-protected executable memory blocks.

use std::io::Error;
use std::ptr;

/// Size of one memory page.
pub const PAGE_SIZE: usize = 4096;

/// Threshold below which a frame is handed out whole instead of split:
/// slivers smaller than this are useless and only fragment the block.
const OVERHANG_THRESHOLD: usize = 8;

/// Allocation state of a [`Frame`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameState {
    Free,
    InUse,
}

/// A contiguous span within an [`ExecutableMemory`] block. The frames of a
/// block always tile it completely, in offset order, and two adjacent free
/// frames are merged on every deallocation.
#[derive(Clone, Copy, Debug)]
pub struct Frame {
    pub state: FrameState,
    pub offset: usize,
    pub size: usize,
}

/// One mmap'd region hosting generated code.
///
/// The region is never writable and executable at the same time: it is
/// mapped read-only, flips to read-write around mutations and to
/// read-execute for running.
pub struct ExecutableMemory {
    address: *mut libc::c_void,
    byte_size: usize,
    frames: Vec<Frame>,
}

impl ExecutableMemory {
    /// Maps a fresh block of `pages` pages.
    pub fn new(pages: usize) -> Result<Self, String> {
        let byte_size = pages * PAGE_SIZE;

        // SAFETY: anonymous private mapping, unobservable by anyone else.
        let address = unsafe {
            libc::mmap(
                ptr::null_mut(),
                byte_size,
                libc::PROT_READ,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if address == libc::MAP_FAILED {
            return Err(format!("Failed to acquire memory: {}", Error::last_os_error()));
        }

        Ok(Self {
            address,
            byte_size,
            frames: vec![Frame { state: FrameState::Free, offset: 0, size: byte_size }],
        })
    }

    /// Total size of the block in bytes.
    pub fn total_bytes(&self) -> usize {
        self.byte_size
    }

    /// Sum of all free frame sizes.
    pub fn bytes_left(&self) -> usize {
        self.frames
            .iter()
            .filter(|frame| frame.state == FrameState::Free)
            .map(|frame| frame.size)
            .sum()
    }

    /// Does the block host no allocations at all?
    pub fn is_empty(&self) -> bool {
        self.frames.len() == 1 && self.frames[0].state == FrameState::Free
    }

    /// The frame tiling, for diagnostics and tests.
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Remaps the whole block read-write.
    pub fn make_writable(&mut self) {
        // SAFETY: remapping our own region.
        let result = unsafe {
            libc::mprotect(self.address, self.byte_size, libc::PROT_READ | libc::PROT_WRITE)
        };
        assert_eq!(result, 0, "mprotect(READ|WRITE) failed");
    }

    /// Remaps the whole block read-execute.
    pub fn make_executable(&mut self) {
        // SAFETY: remapping our own region.
        let result = unsafe {
            libc::mprotect(self.address, self.byte_size, libc::PROT_READ | libc::PROT_EXEC)
        };
        assert_eq!(result, 0, "mprotect(READ|EXEC) failed");
    }

    /// Base pointer for writing; only valid between [`Self::make_writable`]
    /// and [`Self::make_executable`].
    pub fn writable(&mut self) -> *mut u8 {
        self.address as *mut u8
    }

    /// Base pointer of the executable mapping.
    pub fn executable(&self) -> *const u8 {
        self.address as *const u8
    }

    /// One past the last executable byte.
    pub fn executable_end(&self) -> *const u8 {
        // SAFETY: stays within the mapping plus one.
        unsafe { self.executable().add(self.byte_size) }
    }

    /// Reserves `len` bytes and returns their block offset, or `None` when
    /// no frame fits.
    ///
    /// Best-fit with a first-fit fallback: the smallest free frame that
    /// holds `len` wins; if the winner leaves more than a sliver behind it
    /// is split into an in-use head and a free tail.
    pub fn allocate(&mut self, len: usize) -> Option<usize> {
        let mut first = None;
        let mut best: Option<usize> = None;
        let mut best_size = usize::MAX;

        for (position, frame) in self.frames.iter().enumerate() {
            if frame.state == FrameState::Free && frame.size >= len {
                if first.is_none() {
                    first = Some(position);
                }
                if frame.size < best_size {
                    best = Some(position);
                    best_size = frame.size;

                    // An exact fit can't be beaten.
                    if best_size == len {
                        break;
                    }
                }
            }
        }

        let position = best.or(first)?;
        let frame = &mut self.frames[position];
        frame.state = FrameState::InUse;

        if frame.size > len + OVERHANG_THRESHOLD {
            let tail = Frame {
                state: FrameState::Free,
                offset: frame.offset + len,
                size: frame.size - len,
            };
            frame.size = len;
            let offset = frame.offset;
            self.frames.insert(position + 1, tail);
            return Some(offset);
        }

        Some(frame.offset)
    }

    /// Releases the allocation starting at `offset`, merging the freed frame
    /// with free neighbours on both sides.
    pub fn deallocate(&mut self, offset: usize) {
        let position = self
            .frames
            .iter()
            .position(|frame| frame.offset == offset)
            .unwrap_or_else(|| panic!("deallocate: offset {offset} not found - corruption?"));

        self.frames[position].state = FrameState::Free;

        // Merge with the right neighbour first so `position` stays valid.
        if position + 1 < self.frames.len() && self.frames[position + 1].state == FrameState::Free {
            self.frames[position].size += self.frames[position + 1].size;
            self.frames.remove(position + 1);
        }

        if position > 0 && self.frames[position - 1].state == FrameState::Free {
            self.frames[position - 1].size += self.frames[position].size;
            self.frames.remove(position);
        }
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        // SAFETY: unmapping the region this struct owns.
        unsafe {
            libc::munmap(self.address, self.byte_size);
        }
    }
}
