//! Size-partitioned free lists for atlas-sized pixel buffers (§4.7).
//!
//! Buffers are always RGBA8: 4 bytes per pixel. `acquire` hands back a
//! buffer cleared to transparent; `release` returns it to its size class's
//! free list unless full, in which case the buffer is simply dropped.

use parking_lot::Mutex;

use crate::memory::Pressure;

const SMALL: u32 = 2048;
const MEDIUM: u32 = 4096;
const LARGE: u32 = 8192;

const SMALL_CAP: usize = 4;
const MEDIUM_CAP: usize = 2;
const LARGE_CAP: usize = 1;

struct FreeList {
    size: u32,
    capacity: usize,
    buffers: Vec<Vec<u8>>,
}

impl FreeList {
    fn new(size: u32, capacity: usize) -> Self {
        FreeList {
            size,
            capacity,
            buffers: Vec::with_capacity(capacity),
        }
    }

    fn byte_len(size: u32) -> usize {
        size as usize * size as usize * 4
    }

    fn acquire(&mut self) -> Option<Vec<u8>> {
        self.buffers.pop().map(|mut buf| {
            buf.iter_mut().for_each(|b| *b = 0);
            buf
        })
    }

    fn release(&mut self, buffer: Vec<u8>) {
        if self.buffers.len() < self.capacity && buffer.len() == Self::byte_len(self.size) {
            self.buffers.push(buffer);
        }
    }

    fn drain(&mut self) {
        self.buffers.clear();
    }
}

/// A pool of reusable atlas-sized RGBA8 pixel buffers, partitioned by the
/// three fixed atlas sizes.
pub struct BitmapPool {
    small: Mutex<FreeList>,
    medium: Mutex<FreeList>,
    large: Mutex<FreeList>,
}

impl Default for BitmapPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BitmapPool {
    pub fn new() -> Self {
        BitmapPool {
            small: Mutex::new(FreeList::new(SMALL, SMALL_CAP)),
            medium: Mutex::new(FreeList::new(MEDIUM, MEDIUM_CAP)),
            large: Mutex::new(FreeList::new(LARGE, LARGE_CAP)),
        }
    }

    fn list_for(&self, size: u32) -> Option<&Mutex<FreeList>> {
        match size {
            SMALL => Some(&self.small),
            MEDIUM => Some(&self.medium),
            LARGE => Some(&self.large),
            _ => None,
        }
    }

    /// Returns a validated buffer of `size × size` RGBA8 pixels, cleared to
    /// transparent. Allocates a fresh buffer if the free list is empty or
    /// `size` isn't one of the three recognized atlas sizes.
    pub fn acquire(&self, size: u32) -> Vec<u8> {
        if let Some(list) = self.list_for(size) {
            if let Some(buf) = list.lock().acquire() {
                return buf;
            }
        }

        vec![0u8; FreeList::byte_len(size)]
    }

    /// Returns `buffer` to its size class's free list, unless that list is
    /// already full, in which case the buffer is dropped.
    pub fn release(&self, size: u32, buffer: Vec<u8>) {
        if let Some(list) = self.list_for(size) {
            list.lock().release(buffer);
        }
    }

    /// Drains all free lists on `Low`/`Medium`/`High` pressure. `Critical`
    /// cleanup is the memory manager's responsibility, not the pool's.
    pub fn on_pressure(&self, pressure: Pressure) {
        match pressure {
            Pressure::Low | Pressure::Medium | Pressure::High => {
                self.small.lock().drain();
                self.medium.lock().drain();
                self.large.lock().drain();
            },
            Pressure::Normal | Pressure::Critical => {},
        }
    }
}
