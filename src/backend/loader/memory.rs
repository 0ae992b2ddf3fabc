//! Memory managers.
//!
//! The builder never touches memory directly. It asks a [`MemoryManager`]
//! for one contiguous block per object, writes the finished image through
//! it, and hands it the list of fixups that must follow the object if it
//! moves.
//!
//! [`ArenaSpace`] simulates a dynamic space in ordinary heap memory: addresses
//! are synthetic, objects can be moved to any free spot, and allocation
//! pressure raises collection requests. It is what the CLI and the tests run
//! against. Real executable pages live in [`super::exec_memory`].

use std::collections::BTreeMap;

use tracing::{debug, trace};

use super::fixup::PackedFixups;
use super::Address;
use crate::backend::config::ArenaSection;
use crate::backend::error::{BuildError, BuildResult};

/// Object alignment in bytes for every memory manager
pub const OBJECT_ALIGNMENT: u64 = 16;

/// Kind of block being allocated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectTag {
    Code,
    /// Copy of an existing code object
    ClonedCode,
}

/// One allocation: a boxed region followed by raw bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRequest {
    pub boxed_words: usize,
    pub unboxed_bytes: usize,
    pub word_bytes: usize,
    pub tag: ObjectTag,
}

impl AllocationRequest {
    #[inline]
    pub fn size(&self) -> usize {
        self.boxed_words * self.word_bytes + self.unboxed_bytes
    }
}

/// Contract between the builder and the memory that holds code objects
pub trait MemoryManager {
    /// One contiguous block, or an error and no block at all
    fn allocate(&mut self, request: AllocationRequest) -> BuildResult<Address>;

    /// Return a block from a build that did not complete
    fn release(&mut self, base: Address);

    fn write(&mut self, address: Address, bytes: &[u8]) -> BuildResult<()>;

    fn read(&self, address: Address, len: usize) -> BuildResult<Vec<u8>>;

    /// Make the block executable. Nothing may run from it before this.
    fn make_executable(&mut self, base: Address, size: usize) -> BuildResult<()>;

    fn is_executable(&self, base: Address) -> bool;

    /// Remember the fixups to re-apply when the object at `base` moves
    fn register_relocatable_fixups(&mut self, base: Address, fixups: PackedFixups) -> BuildResult<()>;

    fn relocatable_fixups(&self, base: Address) -> Option<PackedFixups>;

    /// Copy the object to `new_base` and retire the old block. Fixups are the
    /// caller's job.
    fn move_object(&mut self, base: Address, new_base: Address) -> BuildResult<()>;

    /// Whether allocation pressure asked for a collection since the last call
    fn take_gc_request(&mut self) -> bool {
        false
    }

    fn bytes_in_use(&self) -> usize;
}

#[derive(Debug)]
struct Region {
    bytes: Vec<u8>,
    tag: ObjectTag,
    executable: bool,
    fixups: PackedFixups,
}

/// Simulated dynamic space
#[derive(Debug)]
pub struct ArenaSpace {
    base: Address,
    limit: Address,
    cursor: Address,
    regions: BTreeMap<Address, Region>,
    allocated_since_gc: usize,
    gc_threshold: usize,
    gc_requested: bool,
}

#[inline]
fn align_up(n: u64) -> u64 {
    n.div_ceil(OBJECT_ALIGNMENT) * OBJECT_ALIGNMENT
}

impl ArenaSpace {
    pub fn new(base: Address, size: usize, gc_threshold: usize) -> Self {
        let base = align_up(base);
        Self {
            base,
            limit: base + size as u64,
            cursor: base,
            regions: BTreeMap::new(),
            allocated_since_gc: 0,
            gc_threshold,
            gc_requested: false,
        }
    }

    pub fn from_config(section: &ArenaSection) -> Self {
        Self::new(section.base, section.size, section.gc_threshold)
    }

    /// Next address a bump allocation would return
    pub fn cursor(&self) -> Address {
        self.cursor
    }

    pub fn object_count(&self) -> usize {
        self.regions.len()
    }

    pub fn tag_of(&self, base: Address) -> Option<ObjectTag> {
        self.regions.get(&base).map(|r| r.tag)
    }

    fn region(&self, address: Address) -> Option<(Address, &Region)> {
        let (&start, region) = self.regions.range(..=address).next_back()?;
        (address < start + region.bytes.len() as u64).then_some((start, region))
    }

    fn span(&self, address: Address, len: usize) -> BuildResult<(Address, usize)> {
        let (start, region) = self
            .region(address)
            .ok_or_else(|| BuildError::Memory(format!("{:#x} is not inside an object", address)))?;
        let from = (address - start) as usize;
        if from + len > region.bytes.len() {
            return Err(BuildError::Memory(format!(
                "{} bytes at {:#x} run past the end of the object at {:#x}",
                len, address, start
            )));
        }
        Ok((start, from))
    }

    fn overlaps(&self, start: Address, len: u64, ignore: Address) -> bool {
        self.regions.iter().any(|(&b, r)| {
            b != ignore && start < b + r.bytes.len() as u64 && b < start + len
        })
    }
}

impl MemoryManager for ArenaSpace {
    fn allocate(&mut self, request: AllocationRequest) -> BuildResult<Address> {
        let size = request.size();
        let rounded = align_up(size as u64);
        let available = (self.limit - self.cursor) as usize;
        if rounded > available as u64 {
            return Err(BuildError::AllocationFailed {
                requested: size,
                available,
            });
        }
        let base = self.cursor;
        self.cursor += rounded;
        self.regions.insert(
            base,
            Region {
                bytes: vec![0; size],
                tag: request.tag,
                executable: false,
                fixups: PackedFixups::default(),
            },
        );
        self.allocated_since_gc += rounded as usize;
        if self.allocated_since_gc >= self.gc_threshold {
            self.allocated_since_gc = 0;
            self.gc_requested = true;
        }
        trace!(target: "codeload::loader", base, size, tag = ?request.tag, "Allocated");
        Ok(base)
    }

    fn release(&mut self, base: Address) {
        if let Some(region) = self.regions.remove(&base) {
            // Reclaim the tail so an aborted build leaves no trace
            if base + align_up(region.bytes.len() as u64) == self.cursor {
                self.cursor = base;
            }
            debug!(target: "codeload::loader", base, "Released block");
        }
    }

    fn write(&mut self, address: Address, bytes: &[u8]) -> BuildResult<()> {
        let (start, from) = self.span(address, bytes.len())?;
        if let Some(region) = self.regions.get_mut(&start) {
            region.bytes[from..from + bytes.len()].copy_from_slice(bytes);
        }
        Ok(())
    }

    fn read(&self, address: Address, len: usize) -> BuildResult<Vec<u8>> {
        let (start, from) = self.span(address, len)?;
        Ok(self.regions[&start].bytes[from..from + len].to_vec())
    }

    fn make_executable(&mut self, base: Address, size: usize) -> BuildResult<()> {
        let region = self
            .regions
            .get_mut(&base)
            .ok_or_else(|| BuildError::Memory(format!("no object at {:#x}", base)))?;
        if size > region.bytes.len() {
            return Err(BuildError::Memory(format!(
                "cannot protect {} bytes of a {}-byte object",
                size,
                region.bytes.len()
            )));
        }
        region.executable = true;
        Ok(())
    }

    fn is_executable(&self, base: Address) -> bool {
        self.regions.get(&base).is_some_and(|r| r.executable)
    }

    fn register_relocatable_fixups(&mut self, base: Address, fixups: PackedFixups) -> BuildResult<()> {
        let region = self
            .regions
            .get_mut(&base)
            .ok_or_else(|| BuildError::Memory(format!("no object at {:#x}", base)))?;
        region.fixups = fixups;
        Ok(())
    }

    fn relocatable_fixups(&self, base: Address) -> Option<PackedFixups> {
        self.regions.get(&base).map(|r| r.fixups.clone())
    }

    fn move_object(&mut self, base: Address, new_base: Address) -> BuildResult<()> {
        let len = self
            .regions
            .get(&base)
            .map(|r| r.bytes.len() as u64)
            .ok_or_else(|| BuildError::Memory(format!("no object at {:#x}", base)))?;
        if new_base % OBJECT_ALIGNMENT != 0 {
            return Err(BuildError::Memory(format!("{:#x} is not object-aligned", new_base)));
        }
        if new_base < self.base || new_base + len > self.limit {
            return Err(BuildError::Memory(format!("{:#x} is outside the arena", new_base)));
        }
        if self.overlaps(new_base, len, base) {
            return Err(BuildError::Memory(format!("{:#x} overlaps a live object", new_base)));
        }
        if let Some(region) = self.regions.remove(&base) {
            self.regions.insert(new_base, region);
        }
        self.cursor = self.cursor.max(new_base + align_up(len));
        debug!(target: "codeload::loader", from = base, to = new_base, "Moved object");
        Ok(())
    }

    fn take_gc_request(&mut self) -> bool {
        std::mem::take(&mut self.gc_requested)
    }

    fn bytes_in_use(&self) -> usize {
        self.regions.values().map(|r| r.bytes.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(bytes: usize) -> AllocationRequest {
        AllocationRequest {
            boxed_words: 2,
            unboxed_bytes: bytes,
            word_bytes: 8,
            tag: ObjectTag::Code,
        }
    }

    #[test]
    fn test_bump_allocation_is_aligned() {
        let mut arena = ArenaSpace::new(0x1000, 4096, usize::MAX);
        let a = arena.allocate(request(3)).unwrap();
        let b = arena.allocate(request(3)).unwrap();
        assert_eq!(a, 0x1000);
        assert_eq!(b, 0x1020);
        assert_eq!(arena.bytes_in_use(), 38);
    }

    #[test]
    fn test_exhaustion_leaves_no_block() {
        let mut arena = ArenaSpace::new(0x1000, 64, usize::MAX);
        let err = arena.allocate(request(100)).unwrap_err();
        assert_eq!(
            err,
            BuildError::AllocationFailed {
                requested: 116,
                available: 64
            }
        );
        assert_eq!(arena.object_count(), 0);
    }

    #[test]
    fn test_read_write_bounds() {
        let mut arena = ArenaSpace::new(0x1000, 4096, usize::MAX);
        let a = arena.allocate(request(8)).unwrap();
        arena.write(a + 20, &[1, 2, 3, 4]).unwrap();
        assert_eq!(arena.read(a + 20, 4).unwrap(), vec![1, 2, 3, 4]);
        assert!(arena.write(a + 22, &[0; 4]).is_err());
        assert!(arena.read(0x10, 1).is_err());
    }

    #[test]
    fn test_release_reclaims_tail() {
        let mut arena = ArenaSpace::new(0x1000, 4096, usize::MAX);
        let a = arena.allocate(request(8)).unwrap();
        arena.release(a);
        assert_eq!(arena.cursor(), 0x1000);
        assert!(!arena.is_executable(a));
    }

    #[test]
    fn test_move_keeps_bytes_and_fixups() {
        let mut arena = ArenaSpace::new(0x1000, 4096, usize::MAX);
        let a = arena.allocate(request(8)).unwrap();
        arena.write(a, &[9; 24]).unwrap();
        arena
            .register_relocatable_fixups(a, PackedFixups::from_offsets(&[4], &[]))
            .unwrap();
        arena.make_executable(a, 24).unwrap();

        arena.move_object(a, 0x1800).unwrap();
        assert_eq!(arena.read(0x1800, 24).unwrap(), vec![9; 24]);
        assert_eq!(arena.relocatable_fixups(0x1800).unwrap().len(), 1);
        assert!(arena.is_executable(0x1800));
        assert!(arena.read(a, 1).is_err());

        let b = arena.allocate(request(8)).unwrap();
        assert!(b >= 0x1820);
    }

    #[test]
    fn test_move_rejects_overlap() {
        let mut arena = ArenaSpace::new(0x1000, 4096, usize::MAX);
        let a = arena.allocate(request(8)).unwrap();
        let b = arena.allocate(request(8)).unwrap();
        assert!(arena.move_object(a, b).is_err());
        assert!(arena.move_object(a, a + 8).is_err());
        assert!(arena.move_object(a, 0x9000).is_err());
    }

    #[test]
    fn test_gc_threshold_raises_request_once() {
        let mut arena = ArenaSpace::new(0x1000, 4096, 64);
        arena.allocate(request(8)).unwrap();
        assert!(!arena.take_gc_request());
        arena.allocate(request(40)).unwrap();
        assert!(arena.take_gc_request());
        assert!(!arena.take_gc_request());
    }
}
