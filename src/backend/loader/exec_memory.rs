//! Executable memory backed by mmap.
//!
//! Every object gets its own private anonymous mapping. Pages start
//! read-write, become read-execute in `make_executable`, and are flipped back
//! to read-write only for the duration of a late patch, so no page is ever
//! writable and executable at once.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::ptr;

use tracing::debug;

use super::fixup::PackedFixups;
use super::memory::{AllocationRequest, MemoryManager};
use super::Address;
use crate::backend::error::{BuildError, BuildResult};

struct Mapping {
    ptr: *mut u8,
    mapped: usize,
    size: usize,
    executable: bool,
    fixups: PackedFixups,
}

/// Code objects in real executable pages of this process
pub struct MmapSpace {
    mappings: BTreeMap<Address, Mapping>,
    page_size: usize,
}

// Safety: mappings are owned exclusively by this space; pointers are only
// dereferenced through `&mut self` (writes) or `&self` (reads of live pages).
unsafe impl Send for MmapSpace {}

impl std::fmt::Debug for MmapSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmapSpace")
            .field("objects", &self.mappings.len())
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl Default for MmapSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl MmapSpace {
    pub fn new() -> Self {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        Self {
            mappings: BTreeMap::new(),
            page_size: if page_size > 0 { page_size as usize } else { 4096 },
        }
    }

    fn locate(&self, address: Address, len: usize) -> BuildResult<(Address, usize)> {
        let (&start, mapping) = self
            .mappings
            .range(..=address)
            .next_back()
            .ok_or_else(|| BuildError::Memory(format!("{:#x} is not inside an object", address)))?;
        let from = (address - start) as usize;
        if from + len > mapping.size {
            return Err(BuildError::Memory(format!(
                "{} bytes at {:#x} run past the end of the object at {:#x}",
                len, address, start
            )));
        }
        Ok((start, from))
    }

    fn protect(mapping: &Mapping, prot: libc::c_int) -> BuildResult<()> {
        let rc = unsafe { libc::mprotect(mapping.ptr as *mut libc::c_void, mapping.mapped, prot) };
        if rc != 0 {
            return Err(BuildError::Memory(format!(
                "mprotect failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}

impl MemoryManager for MmapSpace {
    fn allocate(&mut self, request: AllocationRequest) -> BuildResult<Address> {
        let size = request.size();
        if size == 0 {
            return Err(BuildError::Memory("empty allocation".into()));
        }
        let mapped = size.div_ceil(self.page_size) * self.page_size;

        #[cfg(target_os = "macos")]
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_JIT;
        #[cfg(not(target_os = "macos"))]
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if mem == libc::MAP_FAILED {
            return Err(BuildError::AllocationFailed {
                requested: size,
                available: 0,
            });
        }
        let base = mem as Address;
        self.mappings.insert(
            base,
            Mapping {
                ptr: mem as *mut u8,
                mapped,
                size,
                executable: false,
                fixups: PackedFixups::default(),
            },
        );
        debug!(target: "codeload::loader", base, size, mapped, "Mapped object");
        Ok(base)
    }

    fn release(&mut self, base: Address) {
        if let Some(mapping) = self.mappings.remove(&base) {
            unsafe {
                libc::munmap(mapping.ptr as *mut libc::c_void, mapping.mapped);
            }
        }
    }

    fn write(&mut self, address: Address, bytes: &[u8]) -> BuildResult<()> {
        let (start, from) = self.locate(address, bytes.len())?;
        let mapping = &self.mappings[&start];
        if mapping.executable {
            Self::protect(mapping, libc::PROT_READ | libc::PROT_WRITE)?;
        }
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), mapping.ptr.add(from), bytes.len());
        }
        if mapping.executable {
            Self::protect(mapping, libc::PROT_READ | libc::PROT_EXEC)?;
        }
        Ok(())
    }

    fn read(&self, address: Address, len: usize) -> BuildResult<Vec<u8>> {
        let (start, from) = self.locate(address, len)?;
        let mapping = &self.mappings[&start];
        let mut out = vec![0u8; len];
        unsafe {
            ptr::copy_nonoverlapping(mapping.ptr.add(from), out.as_mut_ptr(), len);
        }
        Ok(out)
    }

    fn make_executable(&mut self, base: Address, size: usize) -> BuildResult<()> {
        let mapping = self
            .mappings
            .get_mut(&base)
            .ok_or_else(|| BuildError::Memory(format!("no object at {:#x}", base)))?;
        if size > mapping.size {
            return Err(BuildError::Memory(format!(
                "cannot protect {} bytes of a {}-byte object",
                size, mapping.size
            )));
        }
        Self::protect(mapping, libc::PROT_READ | libc::PROT_EXEC)?;
        mapping.executable = true;
        Ok(())
    }

    fn is_executable(&self, base: Address) -> bool {
        self.mappings.get(&base).is_some_and(|m| m.executable)
    }

    fn register_relocatable_fixups(&mut self, base: Address, fixups: PackedFixups) -> BuildResult<()> {
        let mapping = self
            .mappings
            .get_mut(&base)
            .ok_or_else(|| BuildError::Memory(format!("no object at {:#x}", base)))?;
        mapping.fixups = fixups;
        Ok(())
    }

    fn relocatable_fixups(&self, base: Address) -> Option<PackedFixups> {
        self.mappings.get(&base).map(|m| m.fixups.clone())
    }

    fn move_object(&mut self, base: Address, new_base: Address) -> BuildResult<()> {
        Err(BuildError::Memory(format!(
            "mmap space cannot place {:#x} at a chosen address {:#x}",
            base, new_base
        )))
    }

    fn bytes_in_use(&self) -> usize {
        self.mappings.values().map(|m| m.size).sum()
    }
}

impl Drop for MmapSpace {
    fn drop(&mut self) {
        for mapping in self.mappings.values() {
            unsafe {
                libc::munmap(mapping.ptr as *mut libc::c_void, mapping.mapped);
            }
        }
    }
}

/// Address of a symbol in the running process, via `dlsym`
pub fn process_symbol(name: &str) -> Option<Address> {
    let name = CString::new(name).ok()?;
    let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
    if addr.is_null() {
        None
    } else {
        Some(addr as Address)
    }
}
