use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use log::debug;
use unicorn_engine::Permission;

use crate::RuntimeError;
use crate::device::UnicornContext;

/// Mapping granularity of the engine.
pub const PAGE_SIZE: usize = 0x1000;

/// Zero-filled host memory shared between the engine and the host.
///
/// The engine writes through raw pointers handed out by [`MemoryRegion::host_ptr`], possibly at several guest
/// addresses, so the bytes live in cells and host-side accesses never hold a plain reference into them.
pub struct Backing {
    cells: Box<[Cell<u8>]>,
}

impl Backing {
    /// Returns `None` if `size` is zero or the host is out of memory.
    pub fn new(size: usize) -> Option<Self> {
        if size == 0 {
            return None;
        }
        let mut cells = Vec::new();
        cells.try_reserve_exact(size).ok()?;
        cells.resize_with(size, Cell::default);
        Some(Self { cells: cells.into_boxed_slice() })
    }

    fn range(&self, offset: usize, len: usize) -> Option<&[Cell<u8>]> {
        self.cells.get(offset..offset.checked_add(len)?)
    }

    pub fn read(&self, offset: usize, buf: &mut [u8]) -> bool {
        let Some(src) = self.range(offset, buf.len()) else {
            return false;
        };
        for (dst, cell) in buf.iter_mut().zip(src) {
            *dst = cell.get();
        }
        true
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> bool {
        let Some(dst) = self.range(offset, data.len()) else {
            return false;
        };
        for (cell, &byte) in dst.iter().zip(data) {
            cell.set(byte);
        }
        true
    }

    fn as_mut_ptr(&self) -> *mut u8 {
        self.cells.as_ptr().cast_mut().cast()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionKind {
    /// Read-only to the guest, writable by the host (firmware loading).
    Rom,
    Ram,
    /// A window onto another region's storage.
    Alias,
}

pub struct MemoryRegion {
    name: String,
    kind: RegionKind,
    backing: Rc<Backing>,
    offset: usize,
    size: usize,
    readonly: bool,
    alias_of: Option<String>,
}

impl MemoryRegion {
    fn with_backing(name: &str, kind: RegionKind, size: usize, readonly: bool) -> Result<Self, RuntimeError> {
        let backing = Backing::new(size)
            .ok_or_else(|| RuntimeError::BackingAllocation { name: name.to_owned(), size })?;
        Ok(Self {
            name: name.to_owned(),
            kind,
            backing: Rc::new(backing),
            offset: 0,
            size,
            readonly,
            alias_of: None,
        })
    }

    pub fn init_rom(name: &str, size: usize) -> Result<Self, RuntimeError> {
        Self::with_backing(name, RegionKind::Rom, size, true)
    }

    pub fn init_ram(name: &str, size: usize) -> Result<Self, RuntimeError> {
        Self::with_backing(name, RegionKind::Ram, size, false)
    }

    /// Create a view of `size` bytes of `target` starting at `offset`. No memory is allocated.
    pub fn init_alias(name: &str, target: &MemoryRegion, offset: usize, size: usize) -> Result<Self, RuntimeError> {
        if offset.checked_add(size).is_none_or(|end| end > target.size) {
            return Err(RuntimeError::AliasOutOfRange { name: name.to_owned(), target: target.name.clone() });
        }
        Ok(Self {
            name: name.to_owned(),
            kind: RegionKind::Alias,
            backing: Rc::clone(&target.backing),
            offset: target.offset + offset,
            size,
            readonly: target.readonly,
            alias_of: Some(target.name.clone()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn alias_of(&self) -> Option<&str> {
        self.alias_of.as_deref()
    }

    /// Guest permissions when mapped.
    pub fn perms(&self) -> Permission {
        if self.readonly { Permission::READ | Permission::EXEC } else { Permission::ALL }
    }

    /// Whether both regions are views of the same storage.
    pub fn shares_backing(&self, other: &MemoryRegion) -> bool {
        Rc::ptr_eq(&self.backing, &other.backing)
    }

    /// Start of this region's bytes in host memory.
    pub fn host_ptr(&self) -> *mut u8 {
        self.backing.as_mut_ptr().wrapping_add(self.offset)
    }

    fn host_range(&self, offset: usize, len: usize) -> Result<usize, RuntimeError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(self.offset + offset),
            _ => Err(RuntimeError::ImageTooLarge { size: (offset as u64).saturating_add(len as u64), capacity: self.size }),
        }
    }

    /// Host-side read, regardless of guest permissions.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), RuntimeError> {
        let start = self.host_range(offset, buf.len())?;
        self.backing.read(start, buf);
        Ok(())
    }

    /// Host-side write, regardless of guest permissions.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), RuntimeError> {
        let start = self.host_range(offset, data.len())?;
        self.backing.write(start, data);
        Ok(())
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("readonly", &self.readonly)
            .finish()
    }
}

#[derive(Debug)]
pub struct Mapping {
    pub base: u64,
    pub region: MemoryRegion,
}

impl Mapping {
    /// One past the last mapped address.
    pub fn end(&self) -> u64 {
        self.base + self.region.size() as u64
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }
}

/// The system address space: every region mapped into the core, in insertion order.
#[derive(Default, Debug)]
pub struct AddressSpace {
    mappings: Vec<Mapping>,
}

impl AddressSpace {
    /// Check that `region` can be mapped at `base`.
    pub fn check(&self, base: u64, region: &MemoryRegion) -> Result<(), RuntimeError> {
        let page_mask = PAGE_SIZE as u64 - 1;
        if base & page_mask != 0 || region.size() % PAGE_SIZE != 0 {
            return Err(RuntimeError::RegionMisaligned { name: region.name.clone(), base, size: region.size() });
        }
        let end = base + region.size() as u64;
        if let Some(other) = self.mappings.iter().find(|m| base < m.end() && m.base < end) {
            return Err(RuntimeError::RegionOverlap { name: region.name.clone(), other: other.region.name.clone() });
        }
        Ok(())
    }

    /// Record a mapping without touching the engine.
    pub fn insert(&mut self, base: u64, region: MemoryRegion) -> Result<(), RuntimeError> {
        self.check(base, &region)?;
        self.mappings.push(Mapping { base, region });
        Ok(())
    }

    /// Find the mapping covering `addr` and the offset into it.
    pub fn resolve(&self, addr: u64) -> Option<(&Mapping, usize)> {
        self.mappings
            .iter()
            .find(|m| m.contains(addr))
            .map(|m| (m, (addr - m.base) as usize))
    }

    pub fn find(&self, name: &str) -> Option<&Mapping> {
        self.mappings.iter().find(|m| m.region.name() == name)
    }

    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    /// Host-side read of guest memory. The range must lie within one mapping.
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), RuntimeError> {
        let (mapping, offset) =
            self.resolve(addr).ok_or_else(|| RuntimeError::UnknownRegion(format!("0x{addr:08x}")))?;
        mapping.region.read(offset, buf)
    }
}

impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sorted: Vec<&Mapping> = self.mappings.iter().collect();
        sorted.sort_by_key(|m| m.base);
        for m in sorted {
            let access = if m.region.is_readonly() { "r-x" } else { "rwx" };
            write!(f, "0x{:08x}-0x{:08x} {access} {}", m.base, m.end() - 1, m.region.name())?;
            if let Some(target) = m.region.alias_of() {
                write!(f, " -> {target}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Map `region` into the engine at `base` and record it in the core's address space.
pub fn add_subregion(uc: &mut UnicornContext, base: u64, region: MemoryRegion) -> Result<(), RuntimeError> {
    uc.get_data().memory.check(base, &region)?;
    // SAFETY: the pointer covers `region.size()` bytes of a live allocation. The address space takes ownership of
    // the region right after, and it is dropped only after the engine is closed.
    unsafe { uc.mem_map_ptr(base, region.size(), region.perms(), region.host_ptr().cast())? };
    debug!("memory: mapped {} at 0x{base:08x} (0x{:x} bytes)", region.name(), region.size());
    uc.get_data_mut().memory.insert(base, region)?;
    Ok(())
}
