//! Paged guest memory.
//!
//! The page table is a sparse map from page number to [`Page`]. Three
//! access paths exist, fastest first: the flat arena (when enabled and
//! the access is inside its boundaries), a direct-mapped cache of the
//! pages last touched for read and for write, and the page-table walk.
//! Missing pages read as zero and are materialised on the write path by
//! the pluggable page-fault handler; copy-on-write pages are resolved
//! by the pluggable page-write handler.

use crate::arch::{page_base, page_number, page_offset, page_round_up, Address, PAGE_SIZE};
use crate::arena::Arena;
use crate::error::MachineError;
use crate::mmap::MmapAllocator;
use crate::page::{MmioHandler, Page, PageAttributes, PageBuffer};
use crate::segment::ExecuteSegment;
use std::cell::{Ref, RefCell};
use std::collections::BTreeMap;
use std::ops::Deref;
use std::rc::Rc;

/// Hard cap on live execute segments; the registry reuses slots
/// round-robin beyond it.
pub const MAX_EXECUTE_SEGS: usize = 8;

/// Creates the page for `pageno` on a faulting write. Must insert the
/// page (or return an error such as out-of-memory).
pub type PageFaultHandler = fn(&mut Memory, Address) -> Result<(), MachineError>;

/// Invoked when the read path misses the page table. The default leaves
/// the page absent; absent pages read as zero.
pub type PageReadFaultHandler = fn(&mut Memory, Address) -> Result<(), MachineError>;

/// Resolves a write to a copy-on-write page.
pub type PageWriteHandler = fn(&mut Page);

fn default_page_fault(mem: &mut Memory, pageno: Address) -> Result<(), MachineError> {
    mem.alloc_page(pageno, PageAttributes::rw())?;
    Ok(())
}

fn default_page_read_fault(_mem: &mut Memory, _pageno: Address) -> Result<(), MachineError> {
    Ok(())
}

fn default_page_write(page: &mut Page) {
    page.make_writable();
}

/// Fixed-size values that can be moved in and out of guest memory.
pub trait Primitive: Copy + Default {
    const SIZE: usize;
    fn from_le_slice(bytes: &[u8]) -> Self;
    fn to_le_slice(self, out: &mut [u8]);
    fn to_u64(self) -> u64;
    fn from_u64(value: u64) -> Self;
}

macro_rules! impl_primitive {
    ($($t:ty),*) => {$(
        impl Primitive for $t {
            const SIZE: usize = core::mem::size_of::<$t>();

            fn from_le_slice(bytes: &[u8]) -> Self {
                let mut buf = [0u8; Self::SIZE];
                buf.copy_from_slice(&bytes[..Self::SIZE]);
                <$t>::from_le_bytes(buf)
            }

            fn to_le_slice(self, out: &mut [u8]) {
                out[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
            }

            fn to_u64(self) -> u64 {
                self as u64
            }

            fn from_u64(value: u64) -> Self {
                value as $t
            }
        }
    )*};
}

impl_primitive!(u8, u16, u32, u64);

/// A borrowed span of guest memory that is contiguous in host memory.
pub enum MemBuffer<'a> {
    Arena(&'a [u8]),
    Page(Ref<'a, [u8]>),
}

impl Deref for MemBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            MemBuffer::Arena(s) => s,
            MemBuffer::Page(r) => r,
        }
    }
}

/// Either a borrowed contiguous view or a materialised copy.
pub enum MemBytes<'a> {
    View(MemBuffer<'a>),
    Owned(Vec<u8>),
}

impl Deref for MemBytes<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            MemBytes::View(v) => v,
            MemBytes::Owned(v) => v,
        }
    }
}

pub struct Memory {
    /// page number -> page
    pages: BTreeMap<Address, Page>,
    arena: Option<Arena>,

    // two read slots and one write slot; we usually read instructions
    // near one page and do data accesses on another, and this avoids a
    // map lookup per access
    last_read_keys: [Option<Address>; 2],
    last_read: [Option<Rc<RefCell<PageBuffer>>>; 2],
    last_write_key: Option<Address>,
    last_write: Option<Rc<RefCell<PageBuffer>>>,

    execute_segments: Vec<Rc<ExecuteSegment>>,
    next_execute_slot: usize,

    pub(crate) page_fault_handler: PageFaultHandler,
    pub(crate) page_read_handler: PageReadFaultHandler,
    pub(crate) page_write_handler: PageWriteHandler,

    /// LR/SC reservation; any overlapping store clears it.
    reservation: Option<Address>,

    pub(crate) start_address: Address,
    pub(crate) stack_address: Address,
    pub(crate) heap_address: Address,
    pub(crate) exit_address: Address,
    pub(crate) mmap: MmapAllocator,

    max_memory: usize,

    symbols: BTreeMap<String, Address>,
}

impl Memory {
    pub fn new(max_memory: usize, use_arena: bool) -> Memory {
        let max_memory = page_round_up(max_memory as Address) as usize;
        let mmap_base = max_memory as Address + crate::arch::MMAP_GAP;
        Memory {
            pages: BTreeMap::new(),
            arena: if use_arena { Some(Arena::new(max_memory)) } else { None },
            last_read_keys: Default::default(),
            last_read: Default::default(),
            last_write_key: None,
            last_write: None,
            execute_segments: Vec::new(),
            next_execute_slot: 0,
            page_fault_handler: default_page_fault,
            page_read_handler: default_page_read_fault,
            page_write_handler: default_page_write,
            reservation: None,
            start_address: 0,
            stack_address: max_memory as Address,
            heap_address: 0,
            exit_address: crate::arch::EXIT_SENTINEL,
            mmap: MmapAllocator::new(mmap_base),
            max_memory,
            symbols: BTreeMap::new(),
        }
    }

    pub fn max_memory(&self) -> usize {
        self.max_memory
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn start_address(&self) -> Address {
        self.start_address
    }

    pub fn stack_address(&self) -> Address {
        self.stack_address
    }

    pub fn heap_address(&self) -> Address {
        self.heap_address
    }

    pub fn exit_address(&self) -> Address {
        self.exit_address
    }

    pub(crate) fn arena(&self) -> Option<&Arena> {
        self.arena.as_ref()
    }

    pub(crate) fn arena_mut(&mut self) -> Option<&mut Arena> {
        self.arena.as_mut()
    }

    /// Every cached page handle becomes stale on page mutation or
    /// teardown; drop them all.
    pub fn invalidate_caches(&mut self) {
        self.last_read_keys = Default::default();
        self.last_read = Default::default();
        self.last_write_key = None;
        self.last_write = None;
    }

    // ------------------------------------------------------------------
    // page table

    pub(crate) fn alloc_page(
        &mut self,
        pageno: Address,
        attr: PageAttributes,
    ) -> Result<&mut Page, MachineError> {
        let budget = (self.pages.len() + 1) * PAGE_SIZE;
        if budget > self.max_memory {
            log::warn!("out of memory allocating page {:#x}: {} bytes in use", pageno, budget);
            return Err(MachineError::OutOfMemory { bytes: budget as u64 });
        }
        self.invalidate_caches();
        Ok(self.pages.entry(pageno).or_insert_with(|| Page::new_owned(attr)))
    }

    pub fn page_at(&self, pageno: Address) -> Option<&Page> {
        self.pages.get(&pageno)
    }

    pub fn free_page(&mut self, pageno: Address) {
        self.pages.remove(&pageno);
        self.invalidate_caches();
    }

    /// Apply `attr` to every page covering `[addr, addr + len)`,
    /// creating absent pages. Used by the loader and by hosts that
    /// change protections after the fact.
    pub fn set_page_attributes(
        &mut self,
        addr: Address,
        len: usize,
        attr: PageAttributes,
    ) -> Result<(), MachineError> {
        if len == 0 {
            return Ok(());
        }
        let mut pageno = page_number(addr);
        let last = page_number(addr.wrapping_add(len.saturating_sub(1) as Address));
        while pageno <= last {
            match self.pages.get_mut(&pageno) {
                Some(page) => page.attr = attr,
                None => {
                    self.alloc_page(pageno, attr)?;
                }
            }
            pageno += 1;
        }
        self.invalidate_caches();
        Ok(())
    }

    /// Attach an mmio trap to the page containing `addr`.
    pub fn set_page_trap(
        &mut self,
        addr: Address,
        handler: Rc<dyn MmioHandler>,
    ) -> Result<(), MachineError> {
        let pageno = page_number(addr);
        if self.pages.get(&pageno).is_none() {
            self.alloc_page(pageno, PageAttributes::rw())?;
        }
        let page = self.pages.get_mut(&pageno).expect("page just created");
        page.set_trap(handler);
        self.invalidate_caches();
        Ok(())
    }

    fn page_lookup_read(&mut self, pageno: Address) -> Option<Rc<RefCell<PageBuffer>>> {
        if Some(pageno) == self.last_read_keys[0] {
            return self.last_read[0].clone();
        }
        if Some(pageno) == self.last_read_keys[1] {
            return self.last_read[1].clone();
        }
        let page = self.pages.get(&pageno)?;
        if !page.attr.read || page.attr.has_trap {
            return None;
        }
        let data = page.data.clone();
        self.last_read_keys[1] = self.last_read_keys[0];
        self.last_read[1] = self.last_read[0].take();
        self.last_read_keys[0] = Some(pageno);
        self.last_read[0] = Some(data.clone());
        Some(data)
    }

    fn page_lookup_write(&mut self, pageno: Address) -> Option<Rc<RefCell<PageBuffer>>> {
        if Some(pageno) == self.last_write_key {
            return self.last_write.clone();
        }
        let page = self.pages.get(&pageno)?;
        if !page.attr.write || page.attr.cow || page.attr.has_trap {
            return None;
        }
        let data = page.data.clone();
        self.last_write_key = Some(pageno);
        self.last_write = Some(data.clone());
        Some(data)
    }

    // ------------------------------------------------------------------
    // byte-level access

    /// Copy `out.len()` bytes out of guest memory, page by page, with a
    /// read permission check on every touched page.
    pub fn memcpy_out(&mut self, out: &mut [u8], mut addr: Address) -> Result<(), MachineError> {
        let mut filled = 0usize;
        if let Some(arena) = &self.arena {
            if arena.readable(addr, out.len()) {
                out.copy_from_slice(arena.slice(addr, out.len()));
                return Ok(());
            }
        }
        while filled < out.len() {
            let offset = page_offset(addr);
            let span = (PAGE_SIZE - offset).min(out.len() - filled);
            if let Some(arena) = &self.arena {
                if arena.contains(addr, span) {
                    if !arena.readable(addr, span) {
                        log::warn!("read protection fault at {:#x}", addr);
                        return Err(MachineError::ProtectionFault { addr });
                    }
                    out[filled..filled + span].copy_from_slice(arena.slice(addr, span));
                    filled += span;
                    addr = addr.wrapping_add(span as Address);
                    continue;
                }
            }
            let pageno = page_number(addr);
            match self.page_lookup_read(pageno) {
                Some(data) => {
                    out[filled..filled + span]
                        .copy_from_slice(&data.borrow()[offset..offset + span]);
                }
                None => match self.pages.get(&pageno) {
                    Some(page) if page.attr.has_trap && page.attr.read => {
                        let data = page.data.clone();
                        out[filled..filled + span]
                            .copy_from_slice(&data.borrow()[offset..offset + span]);
                    }
                    Some(_) => {
                        log::warn!("read protection fault at {:#x}", addr);
                        return Err(MachineError::ProtectionFault { addr });
                    }
                    None => {
                        let read_handler = self.page_read_handler;
                        read_handler(self, pageno)?;
                        match self.page_lookup_read(pageno) {
                            Some(data) => out[filled..filled + span]
                                .copy_from_slice(&data.borrow()[offset..offset + span]),
                            // absent pages read as zero
                            None => out[filled..filled + span].fill(0),
                        }
                    }
                },
            }
            filled += span;
            addr = addr.wrapping_add(span as Address);
        }
        Ok(())
    }

    /// Copy `data` into guest memory, page by page, with a write
    /// permission check and copy-on-write resolution on every touched
    /// page.
    pub fn memcpy(&mut self, mut addr: Address, data: &[u8]) -> Result<(), MachineError> {
        self.clear_reservation_in(addr, data.len());
        let mut consumed = 0usize;
        if let Some(arena) = &mut self.arena {
            if arena.writable(addr, data.len()) {
                arena.slice_mut(addr, data.len()).copy_from_slice(data);
                return Ok(());
            }
        }
        while consumed < data.len() {
            let offset = page_offset(addr);
            let span = (PAGE_SIZE - offset).min(data.len() - consumed);
            if let Some(arena) = &mut self.arena {
                if arena.contains(addr, span) {
                    if !arena.writable(addr, span) {
                        log::warn!("write protection fault at {:#x}", addr);
                        return Err(MachineError::ProtectionFault { addr });
                    }
                    arena
                        .slice_mut(addr, span)
                        .copy_from_slice(&data[consumed..consumed + span]);
                    consumed += span;
                    addr = addr.wrapping_add(span as Address);
                    continue;
                }
            }
            let buffer = self.writable_page_data(addr)?;
            buffer.borrow_mut()[offset..offset + span]
                .copy_from_slice(&data[consumed..consumed + span]);
            consumed += span;
            addr = addr.wrapping_add(span as Address);
        }
        Ok(())
    }

    pub fn memset(&mut self, mut addr: Address, value: u8, len: usize) -> Result<(), MachineError> {
        self.clear_reservation_in(addr, len);
        let mut remaining = len;
        while remaining > 0 {
            let offset = page_offset(addr);
            let span = (PAGE_SIZE - offset).min(remaining);
            if let Some(arena) = &mut self.arena {
                if arena.contains(addr, span) {
                    if !arena.writable(addr, span) {
                        log::warn!("write protection fault at {:#x}", addr);
                        return Err(MachineError::ProtectionFault { addr });
                    }
                    arena.slice_mut(addr, span).fill(value);
                    remaining -= span;
                    addr = addr.wrapping_add(span as Address);
                    continue;
                }
            }
            let buffer = self.writable_page_data(addr)?;
            buffer.borrow_mut()[offset..offset + span].fill(value);
            remaining -= span;
            addr = addr.wrapping_add(span as Address);
        }
        Ok(())
    }

    /// Resolve the page containing `addr` for writing: permission
    /// check, fault-in when absent, copy-on-write resolution.
    fn writable_page_data(&mut self, addr: Address) -> Result<Rc<RefCell<PageBuffer>>, MachineError> {
        let pageno = page_number(addr);
        if let Some(data) = self.page_lookup_write(pageno) {
            return Ok(data);
        }
        let write_handler = self.page_write_handler;
        let fault_handler = self.page_fault_handler;
        match self.pages.get_mut(&pageno) {
            Some(page) => {
                if !page.attr.write {
                    log::warn!("write protection fault at {:#x}", addr);
                    return Err(MachineError::ProtectionFault { addr });
                }
                if page.attr.cow {
                    write_handler(page);
                    self.invalidate_caches();
                }
                let page = self.pages.get(&pageno).expect("page exists");
                Ok(page.data.clone())
            }
            None => {
                fault_handler(self, pageno)?;
                let page = match self.pages.get(&pageno) {
                    Some(page) => page,
                    None => {
                        log::warn!("page fault handler left page {:#x} unmapped", pageno);
                        return Err(MachineError::ProtectionFault { addr });
                    }
                };
                if !page.attr.write {
                    log::warn!("write protection fault at {:#x}", addr);
                    return Err(MachineError::ProtectionFault { addr });
                }
                Ok(page.data.clone())
            }
        }
    }

    // ------------------------------------------------------------------
    // typed access

    pub fn read<T: Primitive>(&mut self, addr: Address) -> Result<T, MachineError> {
        // mmio traps only fire on the typed, single-page path
        if self.arena.is_none() || !self.arena.as_ref().unwrap().contains(addr, T::SIZE) {
            let pageno = page_number(addr);
            if page_offset(addr) + T::SIZE <= PAGE_SIZE {
                if let Some(page) = self.pages.get(&pageno) {
                    if page.attr.has_trap {
                        let trap = page.trap.clone().expect("trap attribute without handler");
                        return Ok(T::from_u64(trap.mmio_read(addr, T::SIZE)));
                    }
                }
            }
        }
        let mut buf = [0u8; 8];
        self.memcpy_out(&mut buf[..T::SIZE], addr)?;
        Ok(T::from_le_slice(&buf))
    }

    pub fn write<T: Primitive>(&mut self, addr: Address, value: T) -> Result<(), MachineError> {
        if self.arena.is_none() || !self.arena.as_ref().unwrap().contains(addr, T::SIZE) {
            let pageno = page_number(addr);
            if page_offset(addr) + T::SIZE <= PAGE_SIZE {
                if let Some(page) = self.pages.get(&pageno) {
                    if page.attr.has_trap {
                        let trap = page.trap.clone().expect("trap attribute without handler");
                        trap.mmio_write(addr, T::SIZE, value.to_u64());
                        return Ok(());
                    }
                }
            }
        }
        let mut buf = [0u8; 8];
        value.to_le_slice(&mut buf);
        self.memcpy(addr, &buf[..T::SIZE])
    }

    /// Read-modify-write on a naturally aligned value: the write path's
    /// permission and copy-on-write handling runs once, then `f` maps
    /// the old value to the new one. Returns the old value. This is the
    /// backing primitive for the atomic instructions.
    pub fn rmw<T, F>(&mut self, addr: Address, f: F) -> Result<T, MachineError>
    where
        T: Primitive,
        F: FnOnce(T) -> T,
    {
        if addr as usize % T::SIZE != 0 {
            return Err(MachineError::InvalidAlignment { addr });
        }
        self.clear_reservation_in(addr, T::SIZE);
        let offset = page_offset(addr);
        if let Some(arena) = &mut self.arena {
            if arena.contains(addr, T::SIZE) {
                if !arena.writable(addr, T::SIZE) || !arena.readable(addr, T::SIZE) {
                    log::warn!("write protection fault at {:#x}", addr);
                    return Err(MachineError::ProtectionFault { addr });
                }
                let slice = arena.slice_mut(addr, T::SIZE);
                let old = T::from_le_slice(slice);
                f(old).to_le_slice(slice);
                return Ok(old);
            }
        }
        let buffer = self.writable_page_data(addr)?;
        let mut data = buffer.borrow_mut();
        let old = T::from_le_slice(&data[offset..offset + T::SIZE]);
        f(old).to_le_slice(&mut data[offset..offset + T::SIZE]);
        Ok(old)
    }

    // ------------------------------------------------------------------
    // views

    /// Borrow `[addr, addr + len)` when it is contiguous in host
    /// memory: inside the arena or within a single readable page.
    pub fn memview(&self, addr: Address, len: usize) -> Result<MemBuffer<'_>, MachineError> {
        if let Some(arena) = &self.arena {
            if arena.readable(addr, len) {
                return Ok(MemBuffer::Arena(arena.slice(addr, len)));
            }
            if arena.contains(addr, len) {
                log::warn!("read protection fault at {:#x}", addr);
                return Err(MachineError::ProtectionFault { addr });
            }
        }
        let offset = page_offset(addr);
        if offset + len > PAGE_SIZE {
            log::warn!("no contiguous view over {:#x}+{:#x}", addr, len);
            return Err(MachineError::ProtectionFault { addr });
        }
        let page = match self.pages.get(&page_number(addr)) {
            Some(page) if page.attr.read => page,
            _ => {
                log::warn!("read protection fault at {:#x}", addr);
                return Err(MachineError::ProtectionFault { addr });
            }
        };
        Ok(MemBuffer::Page(Ref::map(page.data.borrow(), |b| {
            &b[offset..offset + len]
        })))
    }

    /// A contiguous view when possible, else a materialised copy.
    pub fn membuffer(&self, addr: Address, len: usize) -> Result<MemBytes<'_>, MachineError> {
        let mut spans = self.gather_buffers_from_range(addr, len)?;
        if spans.len() == 1 {
            return Ok(MemBytes::View(spans.remove(0)));
        }
        let mut out = vec![0u8; len];
        let mut filled = 0usize;
        for span in &spans {
            out[filled..filled + span.len()].copy_from_slice(span);
            filled += span.len();
        }
        Ok(MemBytes::Owned(out))
    }

    /// Cover `[addr, addr + len)` with one entry per contiguous host
    /// span, in guest order. Fails if any span is unreadable.
    pub fn gather_buffers_from_range(
        &self,
        mut addr: Address,
        len: usize,
    ) -> Result<Vec<MemBuffer<'_>>, MachineError> {
        let mut remaining = len;
        let mut buffers = Vec::new();
        while remaining > 0 {
            if let Some(arena) = &self.arena {
                if arena.contains(addr, 1) {
                    let span = remaining.min((arena.len() - addr as usize) as usize);
                    if !arena.readable(addr, span) {
                        log::warn!("read protection fault at {:#x}", addr);
                        return Err(MachineError::ProtectionFault { addr });
                    }
                    buffers.push(MemBuffer::Arena(arena.slice(addr, span)));
                    remaining -= span;
                    addr = addr.wrapping_add(span as Address);
                    continue;
                }
            }
            let offset = page_offset(addr);
            let span = (PAGE_SIZE - offset).min(remaining);
            let page = match self.pages.get(&page_number(addr)) {
                Some(page) if page.attr.read => page,
                _ => {
                    log::warn!("read protection fault at {:#x}", addr);
                    return Err(MachineError::ProtectionFault { addr });
                }
            };
            buffers.push(MemBuffer::Page(Ref::map(page.data.borrow(), |b| {
                &b[offset..offset + span]
            })));
            remaining -= span;
            addr = addr.wrapping_add(span as Address);
        }
        Ok(buffers)
    }

    /// Read a zero-terminated guest string of at most `max` bytes.
    pub fn memstring(&self, addr: Address, max: usize) -> Result<String, MachineError> {
        let mut bytes = Vec::new();
        let mut cursor = addr;
        'outer: while bytes.len() < max {
            let mut span = (PAGE_SIZE - page_offset(cursor)).min(max - bytes.len());
            if let Some(arena) = &self.arena {
                // stop a span at the arena boundary so each view stays
                // contiguous
                let left = arena.len().saturating_sub(cursor as usize);
                if left > 0 {
                    span = span.min(left);
                }
            }
            let view = self.memview(cursor, span)?;
            for &b in view.iter() {
                if b == 0 {
                    break 'outer;
                }
                bytes.push(b);
            }
            cursor = cursor.wrapping_add(span as Address);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    // ------------------------------------------------------------------
    // loader entry points

    /// Write `data` at `addr` ignoring page permissions. Loader-only:
    /// segments are populated before their final attributes apply.
    pub(crate) fn initialize_range(
        &mut self,
        mut addr: Address,
        data: &[u8],
    ) -> Result<(), MachineError> {
        let mut consumed = 0usize;
        while consumed < data.len() {
            let offset = page_offset(addr);
            let span = (PAGE_SIZE - offset).min(data.len() - consumed);
            if let Some(arena) = &mut self.arena {
                if arena.contains(addr, span) {
                    arena
                        .slice_mut(addr, span)
                        .copy_from_slice(&data[consumed..consumed + span]);
                    consumed += span;
                    addr = addr.wrapping_add(span as Address);
                    continue;
                }
            }
            let pageno = page_number(addr);
            if self.pages.get(&pageno).is_none() {
                self.alloc_page(pageno, PageAttributes::rw())?;
            }
            let page = self.pages.get_mut(&pageno).expect("page exists");
            page.data.borrow_mut()[offset..offset + span]
                .copy_from_slice(&data[consumed..consumed + span]);
            consumed += span;
            addr = addr.wrapping_add(span as Address);
        }
        self.invalidate_caches();
        Ok(())
    }

    pub(crate) fn set_symbols(&mut self, symbols: BTreeMap<String, Address>) {
        self.symbols = symbols;
    }

    /// Look up a symbol from the loaded ELF.
    pub fn address_of(&self, name: &str) -> Option<Address> {
        self.symbols.get(name).copied()
    }

    // ------------------------------------------------------------------
    // mmap region

    pub fn mmap_allocate(&mut self, bytes: Address) -> Address {
        self.mmap.allocate(bytes)
    }

    pub fn mmap_relax(&mut self, addr: Address, size: Address, new_size: Address) -> bool {
        let relaxed = self.mmap.relax(addr, size, new_size);
        if relaxed {
            let base = page_round_up(addr + new_size);
            self.drop_pages(base, (size - new_size) as usize);
        }
        relaxed
    }

    pub fn mmap_unmap(&mut self, addr: Address, size: Address) {
        if size == 0 {
            return;
        }
        self.mmap.unmap(addr, size);
        self.drop_pages(addr, page_round_up(size) as usize);
    }

    fn drop_pages(&mut self, addr: Address, len: usize) {
        let first = page_number(addr);
        let last = page_number(addr.wrapping_add(len.saturating_sub(1) as Address));
        let doomed: Vec<Address> = self
            .pages
            .range(first..=last)
            .map(|(pageno, _)| *pageno)
            .collect();
        for pageno in doomed {
            self.pages.remove(&pageno);
        }
        self.invalidate_caches();
    }

    // ------------------------------------------------------------------
    // execute segments

    /// Install an execute segment into the next free slot, evicting
    /// round-robin when all slots are live.
    pub fn install_execute_segment(&mut self, segment: ExecuteSegment) -> Rc<ExecuteSegment> {
        let segment = Rc::new(segment);
        if self.execute_segments.len() < MAX_EXECUTE_SEGS {
            self.execute_segments.push(segment.clone());
        } else {
            let slot = self.next_execute_slot % MAX_EXECUTE_SEGS;
            log::debug!("execute segment slot {} evicted for reuse", slot);
            self.execute_segments[slot] = segment.clone();
            self.next_execute_slot = slot + 1;
        }
        segment
    }

    /// First live segment whose range contains `vaddr`. Linear scan;
    /// the registry never exceeds eight entries.
    pub fn exec_segment_for(&self, vaddr: Address) -> Option<Rc<ExecuteSegment>> {
        self.execute_segments
            .iter()
            .find(|seg| seg.contains(vaddr))
            .cloned()
    }

    pub fn evict_execute_segments(&mut self) {
        self.execute_segments.clear();
        self.next_execute_slot = 0;
        self.invalidate_caches();
    }

    pub fn execute_segment_count(&self) -> usize {
        self.execute_segments.len()
    }

    // ------------------------------------------------------------------
    // sharing and forking

    /// Mark the page at `pageno` shared and return a handle that can be
    /// installed into another machine's memory. Writes through either
    /// mapping are immediately visible to both.
    pub fn share_page(&mut self, pageno: Address) -> Result<Page, MachineError> {
        if self.pages.get(&pageno).is_none() {
            self.alloc_page(pageno, PageAttributes::rw())?;
        }
        let page = self.pages.get_mut(&pageno).expect("page exists");
        page.make_writable();
        page.attr.shared = true;
        let shared = page.clone();
        self.invalidate_caches();
        Ok(shared)
    }

    /// Install a page shared from another machine. The page keeps its
    /// attributes; pass a read-only attribute set for R-only sharing.
    pub fn install_shared_page(&mut self, pageno: Address, page: Page) -> Result<(), MachineError> {
        let budget = (self.pages.len() + 1) * PAGE_SIZE;
        if budget > self.max_memory {
            log::warn!("out of memory sharing page {:#x}: {} bytes in use", pageno, budget);
            return Err(MachineError::OutOfMemory { bytes: budget as u64 });
        }
        let mut page = page;
        page.attr.shared = true;
        self.pages.insert(pageno, page);
        self.invalidate_caches();
        Ok(())
    }

    /// Copy-on-write clone of this memory for a forked machine. Owned
    /// writable pages on both sides become CoW and materialise private
    /// copies on first write; the arena is copied eagerly.
    pub fn fork(&mut self) -> Memory {
        self.invalidate_caches();
        let pages: BTreeMap<Address, Page> = self
            .pages
            .iter_mut()
            .map(|(pageno, page)| (*pageno, page.fork_clone()))
            .collect();
        Memory {
            pages,
            arena: self.arena.clone(),
            last_read_keys: Default::default(),
            last_read: Default::default(),
            last_write_key: None,
            last_write: None,
            execute_segments: self.execute_segments.clone(),
            next_execute_slot: self.next_execute_slot,
            page_fault_handler: self.page_fault_handler,
            page_read_handler: self.page_read_handler,
            page_write_handler: self.page_write_handler,
            reservation: None,
            start_address: self.start_address,
            stack_address: self.stack_address,
            heap_address: self.heap_address,
            exit_address: self.exit_address,
            mmap: self.mmap.clone(),
            max_memory: self.max_memory,
            symbols: self.symbols.clone(),
        }
    }

    // ------------------------------------------------------------------
    // reservations

    pub fn set_reservation(&mut self, addr: Address) {
        self.reservation = Some(addr);
    }

    /// Consume the reservation; true when it still covers `addr`.
    pub fn take_reservation(&mut self, addr: Address) -> bool {
        self.reservation.take() == Some(addr)
    }

    fn clear_reservation_in(&mut self, addr: Address, len: usize) {
        if let Some(r) = self.reservation {
            if r >= page_base(addr) && r <= addr.wrapping_add(len as Address) {
                self.reservation = None;
            }
        }
    }

    // ------------------------------------------------------------------

    /// Human-readable total of guest memory in use.
    pub fn usage(&self) -> String {
        let mut total = self.pages.len() * PAGE_SIZE;
        if let Some(arena) = &self.arena {
            total += arena.len();
        }
        if total < 1 << 10 {
            return format!("{} B", total);
        }
        let units = ["KiB", "MiB", "GiB", "TiB"];
        let mut value = total as f64 / 1024.0;
        let mut unit = 0;
        while value >= 1024.0 && unit + 1 < units.len() {
            value /= 1024.0;
            unit += 1;
        }
        format!("{:.1} {}", value, units[unit])
    }
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory")
            .field("pages", &self.pages.len())
            .field("arena", &self.arena.is_some())
            .field("segments", &self.execute_segments.len())
            .field("usage", &self.usage())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: usize = 1 << 20;

    fn paged() -> Memory {
        Memory::new(4 * MIB, false)
    }

    #[test]
    fn absent_pages_read_as_zero() {
        let mut mem = paged();
        assert_eq!(mem.read::<u32>(0x5000).unwrap(), 0);
        assert_eq!(mem.page_count(), 0);
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut mem = paged();
        mem.write::<u64>(0x5008, 0x1122_3344_5566_7788).unwrap();
        assert_eq!(mem.read::<u64>(0x5008).unwrap(), 0x1122_3344_5566_7788);
        assert_eq!(mem.read::<u16>(0x5008).unwrap(), 0x7788);
    }

    #[test]
    fn unaligned_access_crosses_pages() {
        let mut mem = paged();
        mem.write::<u32>(0x5ffe, 0xAABB_CCDD).unwrap();
        assert_eq!(mem.read::<u32>(0x5ffe).unwrap(), 0xAABB_CCDD);
        assert_eq!(mem.read::<u16>(0x6000).unwrap(), 0xAABB);
    }

    #[test]
    fn arena_and_page_paths_agree() {
        let mut arena_mem = Memory::new(4 * MIB, true);
        let mut page_mem = paged();
        for (i, mem) in [&mut arena_mem, &mut page_mem].into_iter().enumerate() {
            mem.write::<u32>(0x2000, 0xC0FFEE00 + i as u32).unwrap();
            assert_eq!(mem.read::<u32>(0x2000).unwrap(), 0xC0FFEE00 + i as u32);
        }
    }

    #[test]
    fn read_only_pages_reject_writes() {
        let mut mem = paged();
        mem.write::<u32>(0x3000, 7).unwrap();
        mem.set_page_attributes(0x3000, PAGE_SIZE, PageAttributes::read_only())
            .unwrap();
        let err = mem.write::<u32>(0x3000, 9).unwrap_err();
        assert_eq!(err, MachineError::ProtectionFault { addr: 0x3000 });
        // the failed write left memory unchanged
        assert_eq!(mem.read::<u32>(0x3000).unwrap(), 7);
        let err = mem.memcpy(0x3000, &[0u8; 4]).unwrap_err();
        assert_eq!(err, MachineError::ProtectionFault { addr: 0x3000 });
    }

    #[test]
    fn rodata_in_arena_rejects_writes() {
        let mut mem = Memory::new(4 * MIB, true);
        mem.arena_mut().unwrap().set_initial_rodata_end(0x4000);
        assert!(mem.write::<u32>(0x1000, 1).is_err());
        assert!(mem.write::<u32>(0x4000, 1).is_ok());
    }

    #[test]
    fn out_of_memory_is_reported() {
        let mut mem = Memory::new(2 * PAGE_SIZE, false);
        mem.write::<u8>(0x0, 1).unwrap();
        mem.write::<u8>(0x1000, 1).unwrap();
        let err = mem.write::<u8>(0x2000, 1).unwrap_err();
        assert!(matches!(err, MachineError::OutOfMemory { .. }));
    }

    #[test]
    fn gather_matches_memcpy_out() {
        let mut mem = paged();
        let pattern: Vec<u8> = (0..=255u8).cycle().take(3 * PAGE_SIZE).collect();
        mem.memcpy(0x7f80, &pattern).unwrap();

        let mut copied = vec![0u8; pattern.len()];
        mem.memcpy_out(&mut copied, 0x7f80).unwrap();

        let mut gathered = Vec::new();
        for span in mem.gather_buffers_from_range(0x7f80, pattern.len()).unwrap() {
            gathered.extend_from_slice(&span);
        }
        assert_eq!(copied, pattern);
        assert_eq!(gathered, pattern);
    }

    #[test]
    fn memview_requires_contiguity() {
        let mut mem = paged();
        mem.write::<u32>(0x8000, 0xFEEDFACE).unwrap();
        let view = mem.memview(0x8000, 4).unwrap();
        assert_eq!(&*view, &0xFEEDFACEu32.to_le_bytes());
        drop(view);
        assert!(mem.memview(0x8ffe, 4).is_err());
        // membuffer falls back to a copy for the same range
        mem.write::<u32>(0x8ffe, 0x01020304).unwrap();
        let bytes = mem.membuffer(0x8ffe, 4).unwrap();
        assert_eq!(&*bytes, &0x01020304u32.to_le_bytes());
    }

    #[test]
    fn memstring_stops_at_nul_and_bound() {
        let mut mem = paged();
        mem.memcpy(0x9000, b"hello\0world").unwrap();
        assert_eq!(mem.memstring(0x9000, 64).unwrap(), "hello");
        assert_eq!(mem.memstring(0x9000, 3).unwrap(), "hel");
    }

    #[test]
    fn cow_fork_isolates_writes() {
        let mut parent = paged();
        parent.write::<u8>(0x4000, 0xAA).unwrap();
        let mut child = parent.fork();

        parent.write::<u8>(0x4000, 0xA1).unwrap();
        child.write::<u8>(0x4000, 0xBB).unwrap();

        assert_eq!(parent.read::<u8>(0x4000).unwrap(), 0xA1);
        assert_eq!(child.read::<u8>(0x4000).unwrap(), 0xBB);
    }

    #[test]
    fn fork_read_sharing_keeps_one_buffer() {
        let mut parent = paged();
        parent.write::<u8>(0x4000, 0x55).unwrap();
        let mut child = parent.fork();
        // both read the same buffer until someone writes
        assert_eq!(child.read::<u8>(0x4000).unwrap(), 0x55);
        assert!(!parent.page_at(4).unwrap().is_owned());
    }

    #[test]
    fn shared_pages_see_each_other() {
        let mut a = paged();
        let mut b = paged();
        a.write::<u32>(0x10000, 0).unwrap();
        let page = a.share_page(page_number(0x10000)).unwrap();
        b.install_shared_page(page_number(0x10000), page).unwrap();

        a.write::<u32>(0x10000, 42).unwrap();
        assert_eq!(b.read::<u32>(0x10000).unwrap(), 42);
        b.write::<u32>(0x10004, 7).unwrap();
        assert_eq!(a.read::<u32>(0x10004).unwrap(), 7);
    }

    #[test]
    fn rmw_is_aligned_only() {
        let mut mem = paged();
        mem.write::<u32>(0xa000, 10).unwrap();
        let old = mem.rmw::<u32, _>(0xa000, |v| v + 5).unwrap();
        assert_eq!(old, 10);
        assert_eq!(mem.read::<u32>(0xa000).unwrap(), 15);
        assert!(matches!(
            mem.rmw::<u32, _>(0xa001, |v| v),
            Err(MachineError::InvalidAlignment { .. })
        ));
    }

    #[test]
    fn stores_clear_reservations() {
        let mut mem = paged();
        mem.write::<u32>(0xb000, 1).unwrap();
        mem.set_reservation(0xb000);
        mem.write::<u32>(0xb000, 2).unwrap();
        assert!(!mem.take_reservation(0xb000));

        mem.set_reservation(0xb000);
        assert!(mem.take_reservation(0xb000));
    }

    #[test]
    fn mmap_pages_are_dropped_on_unmap() {
        let mut mem = paged();
        let addr = mem.mmap_allocate(2 * PAGE_SIZE as Address);
        mem.write::<u32>(addr, 99).unwrap();
        assert_eq!(mem.page_count(), 1);
        mem.mmap_unmap(addr, 2 * PAGE_SIZE as Address);
        assert_eq!(mem.page_count(), 0);
        // the cursor rewound, so the same span comes back
        assert_eq!(mem.mmap_allocate(2 * PAGE_SIZE as Address), addr);
        assert_eq!(mem.read::<u32>(addr).unwrap(), 0);
    }
}
