//! DMA Memory Management
//!
//! The controller core never talks to the kernel's page allocator directly.
//! Everything the hardware reads or writes (rings, segment table, DCBAA,
//! scratchpad pages) is carved out of one contiguous, DMA-capable region
//! that the embedding kernel establishes up front and hands over through
//! [`DmaAllocator`].

use alloc::collections::BTreeMap;
use core::{
    fmt,
    ptr::{self, NonNull},
};
use x86_64::{PhysAddr, VirtAddr};
use crate::{Result, XhciError};

/// Default alignment for xHCI data structures (rings, ERST, DCBAA)
pub const DMA_ALIGN: usize = 64;

/// Typed handle to a DMA buffer: a virtual accessor paired with the
/// physical address the controller uses for the same bytes.
///
/// All accessors are bounds-checked and volatile, since the controller may
/// write the memory at any time.
pub struct DmaBuffer {
    virt: NonNull<u8>,
    phys: PhysAddr,
    len: usize,
}

// SAFETY: a DmaBuffer is an exclusive handle to its bytes; the only other
// party touching them is the device.
unsafe impl Send for DmaBuffer {}
unsafe impl Sync for DmaBuffer {}

impl DmaBuffer {
    /// Wrap an existing mapping.
    ///
    /// # Safety
    /// `virt` must be valid for reads and writes of `len` bytes for the
    /// lifetime of the handle, and `phys` must be the bus address of the
    /// same memory.
    pub unsafe fn from_raw_parts(virt: NonNull<u8>, phys: PhysAddr, len: usize) -> Self {
        Self { virt, phys, len }
    }

    /// Physical address of the first byte
    pub fn physical_address(&self) -> PhysAddr {
        self.phys
    }

    /// Virtual address of the first byte
    pub fn virtual_address(&self) -> VirtAddr {
        VirtAddr::from_ptr(self.virt.as_ptr() as *const u8)
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Physical address of the byte at `offset`
    pub fn physical_at(&self, offset: usize) -> PhysAddr {
        assert!(offset <= self.len, "DMA offset {:#x} past end ({:#x})", offset, self.len);
        self.phys + offset as u64
    }

    fn check(&self, offset: usize, width: usize) {
        assert!(
            offset % width == 0 && offset + width <= self.len,
            "DMA access {:#x}+{} outside buffer of {:#x} bytes",
            offset,
            width,
            self.len
        );
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        self.check(offset, 4);
        unsafe { ptr::read_volatile(self.virt.as_ptr().add(offset).cast::<u32>()) }
    }

    pub fn write_u32(&self, offset: usize, value: u32) {
        self.check(offset, 4);
        unsafe { ptr::write_volatile(self.virt.as_ptr().add(offset).cast::<u32>(), value) }
    }

    pub fn read_u64(&self, offset: usize) -> u64 {
        self.check(offset, 8);
        unsafe { ptr::read_volatile(self.virt.as_ptr().add(offset).cast::<u64>()) }
    }

    pub fn write_u64(&self, offset: usize, value: u64) {
        self.check(offset, 8);
        unsafe { ptr::write_volatile(self.virt.as_ptr().add(offset).cast::<u64>(), value) }
    }

    /// Zero the buffer
    pub fn zero(&self) {
        unsafe { ptr::write_bytes(self.virt.as_ptr(), 0, self.len) }
    }
}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("virt", &self.virt)
            .field("phys", &self.phys)
            .field("len", &self.len)
            .finish()
    }
}

/// DMA memory manager consumed by the controller core
pub trait DmaAllocator: Send {
    /// Allocate `size` zeroed bytes whose physical address is aligned to `align`
    fn allocate_aligned(&mut self, size: usize, align: usize) -> Result<DmaBuffer>;

    /// Return a buffer obtained from this allocator
    fn release(&mut self, buffer: DmaBuffer);

    /// Allocate `size` zeroed bytes with the default xHCI alignment
    fn allocate(&mut self, size: usize) -> Result<DmaBuffer> {
        self.allocate_aligned(size, DMA_ALIGN)
    }
}

/// First-fit DMA allocator over a single pre-established contiguous region
pub struct DmaRegion {
    /// Virtual base address of the region
    virt_base: VirtAddr,
    /// Physical base address of the region
    phys_base: PhysAddr,
    /// Size of the region
    size: usize,
    /// Free blocks (offset -> size)
    free_blocks: BTreeMap<usize, usize>,
    /// Allocated blocks (offset -> size)
    allocated_blocks: BTreeMap<usize, usize>,
    /// Total allocated bytes
    allocated_bytes: usize,
}

// SAFETY: the region is owned exclusively by this allocator.
unsafe impl Send for DmaRegion {}

impl DmaRegion {
    /// Create an allocator over `[virt_base, virt_base + size)`.
    ///
    /// # Safety
    /// The range must be mapped, DMA-capable, physically contiguous starting
    /// at `phys_base`, and must stay valid for as long as any buffer handed
    /// out by this allocator is alive.
    pub unsafe fn new(virt_base: VirtAddr, phys_base: PhysAddr, size: usize) -> Self {
        let mut free_blocks = BTreeMap::new();
        if size > 0 {
            free_blocks.insert(0, size);
        }

        Self {
            virt_base,
            phys_base,
            size,
            free_blocks,
            allocated_blocks: BTreeMap::new(),
            allocated_bytes: 0,
        }
    }

    /// Coalesce adjacent free blocks
    fn coalesce_free_blocks(&mut self) {
        let mut coalesced: BTreeMap<usize, usize> = BTreeMap::new();
        let mut current: Option<(usize, usize)> = None;

        for (&offset, &size) in &self.free_blocks {
            current = match current {
                Some((start, len)) if start + len == offset => Some((start, len + size)),
                Some((start, len)) => {
                    coalesced.insert(start, len);
                    Some((offset, size))
                }
                None => Some((offset, size)),
            };
        }

        if let Some((start, len)) = current {
            coalesced.insert(start, len);
        }

        self.free_blocks = coalesced;
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            total_size: self.size,
            allocated_bytes: self.allocated_bytes,
            free_bytes: self.size - self.allocated_bytes,
            free_blocks: self.free_blocks.len(),
            allocated_blocks: self.allocated_blocks.len(),
        }
    }
}

impl DmaAllocator for DmaRegion {
    fn allocate_aligned(&mut self, size: usize, align: usize) -> Result<DmaBuffer> {
        if size == 0 || !align.is_power_of_two() {
            return Err(XhciError::InvalidParameter);
        }

        let aligned_size = alignment::align_up(size, DMA_ALIGN);
        let phys_base = self.phys_base.as_u64() as usize;

        let mut best_block = None;
        for (&offset, &block_size) in &self.free_blocks {
            let aligned_phys = alignment::align_up(phys_base + offset, align);
            let alignment_waste = aligned_phys - (phys_base + offset);

            if block_size >= aligned_size + alignment_waste {
                best_block = Some((offset, block_size, alignment_waste));
                break;
            }
        }

        let Some((offset, block_size, alignment_waste)) = best_block else {
            log::error!(
                "xHCI: DMA region exhausted ({} bytes requested, {} free)",
                size,
                self.size - self.allocated_bytes
            );
            return Err(XhciError::InsufficientResources);
        };

        self.free_blocks.remove(&offset);
        if alignment_waste > 0 {
            self.free_blocks.insert(offset, alignment_waste);
        }
        let remaining = block_size - aligned_size - alignment_waste;
        if remaining > 0 {
            self.free_blocks.insert(offset + alignment_waste + aligned_size, remaining);
        }

        let alloc_offset = offset + alignment_waste;
        self.allocated_blocks.insert(alloc_offset, aligned_size);
        self.allocated_bytes += aligned_size;

        let virt = NonNull::new((self.virt_base.as_u64() as usize + alloc_offset) as *mut u8)
            .ok_or(XhciError::InsufficientResources)?;
        let buffer = unsafe {
            DmaBuffer::from_raw_parts(virt, self.phys_base + alloc_offset as u64, size)
        };
        buffer.zero();
        Ok(buffer)
    }

    fn release(&mut self, buffer: DmaBuffer) {
        let phys = buffer.physical_address().as_u64();
        let Some(offset) = phys
            .checked_sub(self.phys_base.as_u64())
            .map(|offset| offset as usize)
        else {
            log::warn!("xHCI: release of foreign DMA buffer at {:#x}", phys);
            return;
        };

        match self.allocated_blocks.remove(&offset) {
            Some(size) => {
                self.allocated_bytes -= size;
                self.free_blocks.insert(offset, size);
                self.coalesce_free_blocks();
            }
            None => log::warn!("xHCI: release of unknown DMA buffer at {:#x}", phys),
        }
    }
}

/// Memory pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total_size: usize,
    pub allocated_bytes: usize,
    pub free_bytes: usize,
    pub free_blocks: usize,
    pub allocated_blocks: usize,
}

/// Memory alignment helpers
pub mod alignment {
    /// Align value up to alignment boundary
    pub const fn align_up(value: usize, align: usize) -> usize {
        (value + align - 1) & !(align - 1)
    }

    /// Check if value is aligned
    pub const fn is_aligned(value: usize, align: usize) -> bool {
        value & (align - 1) == 0
    }

    pub const PAGE: usize = 4096;
}
