/// xHCI Register Definitions and Access
///
/// The controller exposes four disjoint register windows inside one memory
/// BAR. Capability registers sit at the BAR base; the operational, runtime
/// and doorbell windows are found at offsets the capability registers report.
/// [`RegisterWindow`] holds those four bases and is the only path the rest of
/// the crate uses to touch hardware state.

use core::ptr::NonNull;
use volatile::Volatile;
use x86_64::VirtAddr;

/// Raw 32-bit access to the mapped controller BAR
///
/// Offsets are byte offsets from the start of the BAR. Every call must be a
/// direct, uncached, ordered access; implementations never batch or cache.
pub trait Mmio: Send + Sync {
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, value: u32);
    /// Length of the mapping in bytes
    fn len(&self) -> usize;
}

/// Volatile MMIO access over a mapped, non-cached BAR
pub struct MmioRegion {
    base: NonNull<u32>,
    size: usize,
}

// SAFETY: the mapping is device memory, valid for the driver's lifetime,
// and every access is a single volatile load or store.
unsafe impl Send for MmioRegion {}
unsafe impl Sync for MmioRegion {}

impl MmioRegion {
    /// Wrap a mapped BAR.
    ///
    /// # Safety
    /// `base` must be the virtual address of an uncached mapping of at least
    /// `size` bytes that stays valid for the lifetime of this value.
    pub unsafe fn new(base: VirtAddr, size: usize) -> Option<Self> {
        let base = NonNull::new(base.as_mut_ptr::<u32>())?;
        Some(Self { base, size })
    }

    fn register(&self, offset: usize) -> *mut u32 {
        debug_assert!(offset % 4 == 0 && offset + 4 <= self.size, "MMIO offset {:#x}", offset);
        unsafe { self.base.as_ptr().byte_add(offset) }
    }
}

impl Mmio for MmioRegion {
    fn read32(&self, offset: usize) -> u32 {
        let reg = unsafe { &*self.register(offset) };
        Volatile::new_read_only(reg).read()
    }

    fn write32(&self, offset: usize, value: u32) {
        let reg = unsafe { &mut *self.register(offset) };
        Volatile::new_write_only(reg).write(value);
    }

    fn len(&self) -> usize {
        self.size
    }
}

/// Capability register offsets
pub mod cap {
    /// CAPLENGTH (bits 7:0) and HCIVERSION (bits 31:16)
    pub const CAPLENGTH: usize = 0x00;
    pub const HCSPARAMS1: usize = 0x04;
    pub const HCSPARAMS2: usize = 0x08;
    pub const HCSPARAMS3: usize = 0x0c;
    pub const HCCPARAMS1: usize = 0x10;
    pub const DBOFF: usize = 0x14;
    pub const RTSOFF: usize = 0x18;
    pub const HCCPARAMS2: usize = 0x1c;
}

/// Operational register offsets
pub mod op {
    pub const USBCMD: usize = 0x00;
    pub const USBSTS: usize = 0x04;
    pub const PAGESIZE: usize = 0x08;
    pub const DNCTRL: usize = 0x14;
    pub const CRCR_LO: usize = 0x18;
    pub const CRCR_HI: usize = 0x1c;
    pub const DCBAAP_LO: usize = 0x30;
    pub const DCBAAP_HI: usize = 0x34;
    pub const CONFIG: usize = 0x38;
    /// First port register set; one set of 0x10 bytes per port
    pub const PORT_BASE: usize = 0x400;
    pub const PORT_STRIDE: usize = 0x10;

    /// Offset of PORTSC for a 1-based port number
    pub const fn portsc(port: u8) -> usize {
        PORT_BASE + (port as usize - 1) * PORT_STRIDE
    }
}

/// Runtime register offsets (primary interrupter only)
pub mod rt {
    pub const MFINDEX: usize = 0x00;
    pub const IMAN: usize = 0x20;
    pub const IMOD: usize = 0x24;
    pub const ERSTSZ: usize = 0x28;
    pub const ERSTBA_LO: usize = 0x30;
    pub const ERSTBA_HI: usize = 0x34;
    pub const ERDP_LO: usize = 0x38;
    pub const ERDP_HI: usize = 0x3c;
    /// Bytes the primary interrupter occupies from the runtime base
    pub const PRIMARY_SPAN: usize = 0x40;
}

/// USB Command Register bits
pub mod usbcmd {
    pub const RUN_STOP: u32 = 1 << 0;
    pub const HCRST: u32 = 1 << 1;
    pub const INTE: u32 = 1 << 2;
    pub const HSEE: u32 = 1 << 3;
}

/// USB Status Register bits
pub mod usbsts {
    pub const HCH: u32 = 1 << 0;
    pub const HSE: u32 = 1 << 2;
    pub const EINT: u32 = 1 << 3;
    pub const PCD: u32 = 1 << 4;
    pub const SRE: u32 = 1 << 10;
    pub const CNR: u32 = 1 << 11;
    pub const HCE: u32 = 1 << 12;

    /// Conditions after which the controller is no longer usable
    pub const FATAL: u32 = HCH | HSE | HCE;
    /// Write-1-to-clear bits
    pub const RW1C: u32 = HSE | EINT | PCD | SRE;
}

/// Interrupter Management Register bits
pub mod iman {
    pub const IP: u32 = 1 << 0;
    pub const IE: u32 = 1 << 1;
}

/// Event Ring Dequeue Pointer bits
pub mod erdp {
    /// Event Handler Busy (RW1C)
    pub const EHB: u32 = 1 << 3;
}

/// Command Ring Control Register bits
pub mod crcr {
    /// Ring Cycle State
    pub const RCS: u32 = 1 << 0;
}

/// Port Status and Control Register bits
pub mod portsc {
    pub const CCS: u32 = 1 << 0; // Current Connect Status
    pub const PED: u32 = 1 << 1; // Port Enabled/Disabled
    pub const OCA: u32 = 1 << 3; // Over-current Active
    pub const PR: u32 = 1 << 4; // Port Reset
    pub const PP: u32 = 1 << 9; // Port Power
    pub const CSC: u32 = 1 << 17; // Connect Status Change
    pub const PEC: u32 = 1 << 18; // Port Enabled/Disabled Change
    pub const WRC: u32 = 1 << 19; // Warm Port Reset Change
    pub const OCC: u32 = 1 << 20; // Over-current Change
    pub const PRC: u32 = 1 << 21; // Port Reset Change
    pub const PLC: u32 = 1 << 22; // Port Link State Change
    pub const CEC: u32 = 1 << 23; // Port Config Error Change

    pub const CHANGE_BITS: u32 = CSC | PEC | WRC | OCC | PRC | PLC | CEC;

    /// Bits that must be written as zero in a read-modify-write so that
    /// status changes are not acknowledged and the port is not disabled.
    pub const PRESERVE_MASK: u32 = !(CHANGE_BITS | PED | PR);
}

/// The four register windows of one controller
pub struct RegisterWindow<M: Mmio> {
    mmio: M,
    operational: usize,
    runtime: usize,
    doorbell: usize,
}

impl<M: Mmio> RegisterWindow<M> {
    /// Derive the window bases from the capability registers.
    ///
    /// Returns `None` when the reported offsets do not fit in the mapping.
    pub fn new(mmio: M) -> Option<Self> {
        if mmio.len() < cap::HCCPARAMS2 + 4 {
            return None;
        }

        let operational = (mmio.read32(cap::CAPLENGTH) & 0xff) as usize;
        let runtime = (mmio.read32(cap::RTSOFF) & !0x1f) as usize;
        let doorbell = (mmio.read32(cap::DBOFF) & !0x03) as usize;

        let len = mmio.len();
        if operational < cap::HCCPARAMS2 + 4
            || operational + op::CONFIG + 4 > len
            || runtime + rt::PRIMARY_SPAN > len
            || doorbell + 4 > len
        {
            return None;
        }

        Some(Self {
            mmio,
            operational,
            runtime,
            doorbell,
        })
    }

    pub fn operational_base(&self) -> usize {
        self.operational
    }

    pub fn runtime_base(&self) -> usize {
        self.runtime
    }

    pub fn doorbell_base(&self) -> usize {
        self.doorbell
    }

    /// Length of the underlying mapping
    pub fn len(&self) -> usize {
        self.mmio.len()
    }

    pub fn read_cap(&self, offset: usize) -> u32 {
        self.mmio.read32(offset)
    }

    pub fn write_cap(&self, offset: usize, value: u32) {
        self.mmio.write32(offset, value)
    }

    pub fn read_op(&self, offset: usize) -> u32 {
        self.mmio.read32(self.operational + offset)
    }

    pub fn write_op(&self, offset: usize, value: u32) {
        self.mmio.write32(self.operational + offset, value)
    }

    pub fn read_rt(&self, offset: usize) -> u32 {
        self.mmio.read32(self.runtime + offset)
    }

    pub fn write_rt(&self, offset: usize, value: u32) {
        self.mmio.write32(self.runtime + offset, value)
    }

    pub fn read_db(&self, offset: usize) -> u32 {
        self.mmio.read32(self.doorbell + offset)
    }

    pub fn write_db(&self, offset: usize, value: u32) {
        self.mmio.write32(self.doorbell + offset, value)
    }

    /// Write a 64-bit operational register as low then high half
    pub fn write_op64(&self, lo: usize, hi: usize, value: u64) {
        self.write_op(lo, value as u32);
        self.write_op(hi, (value >> 32) as u32);
    }

    /// Write a 64-bit runtime register as low then high half
    pub fn write_rt64(&self, lo: usize, hi: usize, value: u64) {
        self.write_rt(lo, value as u32);
        self.write_rt(hi, (value >> 32) as u32);
    }

    /// Read-modify-write of USBCMD
    pub fn update_usbcmd(&self, f: impl FnOnce(u32) -> u32) {
        let cmd = self.read_op(op::USBCMD);
        self.write_op(op::USBCMD, f(cmd));
    }

    /// Ring a doorbell; slot 0 is the host controller (command ring)
    pub fn ring_doorbell(&self, slot: u8, target: u8, stream_id: u16) {
        let value = (target as u32) | ((stream_id as u32) << 16);
        self.write_db(slot as usize * 4, value);
    }
}
