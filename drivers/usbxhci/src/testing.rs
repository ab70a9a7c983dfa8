//! Simulated controller and DMA memory for unit tests

use alloc::{boxed::Box, sync::Arc, vec, vec::Vec};
use core::ptr::{self, NonNull};
use spin::Mutex;
use x86_64::{PhysAddr, VirtAddr};
use crate::memory::DmaRegion;
use crate::platform::Delay;
use crate::xhci::legacy::{CAP_ID_LEGACY, USBLEGSUP_BIOS_OWNED, USBLEGSUP_OS_OWNED};
use crate::xhci::registers::{cap, iman, op, portsc, rt, usbcmd, usbsts, Mmio};
use crate::xhci::trb::{Trb, TrbType};

/// Delay that returns immediately
pub struct NoDelay;

impl Delay for NoDelay {
    fn stall_us(&self, _us: u32) {}
    fn sleep_ms(&self, _ms: u32) {}
}

/// Heap memory standing in for a physically contiguous DMA region
pub struct TestDma {
    words: NonNull<u64>,
    len_words: usize,
}

impl TestDma {
    pub const PHYS_BASE: u64 = 0x1000_0000;

    pub fn new(bytes: usize) -> Self {
        let len_words = bytes.div_ceil(8).max(1);
        let boxed: Box<[u64]> = vec![0u64; len_words].into_boxed_slice();
        let words = NonNull::new(Box::into_raw(boxed) as *mut u64).unwrap();
        Self { words, len_words }
    }

    pub fn len(&self) -> usize {
        self.len_words * 8
    }

    /// Allocator over the whole memory; the memory must outlive it
    pub fn region(&self) -> DmaRegion {
        unsafe {
            DmaRegion::new(
                VirtAddr::from_ptr(self.words.as_ptr() as *const u64),
                PhysAddr::new(Self::PHYS_BASE),
                self.len(),
            )
        }
    }

    fn byte_ptr(&self, phys: PhysAddr, width: usize) -> *mut u8 {
        let offset = phys
            .as_u64()
            .checked_sub(Self::PHYS_BASE)
            .expect("address below test DMA memory") as usize;
        assert!(offset + width <= self.len(), "address {:#x} past test DMA memory", phys.as_u64());
        unsafe { (self.words.as_ptr() as *mut u8).add(offset) }
    }

    pub fn read_u32(&self, phys: PhysAddr) -> u32 {
        unsafe { ptr::read_volatile(self.byte_ptr(phys, 4).cast::<u32>()) }
    }

    pub fn write_u32(&self, phys: PhysAddr, value: u32) {
        unsafe { ptr::write_volatile(self.byte_ptr(phys, 4).cast::<u32>(), value) }
    }

    pub fn read_u64(&self, phys: PhysAddr) -> u64 {
        unsafe { ptr::read_volatile(self.byte_ptr(phys, 8).cast::<u64>()) }
    }

    pub fn write_u64(&self, phys: PhysAddr, value: u64) {
        unsafe { ptr::write_volatile(self.byte_ptr(phys, 8).cast::<u64>(), value) }
    }
}

impl Drop for TestDma {
    fn drop(&mut self) {
        let slice = ptr::slice_from_raw_parts_mut(self.words.as_ptr(), self.len_words);
        drop(unsafe { Box::from_raw(slice) });
    }
}

/// Shape and scripted behaviour of a simulated controller
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Length reported for the BAR
    pub mapping_len: usize,
    pub max_slots: u8,
    pub max_ports: u8,
    pub scratchpads: u32,
    /// Raw PAGESIZE register value
    pub page_size: u32,
    /// USBSTS reads after a stop or reset until HCHalted is reported
    pub halt_after: Option<u32>,
    /// USBSTS reads after a reset until Controller Not Ready clears
    pub ready_after: Option<u32>,
    /// USBSTS reads after Run/Stop is set until HCHalted clears
    pub run_after: Option<u32>,
    pub initially_running: bool,
    pub legacy_capability: bool,
    pub bios_owned: bool,
    /// Reads of USBLEGSUP after the OS request until the BIOS lets go
    pub bios_release_after: Option<u32>,
}

impl SimConfig {
    pub const CAP_LENGTH: usize = 0x20;
    pub const RUNTIME_OFFSET: usize = 0x1000;
    pub const DOORBELL_OFFSET: usize = 0x2000;
    pub const XECP_OFFSET: usize = 0x800;
    pub const LEGACY_OFFSET: usize = 0x810;
    const STORAGE: usize = 0x3000;
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            mapping_len: Self::STORAGE,
            max_slots: 8,
            max_ports: 4,
            scratchpads: 2,
            page_size: 1,
            halt_after: Some(1),
            ready_after: Some(1),
            run_after: Some(1),
            initially_running: false,
            legacy_capability: true,
            bios_owned: false,
            bios_release_after: Some(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Idle,
    Halting,
    Resetting,
    Starting,
}

struct SimState {
    config: SimConfig,
    words: Vec<u32>,
    transition: Transition,
    status_reads: u32,
    legacy_reads: Option<u32>,
    erdp_writes: Vec<u32>,
    doorbell_writes: Vec<(usize, u32)>,
    producer_index: usize,
    producer_cycle: bool,
}

const USBCMD: usize = SimConfig::CAP_LENGTH + op::USBCMD;
const USBSTS: usize = SimConfig::CAP_LENGTH + op::USBSTS;
const IMAN: usize = SimConfig::RUNTIME_OFFSET + rt::IMAN;
const ERDP_LO: usize = SimConfig::RUNTIME_OFFSET + rt::ERDP_LO;
const DOORBELL_END: usize = SimConfig::DOORBELL_OFFSET + 256 * 4;

impl SimState {
    fn new(config: SimConfig) -> Self {
        let mut state = Self {
            words: vec![0; SimConfig::STORAGE.max(config.mapping_len) / 4],
            config,
            transition: Transition::Idle,
            status_reads: 0,
            legacy_reads: None,
            erdp_writes: Vec::new(),
            doorbell_writes: Vec::new(),
            producer_index: 0,
            producer_cycle: true,
        };
        state.power_on();
        state
    }

    fn power_on(&mut self) {
        let config = self.config.clone();

        self.set(cap::CAPLENGTH, SimConfig::CAP_LENGTH as u32 | (0x0110 << 16));
        self.set(
            cap::HCSPARAMS1,
            config.max_slots as u32 | (1 << 8) | ((config.max_ports as u32) << 24),
        );
        let hi = (config.scratchpads >> 5) & 0x1f;
        let lo = config.scratchpads & 0x1f;
        self.set(cap::HCSPARAMS2, (hi << 21) | (lo << 27));

        let xecp = if config.legacy_capability {
            (SimConfig::XECP_OFFSET as u32 / 4) << 16
        } else {
            0
        };
        self.set(cap::HCCPARAMS1, xecp | 1);
        self.set(cap::DBOFF, SimConfig::DOORBELL_OFFSET as u32);
        self.set(cap::RTSOFF, SimConfig::RUNTIME_OFFSET as u32);

        if config.legacy_capability {
            // a supported-protocol capability first, then legacy support
            let next = ((SimConfig::LEGACY_OFFSET - SimConfig::XECP_OFFSET) / 4) as u32;
            self.set(SimConfig::XECP_OFFSET, 0x02 | (next << 8));
            let bios = if config.bios_owned { USBLEGSUP_BIOS_OWNED } else { 0 };
            self.set(SimConfig::LEGACY_OFFSET, CAP_ID_LEGACY as u32 | bios);
        }

        self.set(SimConfig::CAP_LENGTH + op::PAGESIZE, config.page_size);
        if config.initially_running {
            self.set(USBCMD, usbcmd::RUN_STOP);
        } else {
            self.set(USBSTS, usbsts::HCH);
        }
    }

    fn get(&self, offset: usize) -> u32 {
        self.words[offset / 4]
    }

    fn set(&mut self, offset: usize, value: u32) {
        self.words[offset / 4] = value;
    }

    fn update(&mut self, offset: usize, f: impl FnOnce(u32) -> u32) {
        let value = f(self.get(offset));
        self.set(offset, value);
    }

    fn port_offset(&self, offset: usize) -> bool {
        let first = SimConfig::CAP_LENGTH + op::portsc(1);
        let last = SimConfig::CAP_LENGTH + op::portsc(self.config.max_ports.max(1));
        offset >= first && offset <= last && (offset - first) % op::PORT_STRIDE == 0
    }

    fn begin(&mut self, transition: Transition) {
        self.transition = transition;
        self.status_reads = 0;
    }

    fn advance(&mut self) {
        let reads = self.status_reads;
        let reached = |limit: Option<u32>| limit.is_some_and(|n| reads >= n);
        let halted = reached(self.config.halt_after);
        let ready = reached(self.config.ready_after);
        let running = reached(self.config.run_after);

        match self.transition {
            Transition::Idle => {}
            Transition::Halting if halted => {
                self.update(USBSTS, |sts| sts | usbsts::HCH);
                self.transition = Transition::Idle;
            }
            Transition::Starting if running => {
                self.update(USBSTS, |sts| sts & !usbsts::HCH);
                self.transition = Transition::Idle;
            }
            Transition::Resetting => {
                if halted {
                    self.update(USBSTS, |sts| sts | usbsts::HCH);
                }
                if ready {
                    self.update(USBSTS, |sts| sts & !usbsts::CNR);
                    self.update(USBCMD, |cmd| cmd & !usbcmd::HCRST);
                }
                if halted && ready {
                    self.transition = Transition::Idle;
                }
            }
            _ => {}
        }
    }

    fn read(&mut self, offset: usize) -> u32 {
        if offset == USBSTS {
            self.status_reads += 1;
            self.advance();
        } else if offset == SimConfig::LEGACY_OFFSET && self.config.legacy_capability {
            if let Some(reads) = self.legacy_reads.as_mut() {
                *reads += 1;
                let reads = *reads;
                if self.config.bios_release_after.is_some_and(|n| reads >= n) {
                    self.update(offset, |legsup| legsup & !USBLEGSUP_BIOS_OWNED);
                }
            }
        }
        self.get(offset)
    }

    fn write(&mut self, offset: usize, value: u32) {
        match offset {
            USBCMD => {
                let previous = self.get(USBCMD);
                let halted = self.get(USBSTS) & usbsts::HCH != 0;
                self.set(USBCMD, value);

                if value & usbcmd::HCRST != 0 {
                    self.update(USBSTS, |sts| (sts & !usbsts::HCH) | usbsts::CNR);
                    self.begin(Transition::Resetting);
                } else if value & usbcmd::RUN_STOP == 0 && !halted {
                    self.begin(Transition::Halting);
                } else if value & usbcmd::RUN_STOP != 0 && previous & usbcmd::RUN_STOP == 0 {
                    self.begin(Transition::Starting);
                }
            }
            USBSTS => self.update(USBSTS, |sts| sts & !(value & usbsts::RW1C)),
            IMAN => self.update(IMAN, |current| {
                (current & !iman::IE & !(value & iman::IP)) | (value & iman::IE)
            }),
            ERDP_LO => {
                self.erdp_writes.push(value);
                self.set(offset, value);
            }
            SimConfig::LEGACY_OFFSET if self.config.legacy_capability => {
                let bios = self.get(offset) & USBLEGSUP_BIOS_OWNED;
                self.set(offset, (value & !USBLEGSUP_BIOS_OWNED) | bios);
                if value & USBLEGSUP_OS_OWNED != 0 && self.legacy_reads.is_none() {
                    self.legacy_reads = Some(0);
                }
            }
            _ if (SimConfig::DOORBELL_OFFSET..DOORBELL_END).contains(&offset) => {
                self.doorbell_writes.push((offset - SimConfig::DOORBELL_OFFSET, value));
                self.set(offset, value);
            }
            _ if self.port_offset(offset) => self.write_port(offset, value),
            _ => self.set(offset, value),
        }
    }

    fn write_port(&mut self, offset: usize, value: u32) {
        let mut port = self.get(offset) & !(value & portsc::CHANGE_BITS);
        port = (port & !portsc::PP) | (value & portsc::PP);
        if value & portsc::PED != 0 {
            port &= !portsc::PED;
        }
        if value & portsc::PR != 0 && port & portsc::CCS != 0 {
            // reset completes instantly
            port |= portsc::PED | portsc::PRC;
        }
        self.set(offset, port);
    }
}

/// Register-level model of an xHCI controller
#[derive(Clone)]
pub struct SimulatedHc {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedHc {
    pub fn new(config: SimConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new(config))),
        }
    }

    /// Register value at a BAR offset, without read side effects
    pub fn raw(&self, offset: usize) -> u32 {
        self.state.lock().get(offset)
    }

    pub fn set_raw(&self, offset: usize, value: u32) {
        self.state.lock().set(offset, value);
    }

    /// Low halves written to ERDP, oldest first
    pub fn erdp_writes(&self) -> Vec<u32> {
        self.state.lock().erdp_writes.clone()
    }

    /// Doorbell writes as (offset from the doorbell base, value)
    pub fn doorbell_writes(&self) -> Vec<(usize, u32)> {
        self.state.lock().doorbell_writes.clone()
    }

    /// Set the raw PORTSC of a 1-based port
    pub fn set_port(&self, port: u8, value: u32) {
        self.set_raw(SimConfig::CAP_LENGTH + op::portsc(port), value);
    }

    /// Latch USBSTS bits as the hardware would
    pub fn raise_status(&self, bits: u32) {
        self.state.lock().update(USBSTS, |sts| sts | bits);
    }

    /// Signal the primary interrupter
    pub fn raise_interrupt(&self) {
        let mut state = self.state.lock();
        state.update(USBSTS, |sts| sts | usbsts::EINT);
        state.update(IMAN, |current| current | iman::IP);
    }

    /// Produce one event into the programmed event ring and interrupt
    pub fn post_event(&self, dma: &TestDma, mut trb: Trb) {
        {
            let mut state = self.state.lock();
            let erst = (state.get(SimConfig::RUNTIME_OFFSET + rt::ERSTBA_LO) as u64)
                | ((state.get(SimConfig::RUNTIME_OFFSET + rt::ERSTBA_HI) as u64) << 32);
            let erst = PhysAddr::new(erst);
            let base = PhysAddr::new(dma.read_u64(erst));
            let size = dma.read_u32(erst + 8u64) as usize;

            trb.set_cycle_bit(state.producer_cycle);
            let slot = base + (state.producer_index * 16) as u64;
            dma.write_u32(slot, trb.fields[0]);
            dma.write_u32(slot + 4u64, trb.fields[1]);
            dma.write_u32(slot + 8u64, trb.fields[2]);
            dma.write_u32(slot + 12u64, trb.fields[3]);

            state.producer_index += 1;
            if state.producer_index == size {
                state.producer_index = 0;
                state.producer_cycle = !state.producer_cycle;
            }
        }
        self.raise_interrupt();
    }
}

impl Mmio for SimulatedHc {
    fn read32(&self, offset: usize) -> u32 {
        self.state.lock().read(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.state.lock().write(offset, value);
    }

    fn len(&self) -> usize {
        self.state.lock().config.mapping_len
    }
}

/// Port Status Change event for a 1-based port
pub fn port_status_event(port: u8) -> Trb {
    let mut trb = Trb::new();
    trb.fields[0] = (port as u32) << 24;
    trb.fields[2] = 1 << 24;
    trb.set_trb_type(TrbType::PortStatusChangeEvent);
    trb
}

/// Command Completion event for the command at `command`
pub fn command_completion_event(command: PhysAddr, slot: u8) -> Trb {
    let mut trb = Trb::new();
    trb.set_parameter(command.as_u64());
    trb.fields[2] = 1 << 24;
    trb.fields[3] = (slot as u32) << 24;
    trb.set_trb_type(TrbType::CommandCompletionEvent);
    trb
}

/// Transfer event for slot/endpoint
pub fn transfer_event(slot: u8, endpoint: u8) -> Trb {
    let mut trb = Trb::new();
    trb.fields[2] = 1 << 24;
    trb.fields[3] = ((slot as u32) << 24) | ((endpoint as u32) << 16);
    trb.set_trb_type(TrbType::TransferEvent);
    trb
}
