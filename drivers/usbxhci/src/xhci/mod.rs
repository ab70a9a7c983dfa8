/// xHCI Host Controller Core
///
/// Register access, the command and event rings, controller lifecycle and
/// the interrupt to deferred procedure to worker dispatch pipeline for one
/// PCI xHCI controller.

pub mod controller;
pub mod dispatch;
pub mod legacy;
pub mod registers;
pub mod ring;
pub mod trb;


pub use controller::{
    ControllerState, HardwareResources, InterruptResource, PciIdentity, XhciController,
};
pub use dispatch::{
    CompletionQueues, CompletionSink, IsrStatus, StatusChangeNotify, WorkItem, WorkItems,
};
pub use legacy::HandoffOutcome;
pub use registers::{Mmio, MmioRegion, RegisterWindow};
pub use ring::{CommandRing, EventRing, MAX_EVENT_RING_TRBS};
pub use trb::{CompletionCode, Trb, TrbType};

use bit_field::BitField;
use registers::{cap, portsc};

/// USB speed classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbSpeed {
    Low,
    Full,
    High,
    Super,
    SuperPlus,
}

/// Snapshot of the capability registers, taken once after mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilitySet {
    /// Capability register length
    pub cap_length: u8,
    /// HCI version (BCD)
    pub hci_version: u16,
    /// Structural parameters 1
    pub hcsparams1: u32,
    /// Structural parameters 2
    pub hcsparams2: u32,
    /// Structural parameters 3
    pub hcsparams3: u32,
    /// Capability parameters 1
    pub hccparams1: u32,
    /// Doorbell offset
    pub doorbell_offset: u32,
    /// Runtime register space offset
    pub runtime_offset: u32,
    /// Capability parameters 2
    pub hccparams2: u32,
}

impl CapabilitySet {
    pub fn read<M: registers::Mmio>(regs: &registers::RegisterWindow<M>) -> Self {
        let caplength = regs.read_cap(cap::CAPLENGTH);
        Self {
            cap_length: caplength.get_bits(0..8) as u8,
            hci_version: caplength.get_bits(16..32) as u16,
            hcsparams1: regs.read_cap(cap::HCSPARAMS1),
            hcsparams2: regs.read_cap(cap::HCSPARAMS2),
            hcsparams3: regs.read_cap(cap::HCSPARAMS3),
            hccparams1: regs.read_cap(cap::HCCPARAMS1),
            doorbell_offset: regs.read_cap(cap::DBOFF) & !0x03,
            runtime_offset: regs.read_cap(cap::RTSOFF) & !0x1f,
            hccparams2: regs.read_cap(cap::HCCPARAMS2),
        }
    }

    /// Get the number of device slots
    pub fn max_device_slots(&self) -> u8 {
        self.hcsparams1.get_bits(0..8) as u8
    }

    /// Get the number of interrupters
    pub fn max_interrupters(&self) -> u16 {
        self.hcsparams1.get_bits(8..19) as u16
    }

    /// Get the number of ports
    pub fn max_ports(&self) -> u8 {
        self.hcsparams1.get_bits(24..32) as u8
    }

    /// Scratchpad buffer count; the field is split into a high part
    /// (bits 25:21) and a low part (bits 31:27).
    pub fn max_scratchpad_buffers(&self) -> u32 {
        let hi = self.hcsparams2.get_bits(21..26);
        let lo = self.hcsparams2.get_bits(27..32);
        (hi << 5) | lo
    }

    /// Byte offset of the first extended capability, if any
    pub fn extended_capabilities_offset(&self) -> Option<usize> {
        match self.hccparams1.get_bits(16..32) {
            0 => None,
            dwords => Some(dwords as usize * 4),
        }
    }

    /// Check if 64-bit addressing is supported
    pub fn supports_64bit(&self) -> bool {
        self.hccparams1.get_bit(0)
    }

    /// Check if context size is 64 bytes (vs 32 bytes)
    pub fn context_size_64(&self) -> bool {
        self.hccparams1.get_bit(2)
    }
}

/// Root hub port status and control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortStatus {
    /// Raw PORTSC register value
    pub portsc: u32,
}

impl PortStatus {
    pub fn new(portsc: u32) -> Self {
        Self { portsc }
    }

    /// Check if device is connected
    pub fn is_connected(&self) -> bool {
        self.portsc & portsc::CCS != 0
    }

    /// Check if port is enabled
    pub fn is_enabled(&self) -> bool {
        self.portsc & portsc::PED != 0
    }

    pub fn is_powered(&self) -> bool {
        self.portsc & portsc::PP != 0
    }

    pub fn is_over_current(&self) -> bool {
        self.portsc & portsc::OCA != 0
    }

    /// Check if a port reset is in progress
    pub fn is_resetting(&self) -> bool {
        self.portsc & portsc::PR != 0
    }

    /// Get the attached device speed
    pub fn speed(&self) -> Option<UsbSpeed> {
        match self.portsc.get_bits(10..14) {
            1 => Some(UsbSpeed::Full),
            2 => Some(UsbSpeed::Low),
            3 => Some(UsbSpeed::High),
            4 => Some(UsbSpeed::Super),
            5 => Some(UsbSpeed::SuperPlus),
            _ => None,
        }
    }

    pub fn connect_status_changed(&self) -> bool {
        self.portsc & portsc::CSC != 0
    }

    pub fn port_reset_changed(&self) -> bool {
        self.portsc & portsc::PRC != 0
    }

    /// Get all change bits
    pub fn change_bits(&self) -> u32 {
        self.portsc & portsc::CHANGE_BITS
    }
}

/// Port features that can be set through [`XhciController::set_port_feature`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortFeature {
    Power,
    Reset,
}

/// Identification of a configured controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDetails {
    pub vendor_id: u16,
    pub device_id: u16,
    pub hci_version: u16,
    pub max_slots: u8,
    pub port_count: u8,
    pub speed: UsbSpeed,
}
