/// Transfer Request Block (TRB) definitions for xHCI
///
/// TRBs are the fixed-size records exchanged between software and the
/// controller through the command, transfer and event rings.

use bit_field::BitField;
use x86_64::PhysAddr;

/// Size of one TRB in bytes
pub const TRB_SIZE: usize = 16;

/// TRB Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrbType {
    // Transfer TRBs
    Normal = 1,
    SetupStage = 2,
    DataStage = 3,
    StatusStage = 4,
    Isoch = 5,
    Link = 6,
    EventData = 7,
    NoOp = 8,

    // Command TRBs
    EnableSlotCommand = 9,
    DisableSlotCommand = 10,
    AddressDeviceCommand = 11,
    ConfigureEndpointCommand = 12,
    EvaluateContextCommand = 13,
    ResetEndpointCommand = 14,
    StopEndpointCommand = 15,
    SetTrDequeuePointerCommand = 16,
    ResetDeviceCommand = 17,
    NoOpCommand = 23,

    // Event TRBs
    TransferEvent = 32,
    CommandCompletionEvent = 33,
    PortStatusChangeEvent = 34,
    BandwidthRequestEvent = 35,
    DoorbellEvent = 36,
    HostControllerEvent = 37,
    DeviceNotificationEvent = 38,
    MfindexWrapEvent = 39,

    // Unknown TRB type
    Unknown = 63,
}

impl From<u8> for TrbType {
    fn from(value: u8) -> Self {
        match value {
            1 => TrbType::Normal,
            2 => TrbType::SetupStage,
            3 => TrbType::DataStage,
            4 => TrbType::StatusStage,
            5 => TrbType::Isoch,
            6 => TrbType::Link,
            7 => TrbType::EventData,
            8 => TrbType::NoOp,
            9 => TrbType::EnableSlotCommand,
            10 => TrbType::DisableSlotCommand,
            11 => TrbType::AddressDeviceCommand,
            12 => TrbType::ConfigureEndpointCommand,
            13 => TrbType::EvaluateContextCommand,
            14 => TrbType::ResetEndpointCommand,
            15 => TrbType::StopEndpointCommand,
            16 => TrbType::SetTrDequeuePointerCommand,
            17 => TrbType::ResetDeviceCommand,
            23 => TrbType::NoOpCommand,
            32 => TrbType::TransferEvent,
            33 => TrbType::CommandCompletionEvent,
            34 => TrbType::PortStatusChangeEvent,
            35 => TrbType::BandwidthRequestEvent,
            36 => TrbType::DoorbellEvent,
            37 => TrbType::HostControllerEvent,
            38 => TrbType::DeviceNotificationEvent,
            39 => TrbType::MfindexWrapEvent,
            _ => TrbType::Unknown,
        }
    }
}

/// Completion codes reported in event TRBs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionCode {
    Invalid,
    Success,
    DataBufferError,
    BabbleDetected,
    UsbTransactionError,
    TrbError,
    StallError,
    ShortPacket,
    CommandRingStopped,
    CommandAborted,
    EventRingFullError,
    Other(u8),
}

impl From<u8> for CompletionCode {
    fn from(value: u8) -> Self {
        match value {
            0 => CompletionCode::Invalid,
            1 => CompletionCode::Success,
            2 => CompletionCode::DataBufferError,
            3 => CompletionCode::BabbleDetected,
            4 => CompletionCode::UsbTransactionError,
            5 => CompletionCode::TrbError,
            6 => CompletionCode::StallError,
            13 => CompletionCode::ShortPacket,
            21 => CompletionCode::EventRingFullError,
            24 => CompletionCode::CommandRingStopped,
            25 => CompletionCode::CommandAborted,
            other => CompletionCode::Other(other),
        }
    }
}

/// Generic TRB: four little-endian dwords shared with the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C, align(16))]
pub struct Trb {
    pub fields: [u32; 4],
}

impl Trb {
    /// Create an all-zero TRB
    pub const fn new() -> Self {
        Self { fields: [0; 4] }
    }

    pub const fn from_fields(fields: [u32; 4]) -> Self {
        Self { fields }
    }

    /// Get the TRB type
    pub fn trb_type(&self) -> TrbType {
        TrbType::from(self.fields[3].get_bits(10..16) as u8)
    }

    /// Set the TRB type
    pub fn set_trb_type(&mut self, trb_type: TrbType) {
        self.fields[3].set_bits(10..16, trb_type as u32);
    }

    /// Get the cycle bit
    pub fn cycle_bit(&self) -> bool {
        self.fields[3].get_bit(0)
    }

    /// Set the cycle bit
    pub fn set_cycle_bit(&mut self, cycle: bool) {
        self.fields[3].set_bit(0, cycle);
    }

    /// Toggle Cycle flag (Link TRBs)
    pub fn toggle_cycle(&self) -> bool {
        self.fields[3].get_bit(1)
    }

    pub fn set_toggle_cycle(&mut self, toggle: bool) {
        self.fields[3].set_bit(1, toggle);
    }

    /// 64-bit parameter (dwords 0 and 1)
    pub fn parameter(&self) -> u64 {
        (self.fields[0] as u64) | ((self.fields[1] as u64) << 32)
    }

    pub fn set_parameter(&mut self, value: u64) {
        self.fields[0] = value as u32;
        self.fields[1] = (value >> 32) as u32;
    }

    /// Completion code of an event TRB
    pub fn completion_code(&self) -> CompletionCode {
        CompletionCode::from(self.fields[2].get_bits(24..32) as u8)
    }

    /// Slot ID of a command completion or transfer event
    pub fn slot_id(&self) -> u8 {
        self.fields[3].get_bits(24..32) as u8
    }

    /// Root hub port of a port status change event
    pub fn port_id(&self) -> u8 {
        self.fields[0].get_bits(24..32) as u8
    }

    /// Link TRB pointing at `target`
    pub fn link(target: PhysAddr, toggle_cycle: bool) -> Self {
        let mut trb = Self::new();
        trb.set_parameter(target.as_u64() & !0xf);
        trb.set_trb_type(TrbType::Link);
        trb.set_toggle_cycle(toggle_cycle);
        trb
    }

    /// No Op command
    pub fn noop_command() -> Self {
        let mut trb = Self::new();
        trb.set_trb_type(TrbType::NoOpCommand);
        trb
    }

    /// Enable Slot command for the given protocol slot type
    pub fn enable_slot_command(slot_type: u8) -> Self {
        let mut trb = Self::new();
        trb.set_trb_type(TrbType::EnableSlotCommand);
        trb.fields[3].set_bits(16..21, slot_type as u32);
        trb
    }
}
