//! Controller configuration

use crate::error::{Result, XhciError};
use crate::xhci::MAX_EVENT_RING_TRBS;

/// Tunables fixed at controller construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Event ring capacity in TRBs
    pub event_ring_trbs: usize,
    /// Command ring capacity in TRBs, including the Link TRB
    pub command_ring_trbs: usize,
    /// Polls waiting for HCHalted after clearing Run/Stop
    pub halt_poll_budget: u32,
    /// Polls per reset phase (halted, then controller ready)
    pub reset_poll_budget: u32,
    /// Polls waiting for HCHalted to clear after setting Run/Stop
    pub run_poll_budget: u32,
    /// Stall between two polls, in microseconds
    pub poll_stall_us: u32,
    /// Attempts waiting for the BIOS to release the controller
    pub bios_handoff_retries: u32,
    /// Delay between two BIOS handoff attempts, in milliseconds
    pub bios_handoff_delay_ms: u32,
    /// Interrupter moderation interval (250 ns units)
    pub interrupt_moderation: u16,
    /// Upper bound on enabled device slots
    pub max_enabled_slots: Option<u8>,
    /// Depth of each default completion queue
    pub completion_queue_depth: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            event_ring_trbs: 256,
            command_ring_trbs: 64,
            halt_poll_budget: 160,
            reset_poll_budget: 160,
            run_poll_budget: 1000,
            poll_stall_us: 100,
            bios_handoff_retries: 100,
            bios_handoff_delay_ms: 10,
            interrupt_moderation: 4000,
            max_enabled_slots: None,
            completion_queue_depth: 64,
        }
    }
}

impl ControllerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_ring_trbs(mut self, trbs: usize) -> Self {
        self.event_ring_trbs = trbs;
        self
    }

    pub fn with_command_ring_trbs(mut self, trbs: usize) -> Self {
        self.command_ring_trbs = trbs;
        self
    }

    /// Set the halt, reset and run poll budgets
    pub fn with_poll_budgets(mut self, halt: u32, reset: u32, run: u32) -> Self {
        self.halt_poll_budget = halt;
        self.reset_poll_budget = reset;
        self.run_poll_budget = run;
        self
    }

    pub fn with_poll_stall_us(mut self, us: u32) -> Self {
        self.poll_stall_us = us;
        self
    }

    pub fn with_bios_handoff(mut self, retries: u32, delay_ms: u32) -> Self {
        self.bios_handoff_retries = retries;
        self.bios_handoff_delay_ms = delay_ms;
        self
    }

    pub fn with_interrupt_moderation(mut self, interval: u16) -> Self {
        self.interrupt_moderation = interval;
        self
    }

    pub fn with_max_enabled_slots(mut self, slots: u8) -> Self {
        self.max_enabled_slots = Some(slots);
        self
    }

    pub fn with_completion_queue_depth(mut self, depth: usize) -> Self {
        self.completion_queue_depth = depth;
        self
    }

    /// Reject values the controller cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.event_ring_trbs < 2 || self.command_ring_trbs < 2 {
            log::error!(
                "xHCI: ring sizes must be at least 2 TRBs (event {}, command {})",
                self.event_ring_trbs,
                self.command_ring_trbs
            );
            return Err(XhciError::InvalidParameter);
        }

        if self.event_ring_trbs > MAX_EVENT_RING_TRBS {
            log::error!(
                "xHCI: event ring of {} TRBs exceeds one segment ({} max)",
                self.event_ring_trbs,
                MAX_EVENT_RING_TRBS
            );
            return Err(XhciError::InvalidParameter);
        }

        if self.halt_poll_budget == 0
            || self.reset_poll_budget == 0
            || self.run_poll_budget == 0
            || self.bios_handoff_retries == 0
        {
            log::error!("xHCI: poll budgets must be non-zero");
            return Err(XhciError::InvalidParameter);
        }

        if self.completion_queue_depth == 0 {
            return Err(XhciError::InvalidParameter);
        }

        Ok(())
    }
}
