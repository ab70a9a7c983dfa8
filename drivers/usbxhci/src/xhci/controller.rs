/// xHCI Host Controller Implementation
///
/// Owns the register window, the DMA structures the controller reads
/// (DCBAA, scratchpads, command and event rings) and drives the controller
/// from a freshly mapped BAR to the running state.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use spin::Mutex;
use x86_64::PhysAddr;
use super::{
    dispatch::{CompletionQueues, CompletionSink, StatusChangeGuard, StatusChangeNotify, WorkQueue},
    legacy::{self, HandoffOutcome},
    registers::*,
    ring::{CommandRing, EventRing},
    trb::Trb,
    CapabilitySet, DeviceDetails, PortFeature, PortStatus, UsbSpeed,
};
use crate::config::ControllerConfig;
use crate::error::{Result, XhciError};
use crate::memory::{alignment, DmaAllocator, DmaBuffer, DMA_ALIGN};
use crate::platform::Delay;

/// Controller lifecycle state
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Unmapped = 0,
    Mapped = 1,
    BiosHandoffPending = 2,
    Halted = 3,
    Resetting = 4,
    Configured = 5,
    Running = 6,
    Stopped = 7,
    Failed = 8,
}

impl From<u8> for ControllerState {
    fn from(value: u8) -> Self {
        match value {
            0 => ControllerState::Unmapped,
            1 => ControllerState::Mapped,
            2 => ControllerState::BiosHandoffPending,
            3 => ControllerState::Halted,
            4 => ControllerState::Resetting,
            5 => ControllerState::Configured,
            6 => ControllerState::Running,
            7 => ControllerState::Stopped,
            _ => ControllerState::Failed,
        }
    }
}

/// Interrupt line metadata, kept for the platform's interrupt registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptResource {
    pub vector: u8,
    pub level: u8,
    pub affinity: u64,
    pub shared: bool,
}

/// PCI identification of the controller function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PciIdentity {
    pub vendor_id: u16,
    pub device_id: u16,
}

/// Translated resources handed over by the bus driver at start
pub struct HardwareResources<M: Mmio> {
    /// The mapped memory BAR
    pub registers: M,
    pub interrupt: Option<InterruptResource>,
    pub identity: PciIdentity,
}

/// DMA manager plus every structure carved from it
pub(crate) struct DeviceState<A: DmaAllocator> {
    dma: A,
    pub(crate) event_ring: Option<EventRing>,
    command_ring: Option<CommandRing>,
    dcbaa: Option<DmaBuffer>,
    scratchpad_array: Option<DmaBuffer>,
    scratchpad_pages: Vec<DmaBuffer>,
    enabled_slots: u8,
}

impl<A: DmaAllocator> DeviceState<A> {
    fn new(dma: A) -> Self {
        Self {
            dma,
            event_ring: None,
            command_ring: None,
            dcbaa: None,
            scratchpad_array: None,
            scratchpad_pages: Vec::new(),
            enabled_slots: 0,
        }
    }

    /// Hand every structure back to the DMA manager
    fn release_all(&mut self) {
        if let Some(ring) = self.event_ring.take() {
            ring.release(&mut self.dma);
        }
        if let Some(ring) = self.command_ring.take() {
            ring.release(&mut self.dma);
        }
        for page in self.scratchpad_pages.drain(..) {
            self.dma.release(page);
        }
        if let Some(array) = self.scratchpad_array.take() {
            self.dma.release(array);
        }
        if let Some(dcbaa) = self.dcbaa.take() {
            self.dma.release(dcbaa);
        }
        self.enabled_slots = 0;
    }
}

/// xHCI Host Controller
pub struct XhciController<M: Mmio, A: DmaAllocator> {
    config: ControllerConfig,
    state: AtomicU8,
    configured: AtomicBool,
    pub(crate) regs: Option<RegisterWindow<M>>,
    caps: Option<CapabilitySet>,
    identity: PciIdentity,
    interrupt: Option<InterruptResource>,
    delay: Box<dyn Delay>,
    /// Serializes the DMA manager and the structures allocated from it
    pub(crate) device: Mutex<DeviceState<A>>,
    pub(crate) dpc_queued: AtomicBool,
    pub(crate) status_callback: Mutex<Option<Arc<dyn StatusChangeNotify>>>,
    pub(crate) status_guard: StatusChangeGuard,
    pub(crate) work_queue: WorkQueue,
    pub(crate) completion_sink: Mutex<Option<Arc<dyn CompletionSink>>>,
    pub(crate) default_completions: Arc<CompletionQueues>,
}

impl<M: Mmio, A: DmaAllocator> XhciController<M, A> {
    /// Create an unmapped controller instance
    pub fn new(dma: A, delay: Box<dyn Delay>, config: ControllerConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            config,
            state: AtomicU8::new(ControllerState::Unmapped as u8),
            configured: AtomicBool::new(false),
            regs: None,
            caps: None,
            identity: PciIdentity::default(),
            interrupt: None,
            delay,
            device: Mutex::new(DeviceState::new(dma)),
            dpc_queued: AtomicBool::new(false),
            status_callback: Mutex::new(None),
            status_guard: StatusChangeGuard::new(),
            work_queue: WorkQueue::new(),
            completion_sink: Mutex::new(None),
            default_completions: Arc::new(CompletionQueues::new(config.completion_queue_depth)),
        })
    }

    /// Get current controller state
    pub fn state(&self) -> ControllerState {
        ControllerState::from(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ControllerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Leave a failed controller failed
    fn set_state_unless_failed(&self, state: ControllerState) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != ControllerState::Failed as u8).then_some(state as u8)
            });
    }

    fn regs(&self) -> Result<&RegisterWindow<M>> {
        self.regs.as_ref().ok_or(XhciError::NotMapped)
    }

    pub fn capabilities(&self) -> Option<&CapabilitySet> {
        self.caps.as_ref()
    }

    pub fn interrupt_resource(&self) -> Option<InterruptResource> {
        self.interrupt
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Bus type reported to the USB stack
    pub fn usb_type(&self) -> &'static str {
        "USBXHCI"
    }

    /// Poll `done` up to `budget` times, stalling between polls
    fn poll_until(&self, budget: u32, mut done: impl FnMut() -> bool) -> bool {
        for _ in 0..budget {
            if done() {
                return true;
            }
            self.delay.stall_us(self.config.poll_stall_us);
        }
        false
    }

    /// Full start sequence for the PnP start request
    pub fn start_device(&mut self, resources: HardwareResources<M>) -> Result<()> {
        self.map_resources(resources)?;
        self.bios_handoff()?;
        self.reset_controller()?;
        self.configure()?;
        self.start()
    }

    /// Take over the register window and snapshot the capabilities
    pub fn map_resources(&mut self, resources: HardwareResources<M>) -> Result<()> {
        if self.state() != ControllerState::Unmapped {
            return Err(XhciError::InvalidState);
        }

        let regs = RegisterWindow::new(resources.registers).ok_or_else(|| {
            log::error!("xHCI: register offsets do not fit the memory resource");
            XhciError::InvalidResources
        })?;
        let caps = CapabilitySet::read(&regs);

        let ports = caps.max_ports();
        if ports == 0
            || regs.operational_base() + op::portsc(ports) + 4 > regs.len()
            || regs.doorbell_base() + (caps.max_device_slots() as usize + 1) * 4 > regs.len()
        {
            log::error!("xHCI: {} ports do not fit the memory resource", ports);
            return Err(XhciError::InvalidResources);
        }

        log::debug!(
            "xHCI: version {:#06x}, {} slots, {} ports, {} scratchpads, {} interrupters",
            caps.hci_version,
            caps.max_device_slots(),
            ports,
            caps.max_scratchpad_buffers(),
            caps.max_interrupters()
        );

        self.regs = Some(regs);
        self.caps = Some(caps);
        self.identity = resources.identity;
        self.interrupt = resources.interrupt;
        self.set_state(ControllerState::Mapped);
        Ok(())
    }

    /// Acquire the controller from firmware.
    ///
    /// Never fails because of the firmware; a controller that stays BIOS
    /// owned is logged and start continues.
    pub fn bios_handoff(&self) -> Result<HandoffOutcome> {
        let regs = self.regs()?;
        let caps = self.caps.as_ref().ok_or(XhciError::NotMapped)?;

        self.set_state(ControllerState::BiosHandoffPending);
        Ok(legacy::take_ownership(
            regs,
            caps,
            self.config.bios_handoff_retries,
            self.config.bios_handoff_delay_ms,
            self.delay.as_ref(),
        ))
    }

    /// Clear Run/Stop and wait for HCHalted.
    ///
    /// A configured or running controller ends up `Stopped`; anything
    /// earlier in the lifecycle ends up `Halted`.
    pub fn stop_controller(&self) -> Result<()> {
        let regs = self.regs()?;
        let next = match self.state() {
            ControllerState::Configured | ControllerState::Running | ControllerState::Stopped => {
                ControllerState::Stopped
            }
            _ => ControllerState::Halted,
        };

        regs.update_usbcmd(|cmd| cmd & !usbcmd::RUN_STOP);
        let halted = self.poll_until(self.config.halt_poll_budget, || {
            regs.read_op(op::USBSTS) & usbsts::HCH != 0
        });

        if !halted {
            log::error!(
                "xHCI: controller did not halt within {} polls",
                self.config.halt_poll_budget
            );
            return Err(XhciError::StopTimeout);
        }

        self.set_state_unless_failed(next);
        Ok(())
    }

    /// Reset the host controller.
    ///
    /// Waiting for HCHalted and waiting for Controller Not Ready to clear
    /// each get the full reset budget.
    pub fn reset_controller(&self) -> Result<()> {
        let regs = self.regs()?;

        if regs.read_op(op::USBSTS) & usbsts::HCH == 0 {
            self.stop_controller()?;
        }

        self.set_state(ControllerState::Resetting);
        regs.update_usbcmd(|cmd| cmd | usbcmd::HCRST);

        let budget = self.config.reset_poll_budget;
        if !self.poll_until(budget, || regs.read_op(op::USBSTS) & usbsts::HCH != 0) {
            log::error!("xHCI: controller did not halt during reset");
            return Err(XhciError::ResetHaltTimeout);
        }

        if !self.poll_until(budget, || regs.read_op(op::USBSTS) & usbsts::CNR == 0) {
            log::error!("xHCI: controller not ready after reset");
            return Err(XhciError::ResetNotReadyTimeout);
        }

        self.set_state(ControllerState::Halted);
        Ok(())
    }

    /// Controller page size from the PAGESIZE register
    fn page_size(regs: &RegisterWindow<M>) -> usize {
        match regs.read_op(op::PAGESIZE) & 0xffff {
            0 => alignment::PAGE,
            bits => 1 << (bits.trailing_zeros() + 12),
        }
    }

    /// Allocate and program the DMA structures, once per instance.
    ///
    /// On failure every structure allocated so far is released and the
    /// controller stays halted.
    pub fn configure(&self) -> Result<()> {
        let regs = self.regs()?;
        let caps = *self.caps.as_ref().ok_or(XhciError::NotMapped)?;

        if self.state() != ControllerState::Halted || self.configured.swap(true, Ordering::AcqRel) {
            return Err(XhciError::InvalidState);
        }

        let enabled_slots = match self.config.max_enabled_slots {
            Some(limit) => caps.max_device_slots().min(limit),
            None => caps.max_device_slots(),
        };
        let config = regs.read_op(op::CONFIG);
        regs.write_op(op::CONFIG, (config & !0xff) | enabled_slots as u32);

        let page_size = Self::page_size(regs);
        let mut device = self.device.lock();
        if let Err(err) = self.allocate_structures(&mut device, &caps, enabled_slots, page_size) {
            log::error!("xHCI: configuration failed: {}", err);
            device.release_all();
            return Err(err);
        }

        if let Some(dcbaa) = device.dcbaa.as_ref() {
            regs.write_op64(op::DCBAAP_LO, op::DCBAAP_HI, dcbaa.physical_address().as_u64());
        }
        if let Some(ring) = device.command_ring.as_ref() {
            ring.program(regs);
        }
        if let Some(ring) = device.event_ring.as_ref() {
            ring.program(regs);
        }
        drop(device);

        regs.write_rt(rt::IMOD, self.config.interrupt_moderation as u32);
        let management = regs.read_rt(rt::IMAN);
        regs.write_rt(rt::IMAN, management | iman::IE | iman::IP);

        self.set_state(ControllerState::Configured);
        log::info!("xHCI: configured {} device slots", enabled_slots);
        Ok(())
    }

    fn allocate_structures(
        &self,
        device: &mut DeviceState<A>,
        caps: &CapabilitySet,
        enabled_slots: u8,
        page_size: usize,
    ) -> Result<()> {
        let dcbaa = device
            .dma
            .allocate_aligned((caps.max_device_slots() as usize + 1) * 8, DMA_ALIGN)?;
        device.dcbaa = Some(dcbaa);
        device.enabled_slots = enabled_slots;

        let scratchpads = caps.max_scratchpad_buffers() as usize;
        if scratchpads > 0 {
            let array = device.dma.allocate_aligned(scratchpads * 8, DMA_ALIGN)?;
            device.scratchpad_array = Some(array);

            for index in 0..scratchpads {
                let page = device.dma.allocate_aligned(page_size, page_size)?;
                if let Some(array) = device.scratchpad_array.as_ref() {
                    array.write_u64(index * 8, page.physical_address().as_u64());
                }
                device.scratchpad_pages.push(page);
            }

            if let (Some(dcbaa), Some(array)) = (device.dcbaa.as_ref(), device.scratchpad_array.as_ref()) {
                dcbaa.write_u64(0, array.physical_address().as_u64());
            }
        }

        let command_ring = CommandRing::new(&mut device.dma, self.config.command_ring_trbs)?;
        device.command_ring = Some(command_ring);

        let event_ring = EventRing::new(&mut device.dma, self.config.event_ring_trbs)?;
        device.event_ring = Some(event_ring);

        Ok(())
    }

    /// Set Run/Stop with interrupts enabled and wait for HCHalted to clear
    pub fn start(&self) -> Result<()> {
        let regs = self.regs()?;
        if self.state() != ControllerState::Configured {
            return Err(XhciError::InvalidState);
        }

        regs.update_usbcmd(|cmd| cmd | usbcmd::RUN_STOP | usbcmd::INTE | usbcmd::HSEE);

        let running = self.poll_until(self.config.run_poll_budget, || {
            regs.read_op(op::USBSTS) & usbsts::HCH == 0
        });
        if !running {
            log::error!(
                "xHCI: controller still halted after {} polls",
                self.config.run_poll_budget
            );
            self.set_state(ControllerState::Failed);
            return Err(XhciError::RunTimeout);
        }

        self.set_state(ControllerState::Running);
        log::info!("xHCI: controller running");
        Ok(())
    }

    /// PnP stop: halt, disable interrupts and release all DMA structures.
    ///
    /// Resources are released even when the controller refuses to halt;
    /// the halt failure is still reported.
    pub fn pnp_stop(&self) -> Result<()> {
        let halted = match self.regs.as_ref() {
            Some(regs) => {
                let halted = self.stop_controller();
                regs.update_usbcmd(|cmd| cmd & !(usbcmd::INTE | usbcmd::HSEE));
                let management = regs.read_rt(rt::IMAN);
                regs.write_rt(rt::IMAN, (management & !iman::IE) | iman::IP);
                halted
            }
            None => Ok(()),
        };

        self.dpc_queued.store(false, Ordering::Release);
        self.device.lock().release_all();
        self.set_state(ControllerState::Stopped);
        halted
    }

    /// Enqueue a command TRB and ring the host controller doorbell.
    ///
    /// Returns the physical address of the TRB, which the completion
    /// event carries.
    pub fn submit_command(&self, trb: Trb) -> Result<PhysAddr> {
        let regs = self.regs()?;
        if self.state() != ControllerState::Running {
            return Err(XhciError::InvalidState);
        }

        let address = {
            let mut device = self.device.lock();
            let ring = device.command_ring.as_mut().ok_or(XhciError::InvalidState)?;
            ring.enqueue(trb)
        };

        regs.ring_doorbell(0, 0, 0);
        Ok(address)
    }

    /// Point DCBAA[slot] at a device context
    pub fn set_device_context(&self, slot: u8, context: PhysAddr) -> Result<()> {
        if !matches!(self.state(), ControllerState::Configured | ControllerState::Running) {
            return Err(XhciError::InvalidState);
        }

        let device = self.device.lock();
        if slot == 0 || slot > device.enabled_slots {
            return Err(XhciError::InvalidParameter);
        }
        let dcbaa = device.dcbaa.as_ref().ok_or(XhciError::InvalidState)?;
        dcbaa.write_u64(slot as usize * 8, context.as_u64());
        Ok(())
    }

    /// Physical address of the DCBAA and its entries
    pub fn device_context_array(&self) -> Option<(PhysAddr, Vec<u64>)> {
        let device = self.device.lock();
        let dcbaa = device.dcbaa.as_ref()?;
        let entries: Vec<u64> = (0..dcbaa.len() / 8).map(|i| dcbaa.read_u64(i * 8)).collect();
        Some((dcbaa.physical_address(), entries))
    }

    /// Identification data, valid from `Configured` onward
    pub fn device_details(&self) -> Result<DeviceDetails> {
        if !matches!(
            self.state(),
            ControllerState::Configured | ControllerState::Running | ControllerState::Stopped
        ) {
            return Err(XhciError::InvalidState);
        }
        let caps = self.caps.as_ref().ok_or(XhciError::NotMapped)?;

        Ok(DeviceDetails {
            vendor_id: self.identity.vendor_id,
            device_id: self.identity.device_id,
            hci_version: caps.hci_version,
            max_slots: caps.max_device_slots(),
            port_count: caps.max_ports(),
            speed: UsbSpeed::Super,
        })
    }

    fn port_register(&self, port: u8) -> Result<(&RegisterWindow<M>, usize)> {
        let regs = self.regs()?;
        let caps = self.caps.as_ref().ok_or(XhciError::NotMapped)?;
        if port == 0 || port > caps.max_ports() {
            return Err(XhciError::InvalidPort);
        }
        Ok((regs, op::portsc(port)))
    }

    /// Read a root hub port
    pub fn port_status(&self, port: u8) -> Result<PortStatus> {
        let (regs, offset) = self.port_register(port)?;
        Ok(PortStatus::new(regs.read_op(offset)))
    }

    /// Acknowledge the given change bits of a port
    pub fn clear_port_status(&self, port: u8, changes: u32) -> Result<()> {
        let (regs, offset) = self.port_register(port)?;
        let current = regs.read_op(offset);
        regs.write_op(offset, (current & portsc::PRESERVE_MASK) | (changes & portsc::CHANGE_BITS));
        Ok(())
    }

    pub fn set_port_feature(&self, port: u8, feature: PortFeature) -> Result<()> {
        let (regs, offset) = self.port_register(port)?;
        let current = regs.read_op(offset) & portsc::PRESERVE_MASK;
        let bit = match feature {
            PortFeature::Power => portsc::PP,
            PortFeature::Reset => portsc::PR,
        };
        regs.write_op(offset, current | bit);
        Ok(())
    }

    /// Reset a port and wait for Port Reset Change, which is then cleared
    pub fn reset_port(&self, port: u8) -> Result<PortStatus> {
        self.set_port_feature(port, PortFeature::Reset)?;

        let (regs, offset) = self.port_register(port)?;
        let done = self.poll_until(self.config.reset_poll_budget, || {
            regs.read_op(offset) & portsc::PRC != 0
        });
        if done {
            self.clear_port_status(port, portsc::PRC)?;
        } else {
            log::warn!("xHCI: port {} reset did not complete", port);
        }

        self.port_status(port)
    }
}
