//! xHCI Host Controller Core for PrismaOS
//!
//! Brings a PCI USB 3 host controller from power-on to the running state
//! and turns its interrupts into serviced completion events. The crate is
//! platform-agnostic: the register BAR, DMA memory and delays are supplied
//! by the embedding kernel through the [`Mmio`], [`DmaAllocator`] and
//! [`Delay`] traits.
//!
//! ```ignore
//! let mut controller = XhciController::new(dma, Box::new(SpinDelay::default()), ControllerConfig::default())?;
//! controller.start_device(resources)?;
//! let controller = Arc::new(controller);
//!
//! // interrupt handler
//! if controller.interrupt_service() == IsrStatus::Handled {
//!     schedule_dpc();
//! }
//! // deferred context
//! controller.run_deferred();
//! // worker task
//! controller.run_worker().await;
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod memory;
pub mod platform;
pub mod xhci;

#[cfg(test)]
pub(crate) mod testing;

pub use config::ControllerConfig;
pub use error::{Result, XhciError};
pub use memory::{DmaAllocator, DmaBuffer, DmaRegion, PoolStats};
pub use platform::{Delay, SpinDelay};
pub use xhci::{
    CapabilitySet, CompletionQueues, CompletionSink, ControllerState, DeviceDetails,
    HandoffOutcome, HardwareResources, InterruptResource, IsrStatus, Mmio, MmioRegion,
    PciIdentity, PortFeature, PortStatus, StatusChangeNotify, Trb, TrbType, UsbSpeed,
    XhciController,
};
