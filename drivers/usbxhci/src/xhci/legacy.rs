/// BIOS to OS ownership handoff through the USB Legacy Support capability

use bit_field::BitField;
use super::registers::{Mmio, RegisterWindow};
use super::CapabilitySet;
use crate::platform::Delay;

/// Extended capability ID of USB Legacy Support
pub const CAP_ID_LEGACY: u8 = 0x01;
/// HC BIOS Owned Semaphore
pub const USBLEGSUP_BIOS_OWNED: u32 = 1 << 16;
/// HC OS Owned Semaphore
pub const USBLEGSUP_OS_OWNED: u32 = 1 << 24;

/// Upper bound on capabilities visited, against a looping list
const MAX_CAPABILITIES: usize = 64;

/// Result of a handoff attempt; none of these fail controller start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffOutcome {
    /// No extended capability list, or no legacy capability in it
    NotPresent,
    /// Legacy capability found, firmware did not own the controller
    NotBiosOwned,
    /// Firmware released the controller after `polls` reads
    Acquired { polls: u32 },
    /// Firmware still owned the controller when the retries ran out
    StillBiosOwned,
}

/// Find the legacy support capability and return its byte offset
pub fn find_legacy_capability<M: Mmio>(
    regs: &RegisterWindow<M>,
    caps: &CapabilitySet,
) -> Option<usize> {
    let mut offset = caps.extended_capabilities_offset()?;

    for _ in 0..MAX_CAPABILITIES {
        if offset + 8 > regs.len() {
            log::warn!("xHCI: extended capability at {:#x} outside BAR", offset);
            return None;
        }

        let header = regs.read_cap(offset);
        if header.get_bits(0..8) as u8 == CAP_ID_LEGACY {
            return Some(offset);
        }

        // next pointer is relative, in dwords
        match header.get_bits(8..16) {
            0 => return None,
            next => offset += next as usize * 4,
        }
    }

    log::warn!("xHCI: extended capability list does not terminate");
    None
}

/// Request OS ownership and wait, within `retries` attempts, for the BIOS
/// to let go. SMI enables are cleared once ownership is obtained.
pub fn take_ownership<M: Mmio>(
    regs: &RegisterWindow<M>,
    caps: &CapabilitySet,
    retries: u32,
    delay_ms: u32,
    delay: &dyn Delay,
) -> HandoffOutcome {
    let Some(offset) = find_legacy_capability(regs, caps) else {
        log::debug!("xHCI: no USB legacy support capability");
        return HandoffOutcome::NotPresent;
    };

    let legsup = regs.read_cap(offset);
    if legsup & USBLEGSUP_BIOS_OWNED == 0 {
        regs.write_cap(offset, legsup | USBLEGSUP_OS_OWNED);
        log::debug!("xHCI: controller not BIOS owned (USBLEGSUP={:#010x})", legsup);
        return HandoffOutcome::NotBiosOwned;
    }

    log::debug!("xHCI: taking ownership from BIOS (USBLEGSUP={:#010x})", legsup);
    regs.write_cap(offset, legsup | USBLEGSUP_OS_OWNED);

    for poll in 1..=retries {
        if regs.read_cap(offset) & USBLEGSUP_BIOS_OWNED == 0 {
            // USBLEGCTLSTS: drop SMI enables, write back RW1C status
            let ctlsts = regs.read_cap(offset + 4);
            regs.write_cap(offset + 4, ctlsts & 0xffff_0000);

            log::info!("xHCI: BIOS released ownership after {} polls", poll);
            return HandoffOutcome::Acquired { polls: poll };
        }
        delay.sleep_ms(delay_ms);
    }

    log::warn!("xHCI: controller still BIOS owned after {} attempts, continuing", retries);
    HandoffOutcome::StillBiosOwned
}
