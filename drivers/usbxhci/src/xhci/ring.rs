/// xHCI Ring Management
///
/// The event ring (hardware producer, software consumer) and the command
/// ring (software producer, hardware consumer). Both are single-segment
/// circular arrays of TRBs in DMA memory whose slot ownership is decided by
/// the cycle bit.

use core::sync::atomic::{fence, Ordering};
use x86_64::PhysAddr;
use super::registers::{crcr, erdp, op, rt, Mmio, RegisterWindow};
use super::trb::{Trb, TRB_SIZE};
use crate::error::{Result, XhciError};
use crate::memory::{DmaAllocator, DmaBuffer};

/// Size of one Event Ring Segment Table entry
const ERST_ENTRY_SIZE: usize = 16;

/// Largest segment the 16-bit ERST size field can describe to hardware
pub const MAX_EVENT_RING_TRBS: usize = 4096;

/// Fixed-capacity TRB array in DMA memory with bounds-checked slot access
pub(crate) struct TrbArray {
    buffer: DmaBuffer,
    capacity: usize,
}

impl TrbArray {
    fn new<A: DmaAllocator + ?Sized>(dma: &mut A, capacity: usize) -> Result<Self> {
        let buffer = dma.allocate(capacity * TRB_SIZE)?;
        Ok(Self { buffer, capacity })
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn physical(&self, index: usize) -> PhysAddr {
        assert!(index <= self.capacity, "TRB slot {} outside ring of {}", index, self.capacity);
        self.buffer.physical_at(index * TRB_SIZE)
    }

    /// The control dword is read first; the rest is only meaningful once its
    /// cycle bit says the slot belongs to the reader.
    pub(crate) fn read(&self, index: usize) -> Trb {
        assert!(index < self.capacity, "TRB slot {} outside ring of {}", index, self.capacity);
        let base = index * TRB_SIZE;
        let control = self.buffer.read_u32(base + 12);
        fence(Ordering::Acquire);
        Trb::from_fields([
            self.buffer.read_u32(base),
            self.buffer.read_u32(base + 4),
            self.buffer.read_u32(base + 8),
            control,
        ])
    }

    fn read_control(&self, index: usize) -> u32 {
        assert!(index < self.capacity, "TRB slot {} outside ring of {}", index, self.capacity);
        self.buffer.read_u32(index * TRB_SIZE + 12)
    }

    /// The control dword (and with it the cycle bit) is written last.
    pub(crate) fn write(&self, index: usize, trb: &Trb) {
        assert!(index < self.capacity, "TRB slot {} outside ring of {}", index, self.capacity);
        let base = index * TRB_SIZE;
        self.buffer.write_u32(base, trb.fields[0]);
        self.buffer.write_u32(base + 4, trb.fields[1]);
        self.buffer.write_u32(base + 8, trb.fields[2]);
        fence(Ordering::Release);
        self.buffer.write_u32(base + 12, trb.fields[3]);
    }

    fn into_buffer(self) -> DmaBuffer {
        self.buffer
    }
}

/// Event Ring for xHCI events
pub struct EventRing {
    /// Event TRB slots
    trbs: TrbArray,
    /// Single-entry event ring segment table
    segment_table: DmaBuffer,
    /// Software dequeue cursor
    dequeue_index: usize,
    /// Expected (consumer) cycle state
    cycle_state: bool,
}

impl EventRing {
    /// Allocate `capacity` event slots and the segment table describing them
    pub fn new<A: DmaAllocator + ?Sized>(dma: &mut A, capacity: usize) -> Result<Self> {
        if !(2..=MAX_EVENT_RING_TRBS).contains(&capacity) {
            return Err(XhciError::InvalidParameter);
        }

        let trbs = TrbArray::new(dma, capacity)?;
        let segment_table = match dma.allocate(ERST_ENTRY_SIZE) {
            Ok(buffer) => buffer,
            Err(err) => {
                log::error!("xHCI: failed to allocate event ring segment table");
                dma.release(trbs.into_buffer());
                return Err(err);
            }
        };

        segment_table.write_u64(0, trbs.physical(0).as_u64());
        segment_table.write_u32(8, capacity as u32);
        segment_table.write_u32(12, 0);

        Ok(Self {
            trbs,
            segment_table,
            dequeue_index: 0,
            // hardware starts producing with cycle 1
            cycle_state: true,
        })
    }

    /// Program the primary interrupter with this ring
    pub fn program<M: Mmio>(&self, regs: &RegisterWindow<M>) {
        regs.write_rt(rt::ERSTSZ, 1);
        regs.write_rt64(
            rt::ERSTBA_LO,
            rt::ERSTBA_HI,
            self.segment_table.physical_address().as_u64(),
        );
        regs.write_rt64(rt::ERDP_LO, rt::ERDP_HI, self.trbs.physical(0).as_u64());
    }

    /// True when the slot at the cursor still belongs to the producer
    pub fn is_empty(&self) -> bool {
        let cycle = self.trbs.read_control(self.dequeue_index) & 1 != 0;
        cycle != self.cycle_state
    }

    /// Take the next event, if the controller has produced one.
    ///
    /// Advances the cursor (wrapping and toggling the expected cycle state at
    /// the end of the array) and acknowledges the event by writing the new
    /// dequeue pointer with Event Handler Busy set.
    pub fn dequeue_next_event<M: Mmio>(&mut self, regs: &RegisterWindow<M>) -> Option<Trb> {
        if self.is_empty() {
            return None;
        }

        let trb = self.trbs.read(self.dequeue_index);
        log::trace!(
            "xHCI: event {:?} completion {:?}",
            trb.trb_type(),
            trb.completion_code()
        );

        self.dequeue_index += 1;
        if self.dequeue_index == self.trbs.capacity() {
            self.dequeue_index = 0;
            self.cycle_state = !self.cycle_state;
        }

        let dequeue = self.dequeue_pointer().as_u64();
        regs.write_rt(rt::ERDP_LO, (dequeue as u32) | erdp::EHB);
        regs.write_rt(rt::ERDP_HI, (dequeue >> 32) as u32);

        Some(trb)
    }

    /// Physical address of the dequeue cursor
    pub fn dequeue_pointer(&self) -> PhysAddr {
        self.trbs.physical(self.dequeue_index)
    }

    pub fn dequeue_index(&self) -> usize {
        self.dequeue_index
    }

    pub fn cycle_state(&self) -> bool {
        self.cycle_state
    }

    pub fn capacity(&self) -> usize {
        self.trbs.capacity()
    }

    pub fn physical_base(&self) -> PhysAddr {
        self.trbs.physical(0)
    }

    pub fn segment_table_address(&self) -> PhysAddr {
        self.segment_table.physical_address()
    }

    /// Return the ring memory to the DMA manager
    pub fn release<A: DmaAllocator + ?Sized>(self, dma: &mut A) {
        dma.release(self.segment_table);
        dma.release(self.trbs.into_buffer());
    }

    #[cfg(test)]
    pub(crate) fn slots(&self) -> &TrbArray {
        &self.trbs
    }
}

/// Command Ring for xHCI commands
pub struct CommandRing {
    /// Command TRB slots; the last one is the Link TRB
    trbs: TrbArray,
    /// Software enqueue cursor
    enqueue_index: usize,
    /// Producer cycle state
    cycle_state: bool,
}

impl CommandRing {
    /// Allocate `capacity` slots and close the circle with a Link TRB
    pub fn new<A: DmaAllocator + ?Sized>(dma: &mut A, capacity: usize) -> Result<Self> {
        if capacity < 2 {
            return Err(XhciError::InvalidParameter);
        }

        let trbs = TrbArray::new(dma, capacity)?;
        let link = Trb::link(trbs.physical(0), true);
        trbs.write(capacity - 1, &link);

        Ok(Self {
            trbs,
            enqueue_index: 0,
            cycle_state: true,
        })
    }

    /// Program the Command Ring Control Register with this ring
    pub fn program<M: Mmio>(&self, regs: &RegisterWindow<M>) {
        let base = self.trbs.physical(0).as_u64();
        let mut low = (base as u32) & !0x3f;
        if self.cycle_state {
            low |= crcr::RCS;
        }
        regs.write_op(op::CRCR_LO, low);
        regs.write_op(op::CRCR_HI, (base >> 32) as u32);
    }

    /// Place a command on the ring and hand it to the controller.
    ///
    /// Returns the physical address of the slot, which is what the matching
    /// command completion event reports.
    pub fn enqueue(&mut self, mut trb: Trb) -> PhysAddr {
        trb.set_cycle_bit(self.cycle_state);
        let slot = self.trbs.physical(self.enqueue_index);
        self.trbs.write(self.enqueue_index, &trb);

        self.enqueue_index += 1;
        let link_index = self.trbs.capacity() - 1;
        if self.enqueue_index == link_index {
            let mut link = self.trbs.read(link_index);
            link.set_cycle_bit(self.cycle_state);
            self.trbs.write(link_index, &link);
            self.enqueue_index = 0;
            self.cycle_state = !self.cycle_state;
        }

        slot
    }

    pub fn cycle_state(&self) -> bool {
        self.cycle_state
    }

    pub fn enqueue_index(&self) -> usize {
        self.enqueue_index
    }

    pub fn physical_base(&self) -> PhysAddr {
        self.trbs.physical(0)
    }

    pub fn capacity(&self) -> usize {
        self.trbs.capacity()
    }

    /// Read back a slot
    pub fn slot(&self, index: usize) -> Trb {
        self.trbs.read(index)
    }

    /// Return the ring memory to the DMA manager
    pub fn release<A: DmaAllocator + ?Sized>(self, dma: &mut A) {
        dma.release(self.trbs.into_buffer());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{SimConfig, SimulatedHc, TestDma};
    use crate::xhci::trb::TrbType;

    fn window() -> (SimulatedHc, RegisterWindow<SimulatedHc>) {
        let sim = SimulatedHc::new(SimConfig::default());
        let regs = RegisterWindow::new(sim.clone()).unwrap();
        (sim, regs)
    }

    fn event(cycle: bool, trb_type: TrbType) -> Trb {
        let mut trb = Trb::new();
        trb.set_trb_type(trb_type);
        trb.set_cycle_bit(cycle);
        trb
    }

    #[test]
    fn event_ring_is_empty_after_programming() {
        let dma = TestDma::new(64 * 1024);
        let mut region = dma.region();
        let (sim, regs) = window();

        let mut ring = EventRing::new(&mut region, 16).unwrap();
        ring.program(&regs);

        let rt_base = SimConfig::RUNTIME_OFFSET;
        assert_eq!(sim.raw(rt_base + rt::ERSTSZ), 1);
        assert_eq!(sim.raw(rt_base + rt::ERSTBA_LO) as u64, ring.segment_table_address().as_u64());
        assert_eq!(sim.raw(rt_base + rt::ERDP_LO) as u64, ring.physical_base().as_u64());
        assert_eq!(dma.read_u64(ring.segment_table_address()), ring.physical_base().as_u64());
        assert_eq!(dma.read_u32(ring.segment_table_address() + 8u64), 16);

        assert!(ring.cycle_state());
        assert!(ring.is_empty());
        assert_eq!(ring.dequeue_next_event(&regs), None);
        // only the programming write, no acknowledgement
        assert_eq!(sim.erdp_writes().len(), 1);
    }

    #[test]
    fn full_pass_toggles_cycle_state_once() {
        for capacity in 2..=8 {
            let dma = TestDma::new(64 * 1024);
            let mut region = dma.region();
            let (sim, regs) = window();
            let mut ring = EventRing::new(&mut region, capacity).unwrap();
            ring.program(&regs);

            for index in 0..capacity {
                ring.slots().write(index, &event(true, TrbType::TransferEvent));
            }

            for consumed in 1..=capacity {
                assert!(ring.dequeue_next_event(&regs).is_some());
                if consumed < capacity {
                    assert!(ring.cycle_state());
                }
            }

            assert!(!ring.cycle_state());
            assert_eq!(ring.dequeue_index(), 0);
            let last = *sim.erdp_writes().last().unwrap();
            assert_eq!(last, ring.physical_base().as_u64() as u32 | erdp::EHB);

            // stale cycle-1 slots from the previous pass are not events
            assert!(ring.is_empty());
            assert_eq!(ring.dequeue_next_event(&regs), None);

            ring.slots().write(0, &event(false, TrbType::PortStatusChangeEvent));
            let next = ring.dequeue_next_event(&regs).unwrap();
            assert_eq!(next.trb_type(), TrbType::PortStatusChangeEvent);
        }
    }

    #[test]
    fn failed_segment_table_allocation_releases_ring() {
        // room for the TRBs but not the segment table
        let dma = TestDma::new(4 * 16);
        let mut region = dma.region();

        let err = EventRing::new(&mut region, 4).err();
        assert_eq!(err, Some(XhciError::InsufficientResources));
        assert_eq!(region.stats().allocated_bytes, 0);
    }

    #[test]
    fn event_ring_larger_than_one_segment_is_rejected() {
        let dma = TestDma::new(64 * 1024);
        let mut region = dma.region();

        let err = EventRing::new(&mut region, MAX_EVENT_RING_TRBS + 1).err();
        assert_eq!(err, Some(XhciError::InvalidParameter));
        assert_eq!(region.stats().allocated_bytes, 0);
    }

    #[test]
    fn command_ring_is_closed_by_link_trb() {
        let dma = TestDma::new(64 * 1024);
        let mut region = dma.region();
        let (sim, regs) = window();

        let ring = CommandRing::new(&mut region, 8).unwrap();
        ring.program(&regs);

        let link = ring.slot(7);
        assert_eq!(link.trb_type(), TrbType::Link);
        assert_eq!(link.parameter(), ring.physical_base().as_u64());
        assert!(link.toggle_cycle());

        let op_base = SimConfig::CAP_LENGTH;
        assert_eq!(
            sim.raw(op_base + op::CRCR_LO),
            ring.physical_base().as_u64() as u32 | crcr::RCS
        );
        assert_eq!(sim.raw(op_base + op::CRCR_HI), 0);
    }

    #[test]
    fn command_enqueue_wraps_through_link() {
        let dma = TestDma::new(64 * 1024);
        let mut region = dma.region();
        let mut ring = CommandRing::new(&mut region, 4).unwrap();

        let first = ring.enqueue(Trb::noop_command());
        assert_eq!(first, ring.physical_base());
        assert!(ring.slot(0).cycle_bit());

        ring.enqueue(Trb::noop_command());
        ring.enqueue(Trb::noop_command());

        // three usable slots consumed: link handed over, producer cycle flipped
        assert_eq!(ring.enqueue_index(), 0);
        assert!(!ring.cycle_state());
        assert!(ring.slot(3).cycle_bit());

        ring.enqueue(Trb::noop_command());
        assert!(!ring.slot(0).cycle_bit());
        assert_eq!(ring.slot(0).trb_type(), TrbType::NoOpCommand);

        ring.release(&mut region);
        assert_eq!(region.stats().allocated_bytes, 0);
    }
}
