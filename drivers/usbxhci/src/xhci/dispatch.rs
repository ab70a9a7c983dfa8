/// Interrupt to Deferred Procedure to Worker Dispatch
///
/// The interrupt service routine only acknowledges the controller and marks
/// the deferred procedure as queued. The deferred procedure drains the event
/// ring, hands completions to a [`CompletionSink`] and collapses any number
/// of port status changes into a single worker item. The worker, running in
/// an ordinary thread or async task, invokes the registered
/// [`StatusChangeNotify`] consumer.

use alloc::sync::Arc;
use core::{
    pin::Pin,
    sync::atomic::{AtomicU8, Ordering},
    task::{Context, Poll},
};
use crossbeam_queue::ArrayQueue;
use futures_util::{stream::Stream, task::AtomicWaker, StreamExt};
use super::controller::{ControllerState, XhciController};
use super::registers::{iman, op, rt, usbsts, Mmio};
use super::trb::{Trb, TrbType};
use crate::memory::DmaAllocator;

/// Outcome of [`XhciController::interrupt_service`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsrStatus {
    /// The interrupt was raised by this controller
    Handled,
    /// Not ours; offer it to the other sharers of the line
    NotHandled,
}

/// Consumer of command and transfer completion events.
///
/// Called from deferred context: implementations must not block.
pub trait CompletionSink: Send + Sync {
    fn complete_command(&self, trb: Trb);
    fn complete_transfer(&self, trb: Trb);
}

/// Bounded completion queues used until the USB queue layer installs its own sink
pub struct CompletionQueues {
    commands: ArrayQueue<Trb>,
    transfers: ArrayQueue<Trb>,
}

impl CompletionQueues {
    pub fn new(depth: usize) -> Self {
        Self {
            commands: ArrayQueue::new(depth),
            transfers: ArrayQueue::new(depth),
        }
    }

    pub fn pop_command(&self) -> Option<Trb> {
        self.commands.pop()
    }

    pub fn pop_transfer(&self) -> Option<Trb> {
        self.transfers.pop()
    }

    pub fn pending_commands(&self) -> usize {
        self.commands.len()
    }

    pub fn pending_transfers(&self) -> usize {
        self.transfers.len()
    }
}

impl CompletionSink for CompletionQueues {
    fn complete_command(&self, trb: Trb) {
        if self.commands.push(trb).is_err() {
            log::warn!("xHCI: command completion queue full, dropping event");
        }
    }

    fn complete_transfer(&self, trb: Trb) {
        if self.transfers.push(trb).is_err() {
            log::warn!("xHCI: transfer completion queue full, dropping event");
        }
    }
}

/// Consumer of root hub status changes, invoked from worker context with
/// no controller lock held
pub trait StatusChangeNotify: Send + Sync {
    fn status_changed(&self);
}

impl<F> StatusChangeNotify for F
where
    F: Fn() + Send + Sync,
{
    fn status_changed(&self) {
        self()
    }
}

/// Work handed from deferred context to the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkItem {
    StatusChange,
}

const GUARD_IDLE: u8 = 0;
const GUARD_BUSY: u8 = 1;
const GUARD_REARMED: u8 = 2;

/// Single-flight guard for the status change work item.
///
/// Idle, busy (one item queued or running) or busy with one more run
/// requested. Never holds more than one pending re-run.
pub(crate) struct StatusChangeGuard(AtomicU8);

impl StatusChangeGuard {
    pub(crate) const fn new() -> Self {
        Self(AtomicU8::new(GUARD_IDLE))
    }

    /// Returns true when the caller must queue the work item
    pub(crate) fn claim(&self) -> bool {
        let previous = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| match state {
                GUARD_IDLE => Some(GUARD_BUSY),
                GUARD_BUSY => Some(GUARD_REARMED),
                _ => None,
            });
        previous == Ok(GUARD_IDLE)
    }

    /// Returns true when a re-run was requested while the item was in flight
    pub(crate) fn release(&self) -> bool {
        self.0.fetch_sub(1, Ordering::AcqRel) == GUARD_REARMED
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.0.load(Ordering::Acquire) == GUARD_IDLE
    }
}

const WORK_QUEUE_DEPTH: usize = 4;

/// Lock-free queue between deferred context and the worker
pub(crate) struct WorkQueue {
    items: ArrayQueue<WorkItem>,
    waker: AtomicWaker,
}

impl WorkQueue {
    pub(crate) fn new() -> Self {
        Self {
            items: ArrayQueue::new(WORK_QUEUE_DEPTH),
            waker: AtomicWaker::new(),
        }
    }

    pub(crate) fn push(&self, item: WorkItem) -> bool {
        let queued = self.items.push(item).is_ok();
        if queued {
            self.waker.wake();
        }
        queued
    }

    pub(crate) fn pop(&self) -> Option<WorkItem> {
        self.items.pop()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }
}

/// Endless stream of work items for an async worker task
pub struct WorkItems<'a> {
    queue: &'a WorkQueue,
}

impl Stream for WorkItems<'_> {
    type Item = WorkItem;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<WorkItem>> {
        if let Some(item) = self.queue.pop() {
            return Poll::Ready(Some(item));
        }

        self.queue.waker.register(cx.waker());
        match self.queue.pop() {
            Some(item) => {
                self.queue.waker.take();
                Poll::Ready(Some(item))
            }
            None => Poll::Pending,
        }
    }
}

impl<M: Mmio, A: DmaAllocator> XhciController<M, A> {
    /// Interrupt service routine.
    ///
    /// Runs in interrupt context: no allocation, no locks, no blocking.
    pub fn interrupt_service(&self) -> IsrStatus {
        let Some(regs) = self.regs.as_ref() else {
            return IsrStatus::NotHandled;
        };
        // a stopped controller has its interrupter disabled; the line is shared
        if matches!(self.state(), ControllerState::Unmapped | ControllerState::Stopped) {
            return IsrStatus::NotHandled;
        }

        let status = regs.read_op(op::USBSTS);
        if status & usbsts::EINT == 0 {
            return IsrStatus::NotHandled;
        }

        // acknowledge by writing back what was read
        regs.write_op(op::USBSTS, status);

        if status & usbsts::FATAL != 0 {
            log::error!("xHCI: fatal controller status {:#010x}, controller failed", status);
            self.set_state(ControllerState::Failed);
            return IsrStatus::Handled;
        }

        let management = regs.read_rt(rt::IMAN);
        regs.write_rt(rt::IMAN, management | iman::IP);

        self.dpc_queued.store(true, Ordering::Release);
        IsrStatus::Handled
    }

    /// Run the deferred procedure if the ISR queued it.
    ///
    /// Called by the platform's deferred context; returns whether it ran.
    pub fn run_deferred(&self) -> bool {
        if !self.dpc_queued.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.deferred_procedure();
        true
    }

    /// Drain the event ring and route each event.
    ///
    /// The device lock is held for one dequeue at a time and never while a
    /// consumer runs.
    pub fn deferred_procedure(&self) {
        let Some(regs) = self.regs.as_ref() else {
            return;
        };
        if self.state() == ControllerState::Failed {
            return;
        }

        let sink = self.completion_sink();
        let mut notify = false;

        loop {
            let event = {
                let mut device = self.device.lock();
                match device.event_ring.as_mut() {
                    Some(ring) => ring.dequeue_next_event(regs),
                    None => None,
                }
            };
            let Some(trb) = event else {
                break;
            };

            match trb.trb_type() {
                TrbType::CommandCompletionEvent => sink.complete_command(trb),
                TrbType::TransferEvent => sink.complete_transfer(trb),
                TrbType::PortStatusChangeEvent => {
                    log::debug!("xHCI: port {} status change", trb.port_id());
                    notify = true;
                }
                other => log::debug!("xHCI: ignoring {:?} event", other),
            }
        }

        if notify && self.status_callback.lock().is_some() && self.status_guard.claim() {
            self.queue_status_change();
        }
    }

    pub(crate) fn queue_status_change(&self) {
        if !self.work_queue.push(WorkItem::StatusChange) {
            log::warn!("xHCI: worker queue full, status change dropped");
            while self.status_guard.release() {
                log::warn!("xHCI: requested status change re-run dropped");
            }
        }
    }

    /// Execute one work item in worker context
    pub fn process_work_item(&self, item: WorkItem) {
        match item {
            WorkItem::StatusChange => {
                let callback = self.status_callback.lock().clone();
                if let Some(callback) = callback {
                    callback.status_changed();
                }

                if self.status_guard.release() {
                    self.queue_status_change();
                }
            }
        }
    }

    /// Run queued work items until none are left; for a blocking worker thread
    pub fn run_pending_work(&self) -> usize {
        let mut processed = 0;
        while let Some(item) = self.work_queue.pop() {
            self.process_work_item(item);
            processed += 1;
        }
        processed
    }

    /// Stream of work items, for workers driven by an executor
    pub fn work_items(&self) -> WorkItems<'_> {
        WorkItems {
            queue: &self.work_queue,
        }
    }

    /// Async worker loop; completes only if the stream ends
    pub async fn run_worker(&self) {
        let mut items = self.work_items();
        while let Some(item) = items.next().await {
            self.process_work_item(item);
        }
    }

    /// Number of work items waiting for the worker
    pub fn pending_work(&self) -> usize {
        self.work_queue.len()
    }

    /// True when no status change notification is queued or running
    pub fn status_change_idle(&self) -> bool {
        self.status_guard.is_idle()
    }

    /// Register the status change consumer, replacing any previous one
    pub fn set_status_change_callback(&self, callback: Arc<dyn StatusChangeNotify>) {
        *self.status_callback.lock() = Some(callback);
    }

    /// Route completions to `sink` instead of the built-in queues
    pub fn set_completion_sink(&self, sink: Arc<dyn CompletionSink>) {
        *self.completion_sink.lock() = Some(sink);
    }

    fn completion_sink(&self) -> Arc<dyn CompletionSink> {
        match self.completion_sink.lock().as_ref() {
            Some(sink) => sink.clone(),
            None => self.default_completions.clone() as Arc<dyn CompletionSink>,
        }
    }

    /// The built-in completion queues
    pub fn completions(&self) -> &CompletionQueues {
        &self.default_completions
    }
}
