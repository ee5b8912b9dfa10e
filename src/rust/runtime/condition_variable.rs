// Copyright (c) Microsoft Corporation. All rights reserved.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    collections::linked_queue::LinkedQueue,
    runtime::{
        fail::Fail,
        scheduler::{
            Listener,
            Scheduler,
            SharedScheduler,
            TaskHandle,
            TaskId,
            TimerEvent,
            WakeChannel,
        },
        timer::TimerId,
    },
};
use ::std::{
    cell::Cell,
    os::fd::RawFd,
    rc::Rc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Handle to a condition variable. Stale once the condition variable is destroyed.
#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug)]
pub struct CondVarId(u64);

/// How a wait ended.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WaitStatus {
    Signaled,
    TimedOut,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum TicketState {
    Pending,
    Fulfilled,
    Expired,
}

/// Outcome of one wait, shared by the waiting task, its queue entry and its timer. It leaves `Pending` exactly once, by
/// whichever of the signal path, the timer path or the destroy path gets to it first.
#[derive(Clone, Debug)]
pub(crate) struct WaitTicket(Rc<Cell<TicketState>>);

/// A task blocked on a condition variable.
struct Waiter {
    task: TaskId,
    timer: Option<TimerId>,
    ticket: WaitTicket,
}

/// Scheduler-side state of a condition variable.
pub(crate) struct CondVarSlot {
    channel: WakeChannel,
    /// Blocked tasks in arrival order.
    waiters: LinkedQueue<Waiter>,
    /// Wake units taken off the channel that no waiter has claimed yet.
    banked: u64,
}

/// Condition variable whose waiters are woken in FIFO order. Signals are counted: units that find no waiter are
/// banked for later waits.
#[derive(Clone)]
pub struct ConditionVariable {
    id: CondVarId,
    scheduler: SharedScheduler,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl WaitTicket {
    fn new() -> Self {
        Self(Rc::new(Cell::new(TicketState::Pending)))
    }

    pub fn state(&self) -> TicketState {
        self.0.get()
    }

    /// Moves a pending ticket to `outcome`. Returns false, and leaves the ticket alone, if it was already resolved.
    pub fn resolve(&self, outcome: TicketState) -> bool {
        if self.0.get() != TicketState::Pending {
            return false;
        }
        self.0.set(outcome);
        true
    }
}

impl ConditionVariable {
    /// Creates a condition variable with an empty waiter queue.
    pub fn new(scheduler: &SharedScheduler) -> Result<Self, Fail> {
        let mut scheduler: SharedScheduler = scheduler.clone();
        let channel: WakeChannel = WakeChannel::register(scheduler.epoll())?;
        let fd: RawFd = channel.as_raw_fd();
        let id: CondVarId = scheduler.condvars_mut().insert(CondVarSlot {
            channel,
            waiters: LinkedQueue::new(),
            banked: 0,
        });
        scheduler.register_listener(fd, Listener::CondVar(id));
        trace!("new(): id={:?}", id);
        Ok(Self { id, scheduler })
    }

    pub fn id(&self) -> CondVarId {
        self.id
    }

    /// Waits on this condition variable from `task`, which must be the running task.
    ///
    /// - A negative timeout blocks until a signal reaches this waiter.
    /// - A zero timeout polls: it claims a banked unit if there is one and never suspends.
    /// - A positive timeout blocks for at most that many milliseconds.
    pub fn wait(&self, task: &TaskHandle, timeout_ms: i64) -> Result<WaitStatus, Fail> {
        let mut scheduler: SharedScheduler = self.scheduler.clone();
        if try_consume(&mut scheduler, self.id)? {
            return Ok(WaitStatus::Signaled);
        }
        if timeout_ms == 0 {
            return Ok(WaitStatus::TimedOut);
        }
        if scheduler.current_task() != Some(task.id()) {
            let cause: String = format!("only the running task may block (task={:?})", task.id());
            error!("wait(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }

        let (key, ticket): (usize, WaitTicket) = enqueue(&mut scheduler, self.id, task.id(), timeout_ms)?;
        loop {
            if let Err(e) = task.yield_now() {
                withdraw(&mut scheduler, self.id, key, &ticket);
                return Err(e);
            }
            match ticket.state() {
                TicketState::Fulfilled => return Ok(WaitStatus::Signaled),
                TicketState::Expired => return Ok(WaitStatus::TimedOut),
                TicketState::Pending => trace!("wait(): resumed while still pending (task={:?})", task.id()),
            }
        }
    }

    /// Deposits `n` wake units. Waiters are resumed on the next loop iteration.
    pub fn signal(&self, n: u64) -> Result<(), Fail> {
        if n == 0 {
            return Ok(());
        }
        match self.scheduler.condvars().get(self.id) {
            Some(slot) => slot.channel.notify(n),
            None => Err(Fail::new(libc::ESRCH, "no such condition variable")),
        }
    }

    /// Deposits `n` wake units and suspends `task`, which must be the running task, until the waiters served by them
    /// have had a turn.
    pub fn signal_and_yield(&self, task: &TaskHandle, n: u64) -> Result<(), Fail> {
        let mut scheduler: SharedScheduler = self.scheduler.clone();
        if scheduler.current_task() != Some(task.id()) {
            let cause: String = format!("only the running task may yield (task={:?})", task.id());
            error!("signal_and_yield(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        self.signal(n)?;
        // Served waiters get their wake units ahead of ours.
        deliver(&mut scheduler, self.id)?;
        scheduler.resume(task.id())?;
        task.yield_now()
    }

    /// Wake units that no waiter has claimed yet.
    pub fn pending(&self) -> Result<u64, Fail> {
        let mut scheduler: SharedScheduler = self.scheduler.clone();
        deliver(&mut scheduler, self.id)?;
        Ok(slot_mut(&mut scheduler, self.id)?.banked)
    }

    /// Number of blocked tasks.
    pub fn waiters(&self) -> usize {
        self.scheduler
            .condvars()
            .get(self.id)
            .map(|slot| slot.waiters.len())
            .unwrap_or(0)
    }

    /// Releases this condition variable. Destroying one that still has waiters is a programming error and panics.
    pub fn destroy(self) -> Result<(), Fail> {
        let mut scheduler: SharedScheduler = self.scheduler.clone();
        let waiters: usize = match scheduler.condvars().get(self.id) {
            Some(slot) => slot.waiters.len(),
            None => return Err(Fail::new(libc::ESRCH, "no such condition variable")),
        };
        assert!(
            waiters == 0,
            "destroying condition variable {:?} with {} waiter(s)",
            self.id,
            waiters
        );
        if let Some(slot) = scheduler.condvars_mut().remove(self.id) {
            scheduler.unregister_listener(slot.channel.as_raw_fd());
            if slot.banked > 0 {
                debug!("destroy(): discarding {:?} banked unit(s) (id={:?})", slot.banked, self.id);
            }
        }
        trace!("destroy(): id={:?}", self.id);
        Ok(())
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

fn slot_mut(scheduler: &mut Scheduler, id: CondVarId) -> Result<&mut CondVarSlot, Fail> {
    scheduler
        .condvars_mut()
        .get_mut(id)
        .ok_or_else(|| Fail::new(libc::ESRCH, "no such condition variable"))
}

/// Moves every unit on the channel into the bank, then hands banked units to queued waiters in arrival order. Each
/// waiter served has its ticket fulfilled, its timer removed and its task resumed.
pub(crate) fn deliver(scheduler: &mut Scheduler, id: CondVarId) -> Result<(), Fail> {
    let mut served: Vec<Waiter> = Vec::new();
    {
        let slot: &mut CondVarSlot = slot_mut(scheduler, id)?;
        let count: u64 = slot.channel.drain()?;
        slot.banked = slot.banked.saturating_add(count);
        while slot.banked > 0 {
            let waiter: Waiter = match slot.waiters.pop_front() {
                Some(waiter) => waiter,
                None => break,
            };
            if waiter.ticket.resolve(TicketState::Fulfilled) {
                slot.banked -= 1;
                served.push(waiter);
            }
        }
    }
    for waiter in served {
        if let Some(timer) = waiter.timer {
            scheduler.timers_mut().remove(timer);
        }
        if let Err(e) = scheduler.resume(waiter.task) {
            warn!("deliver(): task={:?}: {:?}", waiter.task, e);
        }
    }
    Ok(())
}

/// Claims one banked unit, if any.
fn try_consume(scheduler: &mut Scheduler, id: CondVarId) -> Result<bool, Fail> {
    deliver(scheduler, id)?;
    let slot: &mut CondVarSlot = slot_mut(scheduler, id)?;
    if slot.banked > 0 {
        slot.banked -= 1;
        return Ok(true);
    }
    Ok(false)
}

/// Queues `task` as a waiter and, for a positive timeout, arms its expiry timer.
fn enqueue(
    scheduler: &mut Scheduler,
    id: CondVarId,
    task: TaskId,
    timeout_ms: i64,
) -> Result<(usize, WaitTicket), Fail> {
    let ticket: WaitTicket = WaitTicket::new();
    let key: usize = slot_mut(scheduler, id)?.waiters.push_back(Waiter {
        task,
        timer: None,
        ticket: ticket.clone(),
    });
    if timeout_ms > 0 {
        let deadline: i64 = scheduler.deadline_after(timeout_ms);
        let timer: TimerId = scheduler.timers_mut().push(
            deadline,
            TimerEvent::WaitExpiry {
                condvar: id,
                waiter: key,
                ticket: ticket.clone(),
            },
        );
        if let Some(waiter) = slot_mut(scheduler, id)?.waiters.get_mut(key) {
            waiter.timer = Some(timer);
        }
    }
    Ok((key, ticket))
}

/// Takes a still-pending waiter back out of the queue.
fn withdraw(scheduler: &mut Scheduler, id: CondVarId, key: usize, ticket: &WaitTicket) {
    if !ticket.resolve(TicketState::Expired) {
        return;
    }
    let waiter: Option<Waiter> = scheduler
        .condvars_mut()
        .get_mut(id)
        .and_then(|slot| slot.waiters.remove(key));
    if let Some(timer) = waiter.and_then(|waiter| waiter.timer) {
        scheduler.timers_mut().remove(timer);
    }
}

/// Timer path of a bounded wait. Does nothing if a signal already fulfilled the ticket.
pub(crate) fn expire(scheduler: &mut Scheduler, id: CondVarId, key: usize, ticket: WaitTicket) {
    if !ticket.resolve(TicketState::Expired) {
        trace!("expire(): already fulfilled (condvar={:?})", id);
        return;
    }
    let waiter: Option<Waiter> = scheduler
        .condvars_mut()
        .get_mut(id)
        .and_then(|slot| slot.waiters.remove(key));
    match waiter {
        Some(waiter) => {
            if let Err(e) = scheduler.resume(waiter.task) {
                warn!("expire(): task={:?}: {:?}", waiter.task, e);
            }
        },
        None => warn!("expire(): waiter is gone (condvar={:?}, key={:?})", id, key),
    }
}

/// Drops every waiter of `task` from every condition variable. Their tickets expire and their timers are removed.
pub(crate) fn purge_task(scheduler: &mut Scheduler, task: TaskId) {
    let mut timers: Vec<TimerId> = Vec::new();
    for (_, slot) in scheduler.condvars_mut().iter_mut() {
        let keys: Vec<usize> = slot
            .waiters
            .iter()
            .filter(|(_, waiter)| waiter.task == task)
            .map(|(key, _)| key)
            .collect();
        for key in keys {
            if let Some(waiter) = slot.waiters.remove(key) {
                waiter.ticket.resolve(TicketState::Expired);
                timers.extend(waiter.timer);
            }
        }
    }
    for timer in timers {
        scheduler.timers_mut().remove(timer);
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl From<u64> for CondVarId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<CondVarId> for u64 {
    fn from(value: CondVarId) -> Self {
        value.0
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
