// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Implementation of our scheduler.
//!
//! The event loop runs as a task of its own: `run()` switches from the caller's context (the origin) into the loop,
//! and the loop switches into whichever task the multiplexer reports ready. Every task suspends back into the loop and
//! every finished task falls through into it, so at most two frames of switching are ever stacked.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    collections::arena::Arena,
    config::Config,
    pal::Epoll,
    runtime::{
        condition_variable::{
            self,
            CondVarId,
            CondVarSlot,
            WaitTicket,
        },
        fail::Fail,
        scheduler::{
            channel::WakeChannel,
            context::{
                Context,
                Stack,
            },
            task::{
                TaskEntry,
                TaskHandle,
                TaskId,
                TaskSlot,
                TaskState,
            },
        },
        timer::{
            TimerHeap,
            TimerId,
        },
        SharedObject,
    },
};
use ::libc::{
    c_int,
    epoll_event,
    ucontext_t,
};
use ::std::{
    any::Any,
    cell::RefCell,
    collections::HashMap,
    ops::{
        Deref,
        DerefMut,
    },
    os::fd::RawFd,
    panic::{
        self,
        AssertUnwindSafe,
    },
    time::Instant,
};

//======================================================================================================================
// Thread-Local Variables
//======================================================================================================================

thread_local! {
    /// Scheduler whose loop is running on this thread. Task entry points find their scheduler here.
    static ACTIVE: RefCell<Option<SharedScheduler>> = const { RefCell::new(None) };
}

//======================================================================================================================
// Structures
//======================================================================================================================

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SchedulerState {
    Running,
    /// Exit was requested. The loop stops after its current batch of callbacks.
    Stopping,
    Stopped,
}

/// Owner of a wake channel registered with the multiplexer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Listener {
    Task(TaskId),
    CondVar(CondVarId),
}

/// What happens when a timer expires.
pub(crate) enum TimerEvent {
    /// Deposit a wake unit into the task.
    Wakeup(TaskId),
    /// Time out a bounded wait, unless a signal got to it first.
    WaitExpiry {
        condvar: CondVarId,
        waiter: usize,
        ticket: WaitTicket,
    },
}

/// Task scheduler. Fields are dropped in declaration order, so the multiplexer outlives every channel registered with
/// it.
pub struct Scheduler {
    stack_size: usize,
    timer_slack_ms: i64,
    max_events: usize,
    /// Checked by the loop once per iteration.
    go: bool,
    launched: bool,
    state: SchedulerState,
    /// Origin of the millisecond clock.
    epoch: Instant,
    /// Task whose continuation is executing, if the loop is running.
    current: Option<TaskId>,
    loop_task: TaskId,
    entry_task: TaskId,
    /// First panic caught at a task boundary. Re-raised by `run()`.
    panicked: Option<Box<dyn Any + Send>>,
    /// Error that stopped the loop.
    failure: Option<Fail>,
    listeners: HashMap<RawFd, Listener>,
    timers: TimerHeap<TimerEvent>,
    condvars: Arena<CondVarId, CondVarSlot>,
    tasks: Arena<TaskId, TaskSlot>,
    /// Continuation of the caller of `run()`.
    origin: Context,
    epoll: Epoll,
}

#[derive(Clone)]
pub struct SharedScheduler(SharedObject<Scheduler>);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl SharedScheduler {
    /// Builds a scheduler whose first task runs `entry`. Nothing runs until [SharedScheduler::run] is called.
    pub fn new<F: FnOnce(TaskHandle) + 'static>(config: &Config, entry: F) -> Result<Self, Fail> {
        let scheduler: Scheduler = Scheduler {
            stack_size: config.stack_size()?,
            timer_slack_ms: config.timer_slack_ms()?,
            max_events: config.max_events()?,
            go: true,
            launched: false,
            state: SchedulerState::Running,
            epoch: Instant::now(),
            current: None,
            loop_task: TaskId::from(0),
            entry_task: TaskId::from(0),
            panicked: None,
            failure: None,
            listeners: HashMap::default(),
            timers: TimerHeap::default(),
            condvars: Arena::default(),
            tasks: Arena::default(),
            origin: Context::empty(),
            epoll: Epoll::new()?,
        };
        let mut me: Self = Self(SharedObject::new(scheduler));
        let origin: *mut ucontext_t = me.origin.as_mut_ptr();
        let loop_task: TaskId = me.insert_task(None, "loop", None, origin, loop_trampoline)?;
        me.loop_task = loop_task;
        me.entry_task = me.create_task(loop_task, "entry", entry)?;
        debug!(
            "new(): stack_size={:?}, timer_slack_ms={:?}, max_events={:?}",
            me.stack_size, me.timer_slack_ms, me.max_events
        );
        Ok(me)
    }

    /// Runs the event loop on the calling thread until some task calls exit, then releases every task, condition
    /// variable, timer and the multiplexer. A panic raised inside a task is re-raised here.
    pub fn run(&mut self) -> Result<(), Fail> {
        if self.launched {
            return Err(Fail::new(libc::EINVAL, "scheduler already ran"));
        }
        if Self::active().is_some() {
            let cause: &str = "another scheduler is running on this thread";
            error!("run(): {}", cause);
            return Err(Fail::new(libc::EBUSY, cause));
        }
        self.launched = true;
        ACTIVE.with(|active| *active.borrow_mut() = Some(self.clone()));

        let loop_task: TaskId = self.loop_task;
        let origin: *mut ucontext_t = self.origin.as_mut_ptr();
        let result: Result<(), Fail> = match self.tasks.get_mut(loop_task) {
            Some(slot) => {
                slot.state = TaskState::Running;
                let to: *mut ucontext_t = slot.context.as_mut_ptr();
                self.current = Some(loop_task);
                unsafe { Context::swap(origin, to) }
            },
            None => Err(Fail::new(libc::ESRCH, "loop task is gone")),
        };

        // The loop returned through its link.
        self.current = None;
        let _active: Option<SharedScheduler> = ACTIVE.with(|active| active.borrow_mut().take());
        self.teardown();
        if let Some(payload) = self.panicked.take() {
            panic::resume_unwind(payload);
        }
        match self.failure.take() {
            Some(e) => Err(e),
            None => result,
        }
    }

    /// Scheduler whose loop is running on the calling thread.
    fn active() -> Option<Self> {
        ACTIVE.with(|active| active.borrow().clone())
    }
}

impl Scheduler {
    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Requests the loop to stop once the current batch of callbacks completes.
    pub fn exit(&mut self) {
        self.go = false;
        if self.state == SchedulerState::Running {
            debug!("exit(): stopping");
            self.state = SchedulerState::Stopping;
        }
    }

    /// Creates a task that runs `entry` on its own stack. When the entry returns, `owner` receives a wake unit, unless
    /// the owner is the loop. The new task starts on a later loop iteration.
    pub fn create_task<F: FnOnce(TaskHandle) + 'static>(
        &mut self,
        owner: TaskId,
        name: &str,
        entry: F,
    ) -> Result<TaskId, Fail> {
        if self.state == SchedulerState::Stopped {
            return Err(Fail::new(libc::EINVAL, "scheduler has stopped"));
        }
        if !self.tasks.contains(owner) {
            let cause: String = format!("no such owner (owner={:?})", owner);
            error!("create_task(): {}", cause);
            return Err(Fail::new(libc::ESRCH, &cause));
        }
        let link: *mut ucontext_t = self.loop_context()?;
        self.insert_task(Some(owner), name, Some(Box::new(entry)), link, task_trampoline)
    }

    /// Deposits one wake unit into `task`. Never suspends the caller.
    pub fn resume(&self, task: TaskId) -> Result<(), Fail> {
        match self.tasks.get(task) {
            Some(slot) => match &slot.channel {
                Some(channel) => channel.notify(1),
                None => Err(Fail::new(libc::EINVAL, "the loop task cannot be resumed")),
            },
            None => Err(Fail::new(libc::ESRCH, "no such task")),
        }
    }

    /// Suspends `task`, which must be the running task, and switches back to the loop.
    pub fn yield_task(&mut self, task: TaskId) -> Result<(), Fail> {
        if self.current != Some(task) || task == self.loop_task {
            let cause: String = format!("only the running task may yield (task={:?})", task);
            error!("yield_task(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        let to: *mut ucontext_t = self.loop_context()?;
        let from: *mut ucontext_t = match self.tasks.get_mut(task) {
            Some(slot) => {
                slot.state = TaskState::Suspended;
                slot.context.as_mut_ptr()
            },
            None => return Err(Fail::new(libc::ESRCH, "no such task")),
        };
        self.current = Some(self.loop_task);
        unsafe { Context::swap(from, to) }
    }

    /// Releases a task that is not running. A suspended task is abandoned mid-flight: its frames are never unwound.
    pub fn destroy_task(&mut self, task: TaskId) -> Result<(), Fail> {
        if task == self.loop_task {
            return Err(Fail::new(libc::EINVAL, "the loop task cannot be destroyed"));
        }
        if self.current == Some(task) {
            return Err(Fail::new(libc::EBUSY, "cannot destroy the running task"));
        }
        let fd: Option<RawFd> = match self.tasks.get(task) {
            Some(slot) => slot.channel.as_ref().map(WakeChannel::as_raw_fd),
            None => return Err(Fail::new(libc::ESRCH, "no such task")),
        };
        if let Some(fd) = fd {
            self.listeners.remove(&fd);
        }
        condition_variable::purge_task(self, task);
        self.timers
            .remove_where(|event| matches!(event, TimerEvent::Wakeup(target) if *target == task));
        if let Some(slot) = self.tasks.remove(task) {
            if slot.state == TaskState::Suspended {
                debug!("destroy_task(): abandoning suspended task {:?}", slot.name);
            }
            trace!(
                "destroy_task(): name={:?}, id={:?}, stack_size={:?}",
                slot.name,
                task,
                slot.stack.len()
            );
        }
        Ok(())
    }

    pub fn task_state(&self, task: TaskId) -> Option<TaskState> {
        self.tasks.get(task).map(|slot| slot.state)
    }

    pub fn task_name(&self, task: TaskId) -> Option<&str> {
        self.tasks.get(task).map(|slot| slot.name.as_str())
    }

    pub fn loop_task(&self) -> TaskId {
        self.loop_task
    }

    pub fn entry_task(&self) -> TaskId {
        self.entry_task
    }

    pub fn current_task(&self) -> Option<TaskId> {
        self.current
    }

    /// Milliseconds elapsed since the scheduler was built, rounded down.
    pub fn now_ms(&self) -> i64 {
        i64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(i64::MAX)
    }

    /// Number of armed timers, including those of bounded waits.
    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Arms a timer that resumes `task` once `timeout_ms` milliseconds have passed.
    pub fn arm_timer(&mut self, task: TaskId, timeout_ms: i64) -> Result<TimerId, Fail> {
        if timeout_ms < 0 {
            return Err(Fail::new(libc::EINVAL, "negative timeout"));
        }
        if task == self.loop_task || !self.tasks.contains(task) {
            return Err(Fail::new(libc::ESRCH, "no such task"));
        }
        let deadline: i64 = self.deadline_after(timeout_ms);
        let timer: TimerId = self.timers.push(deadline, TimerEvent::Wakeup(task));
        trace!("arm_timer(): task={:?}, deadline={:?}", task, deadline);
        Ok(timer)
    }

    /// Disarms a timer. Returns false if it already fired.
    pub fn cancel_timer(&mut self, timer: TimerId) -> bool {
        self.timers.remove(timer).is_some()
    }

    pub fn has_timer(&self, timer: TimerId) -> bool {
        self.timers.contains(timer)
    }

    /// Deadline `timeout_ms` from now, rounded up to the next millisecond so that it never fires early.
    pub(crate) fn deadline_after(&self, timeout_ms: i64) -> i64 {
        let elapsed_us: i64 = i64::try_from(self.epoch.elapsed().as_micros()).unwrap_or(i64::MAX);
        let deadline_us: i64 = elapsed_us.saturating_add(timeout_ms.saturating_mul(1000));
        deadline_us.saturating_add(999) / 1000
    }

    pub(crate) fn epoll(&self) -> &Epoll {
        &self.epoll
    }

    pub(crate) fn timers_mut(&mut self) -> &mut TimerHeap<TimerEvent> {
        &mut self.timers
    }

    pub(crate) fn condvars(&self) -> &Arena<CondVarId, CondVarSlot> {
        &self.condvars
    }

    pub(crate) fn condvars_mut(&mut self) -> &mut Arena<CondVarId, CondVarSlot> {
        &mut self.condvars
    }

    pub(crate) fn register_listener(&mut self, fd: RawFd, listener: Listener) {
        if let Some(old) = self.listeners.insert(fd, listener) {
            warn!("register_listener(): replacing listener (fd={:?}, old={:?})", fd, old);
        }
    }

    pub(crate) fn unregister_listener(&mut self, fd: RawFd) {
        self.listeners.remove(&fd);
    }

    /// Drains the wake channel of `task` without switching into it.
    #[cfg(test)]
    pub(crate) fn take_wake_units(&self, task: TaskId) -> Result<u64, Fail> {
        match self.tasks.get(task).and_then(|slot| slot.channel.as_ref()) {
            Some(channel) => channel.drain(),
            None => Err(Fail::new(libc::ESRCH, "no such task")),
        }
    }

    /// Runs the event loop until exit is requested.
    fn event_loop(&mut self) -> Result<(), Fail> {
        let mut events: Vec<epoll_event> = vec![epoll_event { events: 0, u64: 0 }; self.max_events];
        while self.go {
            let timeout_ms: c_int = self.next_timeout_ms();
            let nevents: usize = self.epoll.wait(&mut events, timeout_ms)?;
            self.fire_expired_timers();
            for event in events.iter().take(nevents) {
                let fd: RawFd = event.u64 as RawFd;
                self.dispatch(fd);
            }
        }
        Ok(())
    }

    /// Milliseconds until the earliest deadline, or `-1` to block until some descriptor becomes ready.
    fn next_timeout_ms(&self) -> c_int {
        match self.timers.peek() {
            Some((deadline, _)) => (deadline - self.now_ms()).clamp(0, c_int::MAX as i64) as c_int,
            None => -1,
        }
    }

    /// Fires, in deadline order, every timer due within the slack window. The slack only batches wakeups: a bounded
    /// wait never times out ahead of its deadline, so the pass stops at the first wait expiry that is not yet due.
    pub(crate) fn fire_expired_timers(&mut self) {
        let now: i64 = self.now_ms();
        let horizon: i64 = now.saturating_add(self.timer_slack_ms);
        while let Some((deadline, timer)) = self.timers.peek() {
            if deadline > horizon {
                break;
            }
            if deadline > now && matches!(self.timers.get(timer), Some(TimerEvent::WaitExpiry { .. })) {
                trace!("fire_expired_timers(): wait expiry not due yet (deadline={:?}, now={:?})", deadline, now);
                break;
            }
            let event: TimerEvent = match self.timers.pop() {
                Some((_, event)) => event,
                None => break,
            };
            match event {
                TimerEvent::Wakeup(task) => {
                    if let Err(e) = self.resume(task) {
                        debug!("fire_expired_timers(): task={:?}: {:?}", task, e);
                    }
                },
                TimerEvent::WaitExpiry {
                    condvar,
                    waiter,
                    ticket,
                } => {
                    // Units already on the channel settle the wait before the timer does.
                    if let Err(e) = condition_variable::deliver(self, condvar) {
                        debug!("fire_expired_timers(): condvar={:?}: {:?}", condvar, e);
                    }
                    condition_variable::expire(self, condvar, waiter, ticket)
                },
            }
        }
    }

    /// Hands a ready descriptor to its listener.
    fn dispatch(&mut self, fd: RawFd) {
        match self.listeners.get(&fd).copied() {
            Some(Listener::Task(task)) => {
                if let Err(e) = self.wake_task(task) {
                    warn!("dispatch(): task={:?}: {:?}", task, e);
                }
            },
            Some(Listener::CondVar(condvar)) => {
                if let Err(e) = condition_variable::deliver(self, condvar) {
                    warn!("dispatch(): condvar={:?}: {:?}", condvar, e);
                }
            },
            // Deregistered by an earlier callback of the same batch.
            None => trace!("dispatch(): no listener (fd={:?})", fd),
        }
    }

    /// Clears the wake channel of `task` and switches into it if a unit was pending.
    fn wake_task(&mut self, task: TaskId) -> Result<(), Fail> {
        let slot: &TaskSlot = match self.tasks.get(task) {
            Some(slot) => slot,
            None => return Ok(()),
        };
        let count: u64 = match &slot.channel {
            Some(channel) => channel.drain()?,
            None => 0,
        };
        if count == 0 {
            return Ok(());
        }
        if slot.state == TaskState::Finished {
            trace!("wake_task(): {:?} already finished", slot.name);
            return Ok(());
        }
        self.switch_into(task)
    }

    /// Switches from the loop into `task`. Returns once the task yields or finishes.
    fn switch_into(&mut self, task: TaskId) -> Result<(), Fail> {
        let from: *mut ucontext_t = self.loop_context()?;
        let to: *mut ucontext_t = match self.tasks.get_mut(task) {
            Some(slot) => {
                slot.state = TaskState::Running;
                slot.context.as_mut_ptr()
            },
            None => return Err(Fail::new(libc::ESRCH, "no such task")),
        };
        self.current = Some(task);
        let result: Result<(), Fail> = unsafe { Context::swap(from, to) };
        self.current = Some(self.loop_task);
        if result.is_err() {
            if let Some(slot) = self.tasks.get_mut(task) {
                slot.state = TaskState::Suspended;
            }
        }
        result
    }

    fn loop_context(&mut self) -> Result<*mut ucontext_t, Fail> {
        match self.tasks.get_mut(self.loop_task) {
            Some(slot) => Ok(slot.context.as_mut_ptr()),
            None => Err(Fail::new(libc::ESRCH, "loop task is gone")),
        }
    }

    /// Allocates the stack, continuation and wake channel of a task. Tasks with an owner are armed with one wake unit.
    /// Partially acquired resources are released on failure.
    fn insert_task(
        &mut self,
        owner: Option<TaskId>,
        name: &str,
        entry: Option<TaskEntry>,
        link: *mut ucontext_t,
        trampoline: extern "C" fn(),
    ) -> Result<TaskId, Fail> {
        let mut stack: Stack = Stack::new(self.stack_size)?;
        let context: Context = Context::with_entry(&mut stack, link, trampoline)?;
        let channel: Option<WakeChannel> = match owner {
            Some(_) => Some(WakeChannel::register(&self.epoll)?),
            None => None,
        };
        let fd: Option<RawFd> = channel.as_ref().map(WakeChannel::as_raw_fd);
        let task: TaskId = self.tasks.insert(TaskSlot {
            name: name.to_string(),
            owner,
            state: TaskState::Ready,
            entry,
            context,
            stack,
            channel,
        });
        if let Some(fd) = fd {
            self.register_listener(fd, Listener::Task(task));
            if let Err(e) = self.resume(task) {
                error!("insert_task(): {:?}", e);
                self.listeners.remove(&fd);
                self.tasks.remove(task);
                return Err(e);
            }
        }
        trace!("insert_task(): name={:?}, id={:?}", name, task);
        Ok(task)
    }

    /// Marks `task` finished and notifies its owner.
    fn finish_task(&mut self, task: TaskId) {
        let owner: Option<TaskId> = match self.tasks.get_mut(task) {
            Some(slot) => {
                slot.state = TaskState::Finished;
                trace!("finish_task(): name={:?}", slot.name);
                slot.owner
            },
            None => None,
        };
        self.current = Some(self.loop_task);
        if let Some(owner) = owner {
            if owner != self.loop_task {
                if let Err(e) = self.resume(owner) {
                    debug!("finish_task(): owner={:?}: {:?}", owner, e);
                }
            }
        }
    }

    fn record_panic(&mut self, task: TaskId, payload: Box<dyn Any + Send>) {
        error!("record_panic(): task {:?} panicked, stopping", task);
        if self.panicked.is_none() {
            self.panicked = Some(payload);
        }
        self.exit();
    }

    /// Releases everything the scheduler still holds once the loop has stopped.
    fn teardown(&mut self) {
        self.go = false;
        self.listeners.clear();
        let timers: Vec<TimerEvent> = self.timers.clear();
        if !timers.is_empty() {
            debug!("teardown(): dropping {:?} pending timer(s)", timers.len());
        }
        let condvars: Vec<CondVarSlot> = self.condvars.drain();
        if !condvars.is_empty() {
            warn!("teardown(): {:?} condition variable(s) were never destroyed", condvars.len());
        }
        drop(condvars);
        for slot in self.tasks.drain() {
            if slot.state == TaskState::Suspended {
                debug!("teardown(): abandoning suspended task {:?}", slot.name);
            }
        }
        self.epoll.close();
        self.state = SchedulerState::Stopped;
        debug!("teardown(): stopped");
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// First frame of every user task.
extern "C" fn task_trampoline() {
    let mut scheduler: SharedScheduler = match SharedScheduler::active() {
        Some(scheduler) => scheduler,
        None => {
            error!("task_trampoline(): no scheduler is running on this thread");
            return;
        },
    };
    let task: TaskId = match scheduler.current {
        Some(task) => task,
        None => {
            error!("task_trampoline(): no current task");
            return;
        },
    };
    let entry: Option<TaskEntry> = scheduler.tasks.get_mut(task).and_then(|slot| slot.entry.take());
    if let Some(entry) = entry {
        let handle: TaskHandle = TaskHandle::new(task, scheduler.clone());
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || entry(handle))) {
            scheduler.record_panic(task, payload);
        }
    }
    scheduler.finish_task(task);
    // Falls through into the loop.
}

/// First frame of the loop task.
extern "C" fn loop_trampoline() {
    let mut scheduler: SharedScheduler = match SharedScheduler::active() {
        Some(scheduler) => scheduler,
        None => {
            error!("loop_trampoline(): no scheduler is running on this thread");
            return;
        },
    };
    let mut shared: SharedScheduler = scheduler.clone();
    match panic::catch_unwind(AssertUnwindSafe(move || shared.event_loop())) {
        Ok(Ok(())) => trace!("loop_trampoline(): loop stopped"),
        Ok(Err(e)) => {
            error!("loop_trampoline(): {:?}", e);
            scheduler.failure = Some(e);
        },
        Err(payload) => {
            if scheduler.panicked.is_none() {
                scheduler.panicked = Some(payload);
            }
        },
    }
    scheduler.go = false;
    // Falls through into the origin.
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Deref for SharedScheduler {
    type Target = Scheduler;

    fn deref(&self) -> &Self::Target {
        self.0.deref()
    }
}

impl DerefMut for SharedScheduler {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.deref_mut()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
