// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    scheduler::{
        channel::WakeChannel,
        context::{
            Context,
            Stack,
        },
        SharedScheduler,
    },
    timer::TimerId,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Externally visible task identifier. Stale once the task is destroyed.
#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug)]
pub struct TaskId(u64);

/// Lifecycle of a task.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TaskState {
    /// Created but never switched in.
    Ready,
    /// Currently executing.
    Running,
    /// Parked in a yield, waiting for a wake unit.
    Suspended,
    /// Entry routine returned. Waiting to be destroyed.
    Finished,
}

/// Entry routine of a task.
pub type TaskEntry = Box<dyn FnOnce(TaskHandle)>;

/// Scheduler-side record of a task.
pub struct TaskSlot {
    pub name: String,
    /// Task that receives a wake unit when this one finishes. The loop task has no owner.
    pub owner: Option<TaskId>,
    pub state: TaskState,
    /// Taken when the task is first switched in.
    pub entry: Option<TaskEntry>,
    pub context: Context,
    pub stack: Stack,
    /// The loop task is never woken through a channel.
    pub channel: Option<WakeChannel>,
}

/// What a task's entry routine receives: its own identity plus the scheduler it runs on.
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    scheduler: SharedScheduler,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl TaskHandle {
    pub(crate) fn new(id: TaskId, scheduler: SharedScheduler) -> Self {
        Self { id, scheduler }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn scheduler(&self) -> SharedScheduler {
        self.scheduler.clone()
    }

    /// Suspends this task until something resumes it.
    pub fn yield_now(&self) -> Result<(), Fail> {
        let mut scheduler: SharedScheduler = self.scheduler.clone();
        scheduler.yield_task(self.id)
    }

    /// Creates a task owned by this one. It starts on a later loop iteration.
    pub fn spawn<F: FnOnce(TaskHandle) + 'static>(&self, name: &str, entry: F) -> Result<TaskId, Fail> {
        let mut scheduler: SharedScheduler = self.scheduler.clone();
        scheduler.create_task(self.id, name, entry)
    }

    /// Suspends this task for at least `timeout_ms` milliseconds. Resumes from other sources while the timer is
    /// pending are swallowed.
    pub fn sleep(&self, timeout_ms: i64) -> Result<(), Fail> {
        let mut scheduler: SharedScheduler = self.scheduler.clone();
        let timer: TimerId = scheduler.arm_timer(self.id, timeout_ms)?;
        while scheduler.has_timer(timer) {
            if let Err(e) = scheduler.yield_task(self.id) {
                scheduler.cancel_timer(timer);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Asks the scheduler to stop once the current batch of callbacks completes.
    pub fn exit(&self) {
        let mut scheduler: SharedScheduler = self.scheduler.clone();
        scheduler.exit();
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl From<u64> for TaskId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<TaskId> for u64 {
    fn from(value: TaskId) -> Self {
        value.0
    }
}
