// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Single-threaded scheduler of stackful tasks. Each task runs on a private stack and suspends by switching machine
//! contexts back to the event loop, which itself runs as a task on its own stack. Tasks are woken through per-task
//! wake channels multiplexed by epoll, and sleep on a shared timer heap.

mod channel;
mod context;
#[allow(clippy::module_inception)]
mod scheduler;
mod task;

//======================================================================================================================
// Exports
//======================================================================================================================

pub(crate) use self::{
    channel::WakeChannel,
    scheduler::{
        Listener,
        TimerEvent,
    },
};
pub use self::{
    context::MIN_STACK_SIZE,
    scheduler::{
        Scheduler,
        SchedulerState,
        SharedScheduler,
    },
    task::{
        TaskHandle,
        TaskId,
        TaskState,
    },
};
