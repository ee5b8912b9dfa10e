// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![cfg_attr(feature = "strict", deny(warnings))]
#![deny(clippy::all)]

#[cfg(not(target_os = "linux"))]
compile_error!("costack requires epoll, eventfd and ucontext and therefore only builds on Linux");

#[macro_use]
extern crate log;

#[macro_use]
extern crate cfg_if;

pub mod collections;
pub mod config;
pub mod pal;
pub mod runtime;

pub use self::{
    config::Config,
    runtime::{
        condition_variable::{
            ConditionVariable,
            CondVarId,
            WaitStatus,
        },
        fail::Fail,
        scheduler::{
            SchedulerState,
            SharedScheduler,
            TaskHandle,
            TaskId,
            TaskState,
        },
        timer::TimerId,
    },
};

//======================================================================================================================
// Macros
//======================================================================================================================

/// Ensures that two expressions are equivalent or bails out of the enclosing function with an [anyhow::Error].
#[macro_export]
macro_rules! ensure_eq {
    ($left:expr, $right:expr $(,)?) => {{
        match (&$left, &$right) {
            (left_val, right_val) => {
                if !(*left_val == *right_val) {
                    ::anyhow::bail!(
                        "ensure_eq!({}, {}) failed: left={:?}, right={:?} ({}:{})",
                        stringify!($left),
                        stringify!($right),
                        left_val,
                        right_val,
                        file!(),
                        line!()
                    );
                }
            },
        }
    }};
}

/// Ensures that two expressions are not equivalent or bails out of the enclosing function with an [anyhow::Error].
#[macro_export]
macro_rules! ensure_neq {
    ($left:expr, $right:expr $(,)?) => {{
        match (&$left, &$right) {
            (left_val, right_val) => {
                if *left_val == *right_val {
                    ::anyhow::bail!(
                        "ensure_neq!({}, {}) failed: both={:?} ({}:{})",
                        stringify!($left),
                        stringify!($right),
                        left_val,
                        file!(),
                        line!()
                    );
                }
            },
        }
    }};
}
