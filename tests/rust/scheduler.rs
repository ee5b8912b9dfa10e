// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod common;

//==============================================================================
// Imports
//==============================================================================

use ::anyhow::Result;
use ::costack::{
    ConditionVariable,
    Config,
    SchedulerState,
    SharedScheduler,
    TaskHandle,
    TaskId,
    TaskState,
    TimerId,
};
use ::std::{
    cell::RefCell,
    rc::Rc,
    time::{
        Duration,
        Instant,
    },
};

//==============================================================================
// test_finished_child_wakes_owner()
//==============================================================================

/// Tests that a task that returns from its entry hands control back to its owner.
#[test]
fn test_finished_child_wakes_owner() -> Result<()> {
    let log: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
    let recorded: Rc<RefCell<Vec<&'static str>>> = log.clone();

    common::run(&common::config(2)?, move |task: &TaskHandle| {
        let child_log: Rc<RefCell<Vec<&'static str>>> = log.clone();
        let child: TaskId = task.spawn("child", move |_: TaskHandle| {
            child_log.borrow_mut().push("child");
        })?;
        costack::ensure_eq!(task.scheduler().task_state(child), Some(TaskState::Ready));
        log.borrow_mut().push("entry");

        task.yield_now()?;
        log.borrow_mut().push("entry-resumed");
        costack::ensure_eq!(task.scheduler().task_state(child), Some(TaskState::Finished));

        task.scheduler().destroy_task(child)?;
        costack::ensure_eq!(task.scheduler().task_state(child), None);
        Ok(())
    })?;

    costack::ensure_eq!(*recorded.borrow(), vec!["entry", "child", "entry-resumed"]);
    Ok(())
}

//==============================================================================
// test_resume_wakes_suspended_task()
//==============================================================================

/// Tests that resuming a suspended task runs it on a later loop iteration.
#[test]
fn test_resume_wakes_suspended_task() -> Result<()> {
    let log: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
    let recorded: Rc<RefCell<Vec<&'static str>>> = log.clone();

    common::run(&common::config(2)?, move |task: &TaskHandle| {
        let child_log: Rc<RefCell<Vec<&'static str>>> = log.clone();
        let child: TaskId = task.spawn("child", move |handle: TaskHandle| {
            child_log.borrow_mut().push("child-start");
            if handle.yield_now().is_ok() {
                child_log.borrow_mut().push("child-resumed");
            }
        })?;

        task.sleep(5)?;
        costack::ensure_eq!(task.scheduler().task_state(child), Some(TaskState::Suspended));
        costack::ensure_eq!(*log.borrow(), vec!["child-start"]);

        // Resuming only deposits a wake unit.
        task.scheduler().resume(child)?;
        costack::ensure_eq!(log.borrow().len(), 1);

        task.yield_now()?;
        costack::ensure_eq!(task.scheduler().task_state(child), Some(TaskState::Finished));
        task.scheduler().destroy_task(child)?;
        Ok(())
    })?;

    costack::ensure_eq!(*recorded.borrow(), vec!["child-start", "child-resumed"]);
    Ok(())
}

//==============================================================================
// test_destroy_rules()
//==============================================================================

/// Tests which tasks may be destroyed.
#[test]
fn test_destroy_rules() -> Result<()> {
    common::run(&common::config(2)?, |task: &TaskHandle| {
        let mut scheduler: SharedScheduler = task.scheduler();
        costack::ensure_eq!(scheduler.destroy_task(task.id()).map_err(|e| e.errno), Err(libc::EBUSY));
        let loop_task: TaskId = scheduler.loop_task();
        costack::ensure_eq!(scheduler.destroy_task(loop_task).map_err(|e| e.errno), Err(libc::EINVAL));
        costack::ensure_eq!(scheduler.entry_task(), task.id());
        costack::ensure_eq!(scheduler.task_state(task.id()), Some(TaskState::Running));
        Ok(())
    })
}

//==============================================================================
// test_destroy_blocked_task()
//==============================================================================

/// Tests that destroying a task blocked on a condition variable takes it off the waiter queue.
#[test]
fn test_destroy_blocked_task() -> Result<()> {
    common::run(&common::config(2)?, |task: &TaskHandle| {
        let cv: ConditionVariable = ConditionVariable::new(&task.scheduler())?;
        let waiter: ConditionVariable = cv.clone();
        let child: TaskId = task.spawn("blocked", move |handle: TaskHandle| {
            let _ = waiter.wait(&handle, 60_000);
        })?;

        task.sleep(5)?;
        costack::ensure_eq!(cv.waiters(), 1);
        costack::ensure_eq!(task.scheduler().pending_timers(), 1);

        task.scheduler().destroy_task(child)?;
        costack::ensure_eq!(cv.waiters(), 0);
        costack::ensure_eq!(task.scheduler().pending_timers(), 0);
        cv.destroy()?;
        Ok(())
    })
}

//==============================================================================
// test_sleep_and_timers()
//==============================================================================

/// Tests sleeping and explicitly armed timers.
#[test]
fn test_sleep_and_timers() -> Result<()> {
    common::run(&common::config(0)?, |task: &TaskHandle| {
        let start: Instant = Instant::now();
        task.sleep(50)?;
        anyhow::ensure!(start.elapsed() >= Duration::from_millis(50), "woke up early");

        let mut scheduler: SharedScheduler = task.scheduler();
        let timer: TimerId = scheduler.arm_timer(task.id(), 10)?;
        costack::ensure_eq!(scheduler.pending_timers(), 1);
        task.yield_now()?;
        costack::ensure_eq!(scheduler.has_timer(timer), false);

        let timer: TimerId = scheduler.arm_timer(task.id(), 10)?;
        costack::ensure_eq!(scheduler.cancel_timer(timer), true);
        costack::ensure_eq!(scheduler.cancel_timer(timer), false);
        costack::ensure_eq!(scheduler.pending_timers(), 0);
        Ok(())
    })
}

//==============================================================================
// test_exit_from_child_stops_loop()
//==============================================================================

/// Tests that any task may stop the scheduler, even while others are still blocked.
#[test]
fn test_exit_from_child_stops_loop() -> Result<()> {
    let config: Config = common::config(2)?;
    let mut scheduler: SharedScheduler = match SharedScheduler::new(&config, |task: TaskHandle| {
        let cv: ConditionVariable = match ConditionVariable::new(&task.scheduler()) {
            Ok(cv) => cv,
            Err(_) => return task.exit(),
        };
        if task.spawn("stopper", |handle: TaskHandle| handle.exit()).is_err() {
            return task.exit();
        }
        // Never signaled.
        let _ = cv.wait(&task, -1);
    }) {
        Ok(scheduler) => scheduler,
        Err(e) => anyhow::bail!("failed to create scheduler: {:?}", e),
    };

    if let Err(e) = scheduler.run() {
        anyhow::bail!("run failed: {:?}", e);
    }
    costack::ensure_eq!(scheduler.state(), SchedulerState::Stopped);

    // A stopped scheduler cannot run again or take new tasks.
    costack::ensure_eq!(scheduler.run().map_err(|e| e.errno), Err(libc::EINVAL));
    let loop_task: TaskId = scheduler.loop_task();
    costack::ensure_eq!(
        scheduler.create_task(loop_task, "late", |_| {}).map_err(|e| e.errno),
        Err(libc::EINVAL)
    );
    Ok(())
}

//==============================================================================
// test_panic_propagates_to_run()
//==============================================================================

/// Tests that a panic inside a task stops the scheduler and resurfaces from run.
#[test]
#[should_panic(expected = "task failure")]
fn test_panic_propagates_to_run() {
    let config: Config = match common::config(2) {
        Ok(config) => config,
        Err(_) => return,
    };
    let mut scheduler: SharedScheduler = match SharedScheduler::new(&config, |task: TaskHandle| {
        let _ = task.spawn("faulty", |_: TaskHandle| panic!("task failure"));
        let _ = task.sleep(60_000);
    }) {
        Ok(scheduler) => scheduler,
        Err(_) => return,
    };
    let _ = scheduler.run();
}
