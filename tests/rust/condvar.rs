// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod common;

//==============================================================================
// Imports
//==============================================================================

use ::anyhow::Result;
use ::costack::{
    ConditionVariable,
    SharedScheduler,
    TaskHandle,
    TaskId,
    TaskState,
    WaitStatus,
};
use ::std::{
    cell::{
        Cell,
        RefCell,
    },
    rc::Rc,
    time::{
        Duration,
        Instant,
    },
};

//==============================================================================
// Constants
//==============================================================================

/// Number of tasks that queue up on a condition variable.
const NUM_WAITERS: usize = 4;

//==============================================================================
// Standalone Functions
//==============================================================================

/// Sleeps `task` in small steps until `condition` holds.
fn sleep_until<F: Fn() -> bool>(task: &TaskHandle, condition: F) -> Result<()> {
    for _ in 0..1_000 {
        if condition() {
            return Ok(());
        }
        task.sleep(1)?;
    }
    anyhow::bail!("condition never held")
}

/// Spawns a task that blocks on `cv` without a timeout and records `index` with the outcome once woken.
fn spawn_waiter(
    task: &TaskHandle,
    cv: &ConditionVariable,
    index: usize,
    log: &Rc<RefCell<Vec<(usize, WaitStatus)>>>,
) -> Result<TaskId> {
    let cv: ConditionVariable = cv.clone();
    let log: Rc<RefCell<Vec<(usize, WaitStatus)>>> = log.clone();
    let name: String = format!("waiter-{}", index);
    let child: TaskId = task.spawn(&name, move |handle: TaskHandle| {
        if let Ok(status) = cv.wait(&handle, -1) {
            log.borrow_mut().push((index, status));
        }
    })?;
    Ok(child)
}

//==============================================================================
// test_signal_wakes_waiters_in_fifo_order()
//==============================================================================

/// Tests that a signal wakes waiters in the order they started waiting.
#[test]
fn test_signal_wakes_waiters_in_fifo_order() -> Result<()> {
    let log: Rc<RefCell<Vec<(usize, WaitStatus)>>> = Rc::new(RefCell::new(Vec::new()));
    let recorded: Rc<RefCell<Vec<(usize, WaitStatus)>>> = log.clone();

    common::run(&common::config(2)?, move |task: &TaskHandle| {
        let cv: ConditionVariable = ConditionVariable::new(&task.scheduler())?;
        let mut children: Vec<TaskId> = Vec::with_capacity(NUM_WAITERS);
        for index in 1..=NUM_WAITERS {
            children.push(spawn_waiter(task, &cv, index, &log)?);
        }
        sleep_until(task, || cv.waiters() == NUM_WAITERS)?;

        cv.signal(NUM_WAITERS as u64)?;
        sleep_until(task, || log.borrow().len() == NUM_WAITERS)?;

        for child in children {
            task.scheduler().destroy_task(child)?;
        }
        cv.destroy()?;
        Ok(())
    })?;

    let expected: Vec<(usize, WaitStatus)> = (1..=NUM_WAITERS).map(|index| (index, WaitStatus::Signaled)).collect();
    costack::ensure_eq!(*recorded.borrow(), expected);
    Ok(())
}

//==============================================================================
// test_surplus_units_are_banked()
//==============================================================================

/// Tests that units signaled past the number of waiters are kept for later waits.
#[test]
fn test_surplus_units_are_banked() -> Result<()> {
    let log: Rc<RefCell<Vec<(usize, WaitStatus)>>> = Rc::new(RefCell::new(Vec::new()));
    let recorded: Rc<RefCell<Vec<(usize, WaitStatus)>>> = log.clone();

    common::run(&common::config(2)?, move |task: &TaskHandle| {
        let cv: ConditionVariable = ConditionVariable::new(&task.scheduler())?;
        spawn_waiter(task, &cv, 1, &log)?;
        spawn_waiter(task, &cv, 2, &log)?;
        sleep_until(task, || cv.waiters() == 2)?;

        cv.signal(5)?;
        costack::ensure_eq!(cv.pending()?, 3);
        sleep_until(task, || log.borrow().len() == 2)?;

        // Each later waiter claims one banked unit without blocking.
        for index in 3..=5 {
            spawn_waiter(task, &cv, index, &log)?;
        }
        sleep_until(task, || log.borrow().len() == 5)?;
        costack::ensure_eq!(cv.pending()?, 0);
        costack::ensure_eq!(cv.wait(task, 0)?, WaitStatus::TimedOut);
        cv.destroy()?;
        Ok(())
    })?;

    costack::ensure_eq!(recorded.borrow().len(), 5);
    costack::ensure_eq!(
        recorded.borrow().iter().all(|(_, status)| *status == WaitStatus::Signaled),
        true
    );
    Ok(())
}

//==============================================================================
// test_poll_does_not_block()
//==============================================================================

/// Tests that a zero timeout reports whether a unit was available without suspending.
#[test]
fn test_poll_does_not_block() -> Result<()> {
    common::run(&common::config(2)?, |task: &TaskHandle| {
        let cv: ConditionVariable = ConditionVariable::new(&task.scheduler())?;
        costack::ensure_eq!(cv.wait(task, 0)?, WaitStatus::TimedOut);

        cv.signal(1)?;
        costack::ensure_eq!(cv.wait(task, 0)?, WaitStatus::Signaled);
        costack::ensure_eq!(cv.wait(task, 0)?, WaitStatus::TimedOut);
        costack::ensure_eq!(task.scheduler().current_task(), Some(task.id()));
        cv.destroy()?;
        Ok(())
    })
}

//==============================================================================
// test_bounded_wait_times_out()
//==============================================================================

/// Tests that a bounded wait with no signal times out no earlier than its deadline and leaves no timer behind, even
/// while another task keeps the loop busy with short sleeps.
#[test]
fn test_bounded_wait_times_out() -> Result<()> {
    common::run(&common::config(2)?, |task: &TaskHandle| {
        let cv: ConditionVariable = ConditionVariable::new(&task.scheduler())?;
        let stop: Rc<Cell<bool>> = Rc::new(Cell::new(false));
        let ticks: Rc<Cell<usize>> = Rc::new(Cell::new(0));
        let ticker_stop: Rc<Cell<bool>> = stop.clone();
        let ticker_ticks: Rc<Cell<usize>> = ticks.clone();
        let ticker: TaskId = task.spawn("ticker", move |handle: TaskHandle| {
            while !ticker_stop.get() {
                if handle.sleep(1).is_err() {
                    return;
                }
                ticker_ticks.set(ticker_ticks.get() + 1);
            }
        })?;

        let start: Instant = Instant::now();
        costack::ensure_eq!(cv.wait(task, 100)?, WaitStatus::TimedOut);
        let elapsed: Duration = start.elapsed();
        anyhow::ensure!(elapsed >= Duration::from_millis(100), "timed out early ({:?})", elapsed);
        anyhow::ensure!(ticks.get() > 10, "ticker barely ran ({} ticks)", ticks.get());
        costack::ensure_eq!(cv.waiters(), 0);

        // Once the ticker is gone, no timer is left.
        stop.set(true);
        let scheduler: SharedScheduler = task.scheduler();
        sleep_until(task, || scheduler.task_state(ticker) == Some(TaskState::Finished))?;
        costack::ensure_eq!(task.scheduler().pending_timers(), 0);
        task.scheduler().destroy_task(ticker)?;
        cv.destroy()?;
        Ok(())
    })
}

//==============================================================================
// test_signal_one_ms_before_deadline_wins()
//==============================================================================

/// Tests that a signal sent 1 ms before the deadline of a bounded wait resolves it, with the default timer slack.
#[test]
fn test_signal_one_ms_before_deadline_wins() -> Result<()> {
    common::run(&common::config(2)?, |task: &TaskHandle| {
        let cv: ConditionVariable = ConditionVariable::new(&task.scheduler())?;
        let start: Rc<Cell<Option<Instant>>> = Rc::new(Cell::new(None));
        let signaler: ConditionVariable = cv.clone();
        let signaled_at: Rc<Cell<Option<Instant>>> = start.clone();
        let child: TaskId = task.spawn("signaler", move |_: TaskHandle| {
            // The waiter is already blocked here. Spin until 1 ms before its deadline.
            if let Some(start) = signaled_at.get() {
                while start.elapsed() < Duration::from_millis(1) {
                    std::hint::spin_loop();
                }
                let _ = signaler.signal(1);
            }
        })?;

        start.set(Some(Instant::now()));
        costack::ensure_eq!(cv.wait(task, 2)?, WaitStatus::Signaled);
        costack::ensure_eq!(task.scheduler().pending_timers(), 0);
        costack::ensure_eq!(cv.pending()?, 0);
        task.scheduler().destroy_task(child)?;
        cv.destroy()?;
        Ok(())
    })
}

//==============================================================================
// test_signal_and_yield_runs_waiter_first()
//==============================================================================

/// Tests that signaling and yielding lets the woken waiter run before the signaling task carries on.
#[test]
fn test_signal_and_yield_runs_waiter_first() -> Result<()> {
    let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
    let recorded: Rc<RefCell<Vec<&'static str>>> = order.clone();

    common::run(&common::config(2)?, move |task: &TaskHandle| {
        let cv: ConditionVariable = ConditionVariable::new(&task.scheduler())?;
        let waiter_cv: ConditionVariable = cv.clone();
        let waiter_order: Rc<RefCell<Vec<&'static str>>> = order.clone();
        let waiter: TaskId = task.spawn("waiter", move |handle: TaskHandle| {
            if let Ok(WaitStatus::Signaled) = waiter_cv.wait(&handle, -1) {
                waiter_order.borrow_mut().push("waiter");
            }
        })?;
        sleep_until(task, || cv.waiters() == 1)?;

        cv.signal_and_yield(task, 1)?;
        order.borrow_mut().push("signaler");
        costack::ensure_eq!(cv.pending()?, 0);
        task.scheduler().destroy_task(waiter)?;
        cv.destroy()?;
        Ok(())
    })?;

    costack::ensure_eq!(*recorded.borrow(), vec!["waiter", "signaler"]);
    Ok(())
}

//==============================================================================
// test_signal_before_deadline_wins()
//==============================================================================

/// Tests that a signal arriving before the deadline of a bounded wait resolves it, and that the timer it beat has no
/// further effect.
#[test]
fn test_signal_before_deadline_wins() -> Result<()> {
    common::run(&common::config(2)?, |task: &TaskHandle| {
        let cv: ConditionVariable = ConditionVariable::new(&task.scheduler())?;
        let signaler: ConditionVariable = cv.clone();
        let child: TaskId = task.spawn("signaler", move |handle: TaskHandle| {
            if handle.sleep(10).is_ok() {
                let _ = signaler.signal(1);
            }
        })?;

        costack::ensure_eq!(cv.wait(task, 500)?, WaitStatus::Signaled);
        costack::ensure_eq!(task.scheduler().pending_timers(), 0);

        // Outlive the original deadline: the defeated timer must neither resume this task nor bank a unit.
        task.sleep(600)?;
        costack::ensure_eq!(cv.wait(task, 0)?, WaitStatus::TimedOut);
        task.scheduler().destroy_task(child)?;
        cv.destroy()?;
        Ok(())
    })
}

//==============================================================================
// test_bounded_wait_ignores_unrelated_resumes()
//==============================================================================

/// Tests that resuming a waiting task through another path does not end its wait.
#[test]
fn test_bounded_wait_ignores_unrelated_resumes() -> Result<()> {
    common::run(&common::config(2)?, |task: &TaskHandle| {
        let cv: ConditionVariable = ConditionVariable::new(&task.scheduler())?;
        let waiter: TaskId = task.id();
        // Finishing the child wakes its owner, which is blocked on the condition variable.
        task.spawn("nudger", move |handle: TaskHandle| {
            let _ = handle.scheduler().resume(waiter);
        })?;

        let start: Instant = Instant::now();
        costack::ensure_eq!(cv.wait(task, 50)?, WaitStatus::TimedOut);
        anyhow::ensure!(start.elapsed() >= Duration::from_millis(50), "wait ended early");
        cv.destroy()?;
        Ok(())
    })
}
