// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::anyhow::Result;
use ::costack::{
    Config,
    SharedScheduler,
    TaskHandle,
};
use ::std::{
    cell::RefCell,
    rc::Rc,
    str::FromStr,
};

//==============================================================================
// Standalone Functions
//==============================================================================

/// Builds a configuration with the given timer slack.
pub fn config(timer_slack_ms: i64) -> Result<Config> {
    let yaml: String = format!("scheduler:\n  timer_slack_ms: {}\n", timer_slack_ms);
    match Config::from_str(&yaml) {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("failed to parse config: {:?}", e),
    }
}

/// Runs `entry` as the entry task of a fresh scheduler, stops the scheduler once `entry` returns and reports what
/// `entry` returned.
pub fn run<F>(config: &Config, entry: F) -> Result<()>
where
    F: FnOnce(&TaskHandle) -> Result<()> + 'static,
{
    let outcome: Rc<RefCell<Option<Result<()>>>> = Rc::new(RefCell::new(None));
    let slot: Rc<RefCell<Option<Result<()>>>> = outcome.clone();
    let mut scheduler: SharedScheduler = match SharedScheduler::new(config, move |handle: TaskHandle| {
        let result: Result<()> = entry(&handle);
        *slot.borrow_mut() = Some(result);
        handle.exit();
    }) {
        Ok(scheduler) => scheduler,
        Err(e) => anyhow::bail!("failed to create scheduler: {:?}", e),
    };
    if let Err(e) = scheduler.run() {
        anyhow::bail!("scheduler failed: {:?}", e);
    }
    let result: Option<Result<()>> = outcome.borrow_mut().take();
    match result {
        Some(result) => result,
        None => anyhow::bail!("entry task never finished"),
    }
}
