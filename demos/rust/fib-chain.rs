// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![deny(clippy::all)]

#[macro_use]
extern crate log;

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::clap::{Arg, ArgMatches, Command};
use ::costack::{runtime::logging, ConditionVariable, Config, SharedScheduler, TaskHandle, TaskId, WaitStatus};
use ::std::{cell::RefCell, rc::Rc};

//======================================================================================================================
// Program Arguments
//======================================================================================================================

#[derive(Debug)]
pub struct ProgramArguments {
    tasks: usize,
    config_path: Option<String>,
}

impl ProgramArguments {
    const DEFAULT_NUM_TASKS: usize = 5;

    pub fn new() -> Result<Self> {
        let matches: ArgMatches = Command::new("fib-chain")
            .about("Computes a Fibonacci sequence with one task per term")
            .arg(
                Arg::new("tasks")
                    .long("tasks")
                    .value_parser(clap::value_parser!(usize))
                    .required(false)
                    .value_name("N")
                    .help("Sets the number of terms to compute"),
            )
            .arg(
                Arg::new("config")
                    .long("config")
                    .value_parser(clap::value_parser!(String))
                    .required(false)
                    .value_name("PATH")
                    .help("Sets the path to a YAML configuration file"),
            )
            .get_matches();

        let tasks: usize = matches
            .get_one::<usize>("tasks")
            .copied()
            .unwrap_or(Self::DEFAULT_NUM_TASKS);
        if tasks == 0 {
            anyhow::bail!("number of tasks must be positive");
        }

        Ok(Self {
            tasks,
            config_path: matches.get_one::<String>("config").cloned(),
        })
    }

    pub fn config(&self) -> Result<Config> {
        match &self.config_path {
            Some(path) => Config::new(path).map_err(|e| anyhow::anyhow!("failed to load config: {:?}", e)),
            None => Ok(Config::default()),
        }
    }
}

//======================================================================================================================
// Chain
//======================================================================================================================

/// Computes term `index`, publishes it and hands one unit to each of the two terms that read it.
fn compute_term(handle: &TaskHandle, index: usize, ready: &[ConditionVariable], terms: &RefCell<Vec<u64>>) -> Result<()> {
    let value: u64 = if index < 2 {
        1
    } else {
        for dependency in [index - 1, index - 2] {
            if ready[dependency].wait(handle, -1)? != WaitStatus::Signaled {
                anyhow::bail!("term {} stopped waiting for term {}", index, dependency);
            }
        }
        let terms: std::cell::Ref<Vec<u64>> = terms.borrow();
        terms[index - 1].saturating_add(terms[index - 2])
    };
    terms.borrow_mut()[index] = value;
    ready[index].signal(2)?;
    Ok(())
}

/// Entry task: spawns one task per term, waits for all of them and tears everything down.
fn run_chain(task: &TaskHandle, num_terms: usize, terms: Rc<RefCell<Vec<u64>>>) -> Result<()> {
    let mut ready: Vec<ConditionVariable> = Vec::with_capacity(num_terms);
    for _ in 0..num_terms {
        ready.push(ConditionVariable::new(&task.scheduler())?);
    }
    let done: ConditionVariable = ConditionVariable::new(&task.scheduler())?;

    let mut children: Vec<TaskId> = Vec::with_capacity(num_terms);
    for index in (0..num_terms).rev() {
        let ready: Vec<ConditionVariable> = ready.clone();
        let done: ConditionVariable = done.clone();
        let terms: Rc<RefCell<Vec<u64>>> = terms.clone();
        children.push(task.spawn(&format!("term-{}", index), move |handle: TaskHandle| {
            if let Err(e) = compute_term(&handle, index, &ready, &terms) {
                error!("term {} failed: {:?}", index, e);
            }
            if let Err(e) = done.signal(1) {
                error!("term {} could not report completion: {:?}", index, e);
            }
        })?);
    }

    for _ in 0..num_terms {
        done.wait(task, -1)?;
    }
    for child in children {
        task.scheduler().destroy_task(child)?;
    }
    for cv in ready.into_iter().chain(std::iter::once(done)) {
        cv.destroy()?;
    }
    Ok(())
}

//======================================================================================================================
// main()
//======================================================================================================================

fn main() -> Result<()> {
    logging::initialize();
    let args: ProgramArguments = ProgramArguments::new()?;
    let config: Config = args.config()?;
    let num_terms: usize = args.tasks;

    let terms: Rc<RefCell<Vec<u64>>> = Rc::new(RefCell::new(vec![0; num_terms]));
    let outcome: Rc<RefCell<Option<Result<()>>>> = Rc::new(RefCell::new(None));

    let chain_terms: Rc<RefCell<Vec<u64>>> = terms.clone();
    let chain_outcome: Rc<RefCell<Option<Result<()>>>> = outcome.clone();
    let mut scheduler: SharedScheduler = SharedScheduler::new(&config, move |handle: TaskHandle| {
        let result: Result<()> = run_chain(&handle, num_terms, chain_terms);
        *chain_outcome.borrow_mut() = Some(result);
        handle.exit();
    })
    .map_err(|e| anyhow::anyhow!("failed to create scheduler: {:?}", e))?;
    scheduler
        .run()
        .map_err(|e| anyhow::anyhow!("scheduler failed: {:?}", e))?;

    let result: Option<Result<()>> = outcome.borrow_mut().take();
    match result {
        Some(result) => result?,
        None => anyhow::bail!("chain never finished"),
    }

    let line: Vec<String> = terms.borrow().iter().map(|term| term.to_string()).collect();
    println!("{}", line.join(" "));
    Ok(())
}
