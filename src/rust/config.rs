// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::std::{
    fs::File,
    io::Read,
    ops::Index,
    str::FromStr,
};
use ::yaml_rust::{
    yaml::Hash,
    Yaml,
    YamlLoader,
};

//======================================================================================================================
// Constants
//======================================================================================================================

// Scheduler options.
mod scheduler_config {
    pub const SECTION_NAME: &str = "scheduler";
    // Size of the private stack of every task, in bytes.
    pub const STACK_SIZE: &str = "stack_size";
    // Window past "now" within which pending timers fire in the same pass, in milliseconds.
    pub const TIMER_SLACK_MS: &str = "timer_slack_ms";
    // Largest number of readiness events handled per loop iteration.
    pub const MAX_EVENTS: &str = "max_events";
}

/// Prefix of the environment variables that override configuration options.
const ENV_PREFIX: &str = "co_";

pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;
pub const DEFAULT_TIMER_SLACK_MS: i64 = 2;
pub const DEFAULT_MAX_EVENTS: usize = 1024;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Runtime configuration.
#[derive(Clone, Debug)]
pub struct Config(pub Yaml);

//======================================================================================================================
// Associated Functions
//======================================================================================================================

/// Common associated functions for the runtime configuration object.
impl Config {
    /// Reads a configuration file into a [Config] object.
    pub fn new(config_path: &str) -> Result<Self, Fail> {
        let mut config_s: String = String::new();
        File::open(config_path)?.read_to_string(&mut config_s)?;
        Self::from_str(&config_s)
    }

    fn get_scheduler_config(&self) -> Result<Option<&Yaml>, Fail> {
        Self::get_subsection(&self.0, scheduler_config::SECTION_NAME)
    }

    /// Reads the stack size of each task from the environment variable first and then the underlying configuration.
    pub fn stack_size(&self) -> Result<usize, Fail> {
        self.get_scheduler_int_option(scheduler_config::STACK_SIZE, DEFAULT_STACK_SIZE)
    }

    /// Reads the timer slack from the environment variable first and then the underlying configuration.
    pub fn timer_slack_ms(&self) -> Result<i64, Fail> {
        let slack: i64 = self.get_scheduler_int_option(scheduler_config::TIMER_SLACK_MS, DEFAULT_TIMER_SLACK_MS)?;
        if slack < 0 {
            let message: String = format!("parameter \"{}\" is out of range", scheduler_config::TIMER_SLACK_MS);
            return Err(Fail::new(libc::ERANGE, message.as_str()));
        }
        Ok(slack)
    }

    /// Reads the event batch size from the environment variable first and then the underlying configuration.
    pub fn max_events(&self) -> Result<usize, Fail> {
        let max_events: usize = self.get_scheduler_int_option(scheduler_config::MAX_EVENTS, DEFAULT_MAX_EVENTS)?;
        if max_events == 0 {
            let message: String = format!("parameter \"{}\" is out of range", scheduler_config::MAX_EVENTS);
            return Err(Fail::new(libc::ERANGE, message.as_str()));
        }
        Ok(max_events)
    }

    //======================================================================================================================
    // Static Functions
    //======================================================================================================================

    /// Looks up an integer option of the scheduler section. The environment overrides the file, and missing options
    /// fall back to `default`.
    fn get_scheduler_int_option<T: TryFrom<i64> + FromStr>(&self, index: &str, default: T) -> Result<T, Fail> {
        if let Some(value) = Self::get_typed_env_option(index)? {
            return Ok(value);
        }
        match self.get_scheduler_config()? {
            Some(section) => match Self::get_option(section, index) {
                Some(_) => Self::get_int_option(section, index),
                None => Ok(default),
            },
            None => Ok(default),
        }
    }

    /// Returns the subsection at `index`, if present, validating that it is a mapping.
    fn get_subsection<'a>(yaml: &'a Yaml, index: &str) -> Result<Option<&'a Yaml>, Fail> {
        match Self::get_option(yaml, index) {
            Some(section @ Yaml::Hash(_)) => Ok(Some(section)),
            Some(_) => {
                let message: String = format!("parameter \"{}\" has unexpected type", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
            None => Ok(None),
        }
    }

    /// Index `yaml` to find the value at `index`, if it exists.
    fn get_option<'a>(yaml: &'a Yaml, index: &str) -> Option<&'a Yaml> {
        if !matches!(yaml, Yaml::Hash(_)) {
            return None;
        }
        match yaml.index(index) {
            Yaml::BadValue | Yaml::Null => None,
            value => Some(value),
        }
    }

    /// Get value where the environment value overrides the config file if it exists.
    fn get_typed_env_option<T: FromStr>(index: &str) -> Result<Option<T>, Fail> {
        let name: String = format!("{}{}", ENV_PREFIX, index).to_uppercase();
        if let Ok(var) = ::std::env::var(name.as_str()) {
            if let Ok(value) = var.as_str().trim().parse() {
                return Ok(Some(value));
            } else {
                let message: String = format!("parameter {} has unexpected type", name);
                return Err(Fail::new(libc::EINVAL, message.as_str()));
            }
        }
        Ok(None)
    }

    /// Reads the integer at `index`, additionally verifying that the destination type may hold the value.
    fn get_int_option<T: TryFrom<i64>>(yaml: &Yaml, index: &str) -> Result<T, Fail> {
        let val: i64 = match Self::get_option(yaml, index).and_then(Yaml::as_i64) {
            Some(val) => val,
            None => {
                let message: String = format!("parameter {} has unexpected type", index);
                return Err(Fail::new(libc::EINVAL, message.as_str()));
            },
        };
        match T::try_from(val) {
            Ok(val) => Ok(val),
            _ => {
                let message: String = format!("parameter \"{}\" is out of range", index);
                Err(Fail::new(libc::ERANGE, message.as_str()))
            },
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for Config {
    fn default() -> Self {
        Self(Yaml::Hash(Hash::new()))
    }
}

impl FromStr for Config {
    type Err = Fail;

    /// Parses a configuration out of a YAML document.
    fn from_str(config_s: &str) -> Result<Self, Self::Err> {
        let config: Vec<Yaml> = match YamlLoader::load_from_str(config_s) {
            Ok(config) => config,
            Err(e) => {
                let message: String = format!("malformed configuration: {}", e);
                return Err(Fail::new(libc::EINVAL, message.as_str()));
            },
        };
        match &config[..] {
            [] => Ok(Self::default()),
            [c] => Ok(Self(c.clone())),
            _ => Err(Fail::new(libc::EINVAL, "Wrong number of config objects")),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
