// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::flexi_logger::{
    Logger,
    LoggerHandle,
};
use ::std::sync::OnceLock;

//==============================================================================
// Constants
//==============================================================================

/// Log specification used when `RUST_LOG` is not set.
const DEFAULT_LOG_SPEC: &str = "info";

//==============================================================================
// Static Variables
//==============================================================================

/// Handle to the global logger. Kept alive so buffered lines are flushed at exit.
static LOGGER: OnceLock<Option<LoggerHandle>> = OnceLock::new();

//==============================================================================
// Standalone Functions
//==============================================================================

/// Initializes logging features.
pub fn initialize() {
    LOGGER.get_or_init(|| {
        match Logger::try_with_env_or_str(DEFAULT_LOG_SPEC).and_then(|logger| logger.start()) {
            Ok(handle) => Some(handle),
            Err(e) => {
                eprintln!("initialize(): failed to start logger: {:?}", e);
                None
            },
        }
    });
}
