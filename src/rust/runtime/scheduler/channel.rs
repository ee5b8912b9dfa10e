// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    pal::{
        linux::epoll,
        Epoll,
        EventFd,
    },
    runtime::fail::Fail,
};
use ::std::os::fd::RawFd;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Wake channel registered with the scheduler's epoll. Dropping it deregisters and closes the descriptor.
#[derive(Debug)]
pub struct WakeChannel {
    eventfd: EventFd,
    epoll_fd: RawFd,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl WakeChannel {
    pub fn register(epoll: &Epoll) -> Result<Self, Fail> {
        let eventfd: EventFd = EventFd::new()?;
        if let Err(e) = epoll.add(eventfd.as_raw_fd()) {
            error!("register(): {:?}", e);
            return Err(e);
        }
        Ok(Self {
            eventfd,
            epoll_fd: epoll.as_raw_fd(),
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.eventfd.as_raw_fd()
    }

    /// Deposits `n` wake units.
    pub fn notify(&self, n: u64) -> Result<(), Fail> {
        self.eventfd.write(n)
    }

    /// Takes every deposited unit.
    pub fn drain(&self) -> Result<u64, Fail> {
        self.eventfd.drain()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for WakeChannel {
    fn drop(&mut self) {
        // The multiplexer may already be gone during teardown.
        if let Err(e) = epoll::delete(self.epoll_fd, self.eventfd.as_raw_fd()) {
            debug!("drop(): {:?}", e);
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
