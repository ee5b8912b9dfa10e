// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::libc::{
    c_int,
    epoll_create1,
    epoll_ctl,
    epoll_event,
    epoll_wait,
    EINTR,
    EPOLLIN,
    EPOLL_CLOEXEC,
    EPOLL_CTL_ADD,
    EPOLL_CTL_DEL,
};
use ::std::os::fd::RawFd;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Readiness multiplexer. Every registration is level-triggered on input readiness and carries the registered
/// descriptor itself as its event data.
#[derive(Debug)]
pub struct Epoll {
    epoll_fd: RawFd,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Epoll {
    pub fn new() -> Result<Self, Fail> {
        match unsafe { epoll_create1(EPOLL_CLOEXEC) } {
            fd if fd >= 0 => Ok(Self { epoll_fd: fd }),
            _ => {
                let fail: Fail = Fail::last_os_error("failed to create epoll");
                error!("new(): {:?}", fail);
                Err(fail)
            },
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.epoll_fd
    }

    /// Registers `fd` for input readiness.
    pub fn add(&self, fd: RawFd) -> Result<(), Fail> {
        let mut epoll_event: epoll_event = epoll_event {
            events: EPOLLIN as u32,
            u64: fd as u64,
        };
        match unsafe { epoll_ctl(self.epoll_fd, EPOLL_CTL_ADD, fd, &mut epoll_event) } {
            0 => Ok(()),
            _ => Err(Fail::last_os_error("failed to register descriptor with epoll")),
        }
    }

    /// Deregisters `fd`.
    pub fn delete(&self, fd: RawFd) -> Result<(), Fail> {
        delete(self.epoll_fd, fd)
    }

    /// Waits for at most `timeout_ms` milliseconds (`-1` waits indefinitely) and returns the number of events written
    /// into `events`. Interrupted waits are retried with the same timeout.
    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: c_int) -> Result<usize, Fail> {
        let max_events: c_int = events.len().min(c_int::MAX as usize) as c_int;
        loop {
            match unsafe { epoll_wait(self.epoll_fd, events.as_mut_ptr(), max_events, timeout_ms) } {
                n if n >= 0 => return Ok(n as usize),
                _ => {
                    let fail: Fail = Fail::last_os_error("failed to wait on epoll");
                    if fail.errno == EINTR {
                        trace!("wait(): interrupted, retrying");
                        continue;
                    }
                    return Err(fail);
                },
            }
        }
    }

    /// Closes the underlying descriptor. Calling this more than once is a no-op.
    pub fn close(&mut self) {
        if self.epoll_fd >= 0 {
            if unsafe { libc::close(self.epoll_fd) } != 0 {
                warn!("close(): {:?}", Fail::last_os_error("failed to close epoll"));
            }
            self.epoll_fd = -1;
        }
    }
}

/// Deregisters `fd` from the multiplexer referred to by `epoll_fd`.
pub fn delete(epoll_fd: RawFd, fd: RawFd) -> Result<(), Fail> {
    // Kernels before 2.6.9 require a non-null event even for deletions.
    let mut epoll_event: epoll_event = epoll_event { events: 0, u64: 0 };
    match unsafe { epoll_ctl(epoll_fd, EPOLL_CTL_DEL, fd, &mut epoll_event) } {
        0 => Ok(()),
        _ => Err(Fail::last_os_error("failed to remove descriptor from epoll")),
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for Epoll {
    fn drop(&mut self) {
        self.close();
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
