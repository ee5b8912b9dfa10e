// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::libc::{
    c_void,
    eventfd,
    EFD_CLOEXEC,
    EFD_NONBLOCK,
};
use ::std::{
    mem,
    os::fd::RawFd,
};

//======================================================================================================================
// Constants
//======================================================================================================================

const COUNTER_SIZE: usize = mem::size_of::<u64>();

//======================================================================================================================
// Structures
//======================================================================================================================

/// Non-blocking counting wake channel. Writes add units to the counter; a drain reads the whole counter and resets it
/// to zero. The descriptor is readable whenever the counter is non-zero.
#[derive(Debug)]
pub struct EventFd {
    fd: RawFd,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl EventFd {
    pub fn new() -> Result<Self, Fail> {
        match unsafe { eventfd(0, EFD_CLOEXEC | EFD_NONBLOCK) } {
            fd if fd >= 0 => Ok(Self { fd }),
            _ => {
                let fail: Fail = Fail::last_os_error("failed to create eventfd");
                warn!("new(): {:?}", fail);
                Err(fail)
            },
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Adds `n` units to the counter. Fails with `EAGAIN` if the counter would overflow.
    pub fn write(&self, n: u64) -> Result<(), Fail> {
        let buf: [u8; COUNTER_SIZE] = n.to_ne_bytes();
        match unsafe { libc::write(self.fd, buf.as_ptr() as *const c_void, COUNTER_SIZE) } {
            nbytes if nbytes == COUNTER_SIZE as isize => Ok(()),
            nbytes if nbytes >= 0 => Err(Fail::new(libc::EIO, "short write on eventfd")),
            _ => Err(Fail::last_os_error("failed to write eventfd")),
        }
    }

    /// Reads and resets the counter without blocking. An empty counter drains as zero.
    pub fn drain(&self) -> Result<u64, Fail> {
        let mut buf: [u8; COUNTER_SIZE] = [0; COUNTER_SIZE];
        match unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut c_void, COUNTER_SIZE) } {
            nbytes if nbytes == COUNTER_SIZE as isize => Ok(u64::from_ne_bytes(buf)),
            nbytes if nbytes >= 0 => Err(Fail::new(libc::EIO, "short read on eventfd")),
            _ => {
                let fail: Fail = Fail::last_os_error("failed to read eventfd");
                if fail.would_block() {
                    Ok(0)
                } else {
                    Err(fail)
                }
            },
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for EventFd {
    fn drop(&mut self) {
        if unsafe { libc::close(self.fd) } != 0 {
            warn!("drop(): {:?}", Fail::last_os_error("failed to close eventfd"));
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
