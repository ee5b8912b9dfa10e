// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::libc::{
    c_void,
    getcontext,
    makecontext,
    swapcontext,
    ucontext_t,
};
use ::std::mem;

//======================================================================================================================
// Constants
//======================================================================================================================

/// Smallest stack a continuation may run on.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Private execution stack of a continuation. The memory never moves once allocated.
pub struct Stack {
    memory: Box<[u8]>,
}

/// Saved execution state of a suspended continuation. The machine context is boxed because it holds pointers into
/// itself once saved, so it must keep its address for as long as it lives.
pub struct Context {
    ucontext: Box<ucontext_t>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Stack {
    /// Allocates a zeroed stack of `size` bytes. Fails with `ENOMEM` instead of aborting the process.
    pub fn new(size: usize) -> Result<Self, Fail> {
        if size < MIN_STACK_SIZE {
            let cause: String = format!("stack too small (size={:?}, min={:?})", size, MIN_STACK_SIZE);
            error!("new(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        let mut memory: Vec<u8> = Vec::new();
        if let Err(e) = memory.try_reserve_exact(size) {
            let cause: String = format!("cannot allocate stack (size={:?}): {:?}", size, e);
            error!("new(): {}", cause);
            return Err(Fail::new(libc::ENOMEM, &cause));
        }
        memory.resize(size, 0);
        Ok(Self {
            memory: memory.into_boxed_slice(),
        })
    }

    pub fn len(&self) -> usize {
        self.memory.len()
    }

    fn base(&mut self) -> *mut c_void {
        self.memory.as_mut_ptr() as *mut c_void
    }
}

impl Context {
    /// Creates a context slot that only ever receives a continuation saved by [Context::swap].
    pub fn empty() -> Self {
        Self {
            ucontext: Box::new(unsafe { mem::zeroed() }),
        }
    }

    /// Creates a continuation that starts executing `entry` on `stack`. When `entry` returns, execution continues at
    /// the continuation saved in `link`.
    ///
    /// The caller must keep both `stack` and the context behind `link` alive for as long as this continuation may run.
    pub fn with_entry(stack: &mut Stack, link: *mut ucontext_t, entry: extern "C" fn()) -> Result<Self, Fail> {
        let mut context: Self = Self::empty();
        let ucontext: *mut ucontext_t = context.as_mut_ptr();
        if unsafe { getcontext(ucontext) } != 0 {
            let fail: Fail = Fail::last_os_error("failed to capture machine context");
            error!("with_entry(): {:?}", fail);
            return Err(fail);
        }
        unsafe {
            (*ucontext).uc_link = link;
            (*ucontext).uc_stack.ss_sp = stack.base();
            (*ucontext).uc_stack.ss_size = stack.len();
            (*ucontext).uc_stack.ss_flags = 0;
            makecontext(ucontext, entry, 0);
        }
        Ok(context)
    }

    pub fn as_mut_ptr(&mut self) -> *mut ucontext_t {
        self.ucontext.as_mut()
    }

    /// Saves the running continuation into `from` and activates `to`. Returns once some other continuation swaps back
    /// into `from`.
    ///
    /// # Safety
    ///
    /// Both pointers must come from live [Context]s, and `to` must hold a valid continuation: either one built by
    /// [Context::with_entry] that has not returned yet, or one saved by an earlier swap.
    pub unsafe fn swap(from: *mut ucontext_t, to: *const ucontext_t) -> Result<(), Fail> {
        match swapcontext(from, to) {
            0 => Ok(()),
            _ => Err(Fail::last_os_error("failed to switch machine context")),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
