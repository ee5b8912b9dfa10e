// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// PAL: Platform Abstraction Layer
//======================================================================================================================

// This is the platform abstraction layer hiding the raw libc calls behind the readiness multiplexer and the counting
// wake channel. Descriptors are owned by RAII wrappers, so every construction path that fails midway releases whatever
// it already acquired.

cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod linux;
        pub use self::linux::{
            epoll::Epoll,
            eventfd::EventFd,
        };
    }
}
