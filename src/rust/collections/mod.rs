// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

pub mod arena;
pub mod linked_queue;
