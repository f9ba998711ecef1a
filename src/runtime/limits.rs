// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

/// Default capacity of the per-pass epoll event buffer. This is also the
/// size hint handed to `epoll_create`, which modern kernels ignore.
pub const EPOLL_EVENT_SIZE_DEFAULT: usize = 1024;

/// Default upper bound, in milliseconds, for the adaptive epoll wait time.
pub const MAX_SLEEP_MS_DEFAULT: u64 = 20;

/// Maximum number of expired timers pulled from the timer manager per batch.
pub const TIMER_BATCH_SIZE: usize = 128;
