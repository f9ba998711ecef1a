// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![cfg_attr(feature = "strict", deny(clippy::all))]

mod collections;

pub mod config;

pub mod iowait;

pub mod runtime;

#[macro_use]
extern crate log;

pub use crate::{
    config::Config,
    iowait::{
        io_wait,
        EpollType,
        IoWait,
    },
    runtime::{
        task::{
            FdEvent,
            TaskId,
            TaskState,
            WaitResult,
            WaitSet,
        },
        Scheduler,
    },
};

/// Asserts that two expressions are equal, bailing out of the enclosing
/// function with an [anyhow::Error] when they are not.
#[macro_export]
macro_rules! ensure_eq {
    ($left:expr, $right:expr) => {{
        let left = $left;
        let right = $right;
        if left != right {
            anyhow::bail!(
                "ensure_eq!({}, {}) failed: {:?} != {:?}",
                stringify!($left),
                stringify!($right),
                left,
                right
            );
        }
    }};
}

/// Asserts that two expressions are not equal, bailing out of the enclosing
/// function with an [anyhow::Error] when they are.
#[macro_export]
macro_rules! ensure_neq {
    ($left:expr, $right:expr) => {{
        let left = $left;
        let right = $right;
        if left == right {
            anyhow::bail!(
                "ensure_neq!({}, {}) failed: both sides are {:?}",
                stringify!($left),
                stringify!($right),
                left
            );
        }
    }};
}
