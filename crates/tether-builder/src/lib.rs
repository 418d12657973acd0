// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tether Builder - keeps function artifacts and deployed stacks in sync
//! with the source tree
//!
//! Two kinds of state machine are driven by file changes:
//!
//! - One [`FunctionBuilder`] per function rebuilds its artifact when a
//!   relevant file changes, but only once the function is warm. Changes
//!   arriving mid-build collapse into exactly one follow-up build.
//! - One [`StackBuilder`] for the application builds, synthesizes and, on
//!   request, deploys the infrastructure. An unchanged assembly checksum
//!   short-circuits to idle.
//!
//! Both are split into a pure machine (`handle(event) -> effects`) that is
//! tested without I/O and an actor that executes effects against a
//! [`FunctionToolchain`] or [`StackToolchain`].
//!
//! Progress is reported as [`LifecycleEvent`]s on an [`EventBus`].

pub mod checksum;
pub mod error;
pub mod events;
pub mod function;
pub mod stack;
pub mod toolchain;
pub mod watch;

pub use checksum::{assembly_checksum, function_id_for_path};
pub use error::{Error, Result};
pub use events::{EventBus, LifecycleEvent};
pub use function::{
    BUILD_ISSUES, BuilderSet, FunctionBuilder, FunctionMachine, FunctionSnapshot, FunctionSpec,
    FunctionState,
};
pub use stack::{FailedStage, IdleReason, StackBuilder, StackMachine, StackSnapshot, StackState};
pub use toolchain::{
    Assembly, BuildMode, BuildOutput, DeployStatus, FileChange, FunctionArtifact,
    FunctionToolchain, Issue, MockFunctionToolchain, MockStackToolchain, StackDeployResult,
    StackToolchain,
};
pub use watch::FileWatcher;
