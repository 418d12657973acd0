// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tether Runtime - local execution of function workers
//!
//! Workers are ordinary OS processes running the unmodified handler with a
//! standard runtime client. They long-poll the local Runtime-API emulator
//! for work and post results back, exactly as they would in the cloud.
//!
//! # Architecture
//!
//! ```text
//!                 dispatch(function_id, invocation)
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────┐
//! │                   Supervisor                      │
//! │  per-function queue ─► one worker, one in flight  │
//! └──────────────┬───────────────────────▲───────────┘
//!                │ enqueue               │ RuntimeEvent
//!                ▼                       │
//! ┌──────────────────────────────────────────────────┐
//! │                  RuntimeApi (HTTP)                │
//! │  GET  /{worker_id}/runtime/invocation/next        │
//! │  POST /{worker_id}/runtime/invocation/{id}/...    │
//! └──────────────┬───────────────────────▲───────────┘
//!                │ long-poll             │ response / error
//!                ▼                       │
//!        ┌────────────────────────────────────┐
//!        │  Worker process (Launcher)          │
//!        └────────────────────────────────────┘
//! ```
//!
//! # Worker Lifecycle
//!
//! - Started lazily by the first invocation for a function.
//! - Serves invocations strictly one at a time.
//! - Retired after a rebuild ([`Supervisor::invalidate`]); a busy worker
//!   finishes its current invocation first.
//! - Stopped after [`SupervisorConfig::idle_timeout`] without work.
//! - A worker that exits fails its in-flight invocation with
//!   `Runtime.ExitError`; the next invocation starts a new one.

pub mod api;
pub mod error;
pub mod launcher;
pub mod supervisor;

pub use api::{Invocation, RuntimeApi, RuntimeEvent};
pub use error::{Error, Result};
pub use launcher::{
    Artifact, LaunchOptions, Launched, Launcher, LauncherError, MockLauncher, ProcessLauncher,
    WorkerExit, WorkerHandle,
};
pub use supervisor::{
    ArtifactProvider, StopReason, Supervisor, SupervisorConfig, WorkerEvent, WorkerInfo,
};
