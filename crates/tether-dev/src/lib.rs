// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tether Dev - live development session
//!
//! Runs deployed functions on the developer's machine. Stubs deployed in
//! place of the real functions forward every invocation through the relay;
//! this session receives it, builds the function on demand, runs it in a
//! local worker process and sends the result back.
//!
//! # Architecture
//!
//! ```text
//!   relay ──► BridgeClient ──► SessionHandler ──► Supervisor ──► worker
//!                                    │                 ▲
//!                                    ▼                 │ artifact
//!                             FunctionBuilder ◄────────┘
//!                                    ▲
//!   FileWatcher ─────────────────────┴──────────► StackBuilder ──► deploy
//! ```
//!
//! [`DevRuntime`] owns all of it. The `tether-dev` binary drives one from a
//! [`Manifest`] and [`DevConfig`].

pub mod config;
pub mod manifest;
pub mod runtime;
pub mod toolchain;

pub use config::{ConfigError, DevConfig};
pub use manifest::{FunctionEntry, Manifest, ManifestError, StackEntry};
pub use runtime::{DevRuntime, DevRuntimeBuilder, DevRuntimeConfig};
pub use toolchain::CommandToolchain;
