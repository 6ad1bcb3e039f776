// Copyright (c) 2023 - 2025 Tidelog Software, Inc.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The authoritative cluster-membership and lifecycle controller of a
//! Tidelog cluster.
//!
//! The [`manager::ClusterControlManager`] validates registration and
//! lifecycle requests against its in-memory view, proposes typed records for
//! the external replicated control log, and deterministically replays
//! committed records so every replica reconstructs identical state. All
//! mutation happens on the log-replay path; request handling only reads
//! state and proposes records.

mod error;
mod options;

pub mod heartbeat;
pub mod id_allocator;
pub mod manager;
pub mod placement;
pub mod timeline;

pub use error::{RegistrationError, ReplayFault};
pub use manager::{ClusterControlManager, ControllerResult, FeatureControl, UncleanShutdownHandler};
pub use options::Options;
