// Copyright (c) 2023 - 2025 Tidelog Software, Inc.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! This crate contains the core types used by various Tidelog components.

mod node_id;

pub mod directory;
pub mod features;
pub mod logs;
pub mod membership;
pub mod records;

pub use node_id::*;
