// Copyright (c) 2023 - 2025 Tidelog Software, Inc.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

/// Position of a committed record in the external replicated control log.
#[derive(
    Debug,
    Clone,
    Copy,
    Eq,
    PartialEq,
    Hash,
    Ord,
    PartialOrd,
    derive_more::Display,
    derive_more::From,
    derive_more::Into,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct LogOffset(u64);

impl LogOffset {
    pub const OLDEST: LogOffset = LogOffset(0);

    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}
