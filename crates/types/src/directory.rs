// Copyright (c) 2023 - 2025 Tidelog Software, Inc.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use uuid::Uuid;

/// Identifies one on-disk storage directory. A directory is owned by exactly
/// one broker at a time.
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
pub struct DirectoryId(Uuid);

impl DirectoryId {
    /// Sentinel for replicas without an assigned directory.
    pub const UNASSIGNED: DirectoryId = DirectoryId(Uuid::from_u128(0));

    /// Sentinel for brokers that registered without directory information,
    /// typically while migrating from the legacy protocol.
    pub const MIGRATING: DirectoryId = DirectoryId(Uuid::from_u128(1));

    /// Sentinel for replicas whose directory was lost.
    pub const LOST: DirectoryId = DirectoryId(Uuid::from_u128(2));

    pub fn random() -> Self {
        let id = Self(Uuid::new_v4());
        if id.is_reserved() { Self::random() } else { id }
    }

    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    /// Reserved ids may never be claimed by a broker.
    pub fn is_reserved(&self) -> bool {
        *self == Self::UNASSIGNED || *self == Self::MIGRATING || *self == Self::LOST
    }
}
