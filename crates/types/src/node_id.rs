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

/// Plain identifier of a node (broker or controller). Stable across restarts.
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
#[display("N{}", _0)]
pub struct NodeId(u32);

impl NodeId {
    pub const MIN: NodeId = NodeId(0);

    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

/// Monotonically increasing counter per node id, bumped every time the node
/// re-registers with a new incarnation.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
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
pub struct BrokerEpoch(u64);

impl BrokerEpoch {
    pub const INITIAL: BrokerEpoch = BrokerEpoch(0);

    pub const fn new(epoch: u64) -> Self {
        Self(epoch)
    }
}

/// Identifies one run (process lifetime) of a node; changes on every restart.
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
pub struct IncarnationId(Uuid);

impl IncarnationId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }
}
