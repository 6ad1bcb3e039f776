// Copyright (c) 2023 - 2025 Tidelog Software, Inc.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use tidelog_types::NodeId;

/// A broker descriptor handed to replica placement.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UsableBroker {
    pub id: NodeId,
    pub rack: Option<String>,
    /// Fenced brokers are included; placement strategies may use them as a
    /// last resort.
    pub fenced: bool,
}

/// Strategy object deciding where new replicas go. The cluster control
/// manager only stores and exposes it; the placement algorithms themselves
/// live with the strategy implementations.
pub trait ReplicaPlacer: Send + Sync {
    /// Picks `replication_factor` brokers out of `candidates` for each of
    /// `partition_count` partitions.
    fn place(
        &self,
        partition_count: u32,
        replication_factor: u16,
        candidates: Vec<UsableBroker>,
    ) -> Result<Vec<Vec<NodeId>>, PlacementError>;
}

#[derive(Debug, thiserror::Error)]
pub enum PlacementError {
    #[error("not enough usable brokers: needed {needed}, had {available}")]
    NotEnoughBrokers { needed: u16, available: usize },
}
