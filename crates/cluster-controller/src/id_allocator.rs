// Copyright (c) 2023 - 2025 Tidelog Software, Inc.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Bookkeeping for node-identity allocation.
//!
//! Ids of unregistered brokers are parked in a reusable pool, persisted as a
//! flat sequence of big-endian `u32`s under a reserved key in the versioned
//! state store. An absent or empty value decodes to an empty pool.

use std::collections::BTreeSet;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytestring::ByteString;

use tidelog_types::NodeId;

/// Reserved key the reusable-node-id pool is stored under.
pub static REUSABLE_NODE_IDS_KEY: ByteString = ByteString::from_static("__reusable_node_ids");

/// Brokers are numbered from here up so broker and controller id ranges are
/// visually distinguishable.
pub const FIRST_ALLOCATED_NODE_ID: u32 = 1000;

pub fn decode_reusable_node_ids(value: &[u8]) -> BTreeSet<NodeId> {
    let mut pool = BTreeSet::new();
    let mut value = value;
    while value.remaining() >= 4 {
        pool.insert(NodeId::new(value.get_u32()));
    }
    pool
}

pub fn encode_reusable_node_ids(pool: &BTreeSet<NodeId>) -> Bytes {
    let mut buf = BytesMut::with_capacity(pool.len() * 4);
    for id in pool {
        buf.put_u32(id.as_u32());
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_value_decodes_to_empty_pool() {
        assert!(decode_reusable_node_ids(&[]).is_empty());
    }

    #[test]
    fn pool_round_trip() {
        let pool: BTreeSet<_> = [NodeId::new(1000), NodeId::new(1004), NodeId::new(1001)]
            .into_iter()
            .collect();
        let encoded = encode_reusable_node_ids(&pool);
        assert_eq!(encoded.len(), 12);
        assert_eq!(decode_reusable_node_ids(&encoded), pool);
    }
}
