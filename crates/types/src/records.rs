// Copyright (c) 2023 - 2025 Tidelog Software, Inc.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Typed facts appended to the external replicated control log. Every state
//! change of the cluster control plane is one of these records; replicas
//! reconstruct state exclusively by replaying them in commit order.

use std::collections::BTreeMap;

use bytes::Bytes;
use bytestring::ByteString;

use crate::directory::DirectoryId;
use crate::features::VersionRange;
use crate::membership::ListenerEndpoint;
use crate::{BrokerEpoch, IncarnationId, NodeId};

/// Schema version tag of a serialized control record.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    derive_more::Display,
    derive_more::From,
    derive_more::Into,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct RecordVersion(u16);

impl RecordVersion {
    pub const CURRENT: RecordVersion = RecordVersion(0);
}

/// The envelope appended to the control log: a typed fact plus the schema
/// version it was written with.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ControlRecord {
    pub version: RecordVersion,
    pub payload: RecordPayload,
}

impl ControlRecord {
    pub fn new(payload: RecordPayload) -> Self {
        Self {
            version: RecordVersion::CURRENT,
            payload,
        }
    }
}

impl From<RecordPayload> for ControlRecord {
    fn from(payload: RecordPayload) -> Self {
        ControlRecord::new(payload)
    }
}

#[derive(Debug, Clone, PartialEq, strum::EnumDiscriminants, serde::Serialize, serde::Deserialize)]
#[strum_discriminants(name(RecordKind), derive(strum::Display))]
pub enum RecordPayload {
    BrokerRegistered(BrokerRegistrationRecord),
    BrokerUnregistered(BrokerUnregistrationRecord),
    BrokerFenced(FenceBrokerRecord),
    BrokerUnfenced(UnfenceBrokerRecord),
    BrokerRegistrationChanged(BrokerRegistrationChangeRecord),
    ControllerRegistered(ControllerRegistrationRecord),
    NextNodeIdUpdated(NextNodeIdRecord),
    KvPut(KvPutRecord),
}

impl RecordPayload {
    pub fn kind(&self) -> RecordKind {
        self.into()
    }
}

/// Full snapshot of one broker's registration. Upserted on replay.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BrokerRegistrationRecord {
    pub broker_id: NodeId,
    pub incarnation_id: IncarnationId,
    pub broker_epoch: BrokerEpoch,
    pub listeners: Vec<ListenerEndpoint>,
    pub features: BTreeMap<String, VersionRange>,
    pub rack: Option<String>,
    pub fenced: bool,
    pub in_controlled_shutdown: bool,
    pub is_migrating_legacy_broker: bool,
    pub directories: Vec<DirectoryId>,
}

/// Removes a broker's registration. The cited epoch must match exactly.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BrokerUnregistrationRecord {
    pub broker_id: NodeId,
    pub broker_epoch: BrokerEpoch,
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FenceBrokerRecord {
    pub broker_id: NodeId,
    pub broker_epoch: BrokerEpoch,
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct UnfenceBrokerRecord {
    pub broker_id: NodeId,
    pub broker_epoch: BrokerEpoch,
}

/// Delta against an existing registration. The fencing and
/// controlled-shutdown fields carry the raw tri-state encoding; replaying an
/// unknown value is a fatal fault, not a recoverable error. An empty
/// `directories` list means "no directory change".
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BrokerRegistrationChangeRecord {
    pub broker_id: NodeId,
    pub broker_epoch: BrokerEpoch,
    pub fenced: i8,
    pub in_controlled_shutdown: i8,
    pub directories: Vec<DirectoryId>,
}

/// Tri-state fencing delta carried by [`BrokerRegistrationChangeRecord`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, strum::Display)]
pub enum BrokerFencingChange {
    None,
    Fence,
    Unfence,
}

impl BrokerFencingChange {
    pub fn from_value(value: i8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Fence),
            -1 => Some(Self::Unfence),
            _ => None,
        }
    }

    pub fn value(self) -> i8 {
        match self {
            Self::None => 0,
            Self::Fence => 1,
            Self::Unfence => -1,
        }
    }

    pub fn as_bool(self) -> Option<bool> {
        match self {
            Self::None => None,
            Self::Fence => Some(true),
            Self::Unfence => Some(false),
        }
    }
}

/// Tri-state controlled-shutdown delta carried by
/// [`BrokerRegistrationChangeRecord`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, strum::Display)]
pub enum BrokerShutdownChange {
    None,
    InControlledShutdown,
}

impl BrokerShutdownChange {
    pub fn from_value(value: i8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::InControlledShutdown),
            _ => None,
        }
    }

    pub fn value(self) -> i8 {
        match self {
            Self::None => 0,
            Self::InControlledShutdown => 1,
        }
    }

    pub fn as_bool(self) -> Option<bool> {
        match self {
            Self::None => None,
            Self::InControlledShutdown => Some(true),
        }
    }
}

/// Wholesale replacement of one controller's registration.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ControllerRegistrationRecord {
    pub controller_id: NodeId,
    pub incarnation_id: IncarnationId,
    pub listeners: Vec<ListenerEndpoint>,
    pub features: BTreeMap<String, VersionRange>,
    pub migration_ready: bool,
}

/// Persists the node-identity allocator's high-water mark: the last node id
/// handed out.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NextNodeIdRecord {
    pub node_id: NodeId,
}

/// Full overwrite of one reserved key in the versioned state store. Used for
/// the reusable-node-id pool.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct KvPutRecord {
    pub key: ByteString,
    pub value: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fencing_change_round_trip() {
        for change in [
            BrokerFencingChange::None,
            BrokerFencingChange::Fence,
            BrokerFencingChange::Unfence,
        ] {
            assert_eq!(BrokerFencingChange::from_value(change.value()), Some(change));
        }
        assert_eq!(BrokerFencingChange::from_value(7), None);
    }

    #[test]
    fn shutdown_change_round_trip() {
        for change in [
            BrokerShutdownChange::None,
            BrokerShutdownChange::InControlledShutdown,
        ] {
            assert_eq!(BrokerShutdownChange::from_value(change.value()), Some(change));
        }
        assert_eq!(BrokerShutdownChange::from_value(-1), None);
    }

    #[test]
    fn record_kind_names() {
        let record = ControlRecord::new(RecordPayload::NextNodeIdUpdated(NextNodeIdRecord {
            node_id: NodeId::new(1000),
        }));
        assert_eq!(record.payload.kind().to_string(), "NextNodeIdUpdated");
        assert_eq!(record.version, RecordVersion::CURRENT);
    }
}
