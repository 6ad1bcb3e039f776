// Copyright (c) 2023 - 2025 Tidelog Software, Inc.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use tidelog_types::directory::DirectoryId;
use tidelog_types::records::RecordKind;
use tidelog_types::{BrokerEpoch, NodeId};

/// Request-rejection errors. Returned to the caller of a validation
/// operation, never retried internally, and guaranteed to leave state
/// untouched.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum RegistrationError {
    #[error("cluster control manager is not active")]
    NotActive,
    #[error("expected cluster id {expected}, but got cluster id {actual}")]
    InconsistentClusterId { expected: String, actual: String },
    #[error("another broker is registered with node id {0}")]
    DuplicateRegistration(NodeId),
    #[error("registration not allowed: {0}")]
    RegistrationNotAllowed(&'static str),
    #[error("invalid directory assignment: {0}")]
    InvalidDirectoryAssignment(String),
    #[error("unsupported version: {0}")]
    UnsupportedVersion(String),
    #[error("expected broker epoch {expected}, but got broker epoch {actual}")]
    StaleBrokerEpoch {
        expected: BrokerEpoch,
        actual: BrokerEpoch,
    },
    #[error("no broker registration found for node id {0}")]
    BrokerIdNotRegistered(NodeId),
}

/// Internal-consistency faults encountered during replay. These indicate the
/// log and the in-memory state have diverged; the replay loop must abort the
/// controller rather than attempt local recovery.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ReplayFault {
    #[error("unable to replay {kind} for broker {broker_id}: no registration found for that id")]
    UnknownBroker { kind: RecordKind, broker_id: NodeId },
    #[error(
        "unable to replay {kind} for broker {broker_id}: registration has epoch {current}, \
         record cites epoch {cited}"
    )]
    EpochMismatch {
        kind: RecordKind,
        broker_id: NodeId,
        current: BrokerEpoch,
        cited: BrokerEpoch,
    },
    #[error("directory {directory} is not assigned to broker {broker_id}")]
    DirectoryNotAssigned {
        directory: DirectoryId,
        broker_id: NodeId,
    },
    #[error("directory {directory} is already assigned to broker {owner}")]
    DirectoryAlreadyAssigned {
        directory: DirectoryId,
        owner: NodeId,
    },
    #[error("unable to replay {kind}: unknown value {value} for the fenced field")]
    UnknownFencingChange { kind: RecordKind, value: i8 },
    #[error("unable to replay {kind}: unknown value {value} for the controlled-shutdown field")]
    UnknownShutdownChange { kind: RecordKind, value: i8 },
}
