// Copyright (c) 2023 - 2025 Tidelog Software, Inc.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Durable membership state of brokers and controller-quorum members, plus
//! the decoded registration requests the control plane consumes.

use std::collections::BTreeMap;

use crate::directory::DirectoryId;
use crate::features::VersionRange;
use crate::{BrokerEpoch, IncarnationId, NodeId};

/// A named endpoint a node advertises to its peers and clients.
#[derive(Debug, Clone, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ListenerEndpoint {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl ListenerEndpoint {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
        }
    }
}

/// Durable registration of one broker, reconstructed identically on every
/// replica by replaying the control log.
#[derive(Debug, Clone, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BrokerRegistration {
    pub id: NodeId,
    pub epoch: BrokerEpoch,
    pub incarnation_id: IncarnationId,
    pub listeners: Vec<ListenerEndpoint>,
    pub supported_features: BTreeMap<String, VersionRange>,
    pub rack: Option<String>,
    pub fenced: bool,
    pub in_controlled_shutdown: bool,
    pub is_migrating_legacy_broker: bool,
    directories: Vec<DirectoryId>,
}

impl BrokerRegistration {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: NodeId,
        epoch: BrokerEpoch,
        incarnation_id: IncarnationId,
        listeners: Vec<ListenerEndpoint>,
        supported_features: BTreeMap<String, VersionRange>,
        rack: Option<String>,
        fenced: bool,
        in_controlled_shutdown: bool,
        is_migrating_legacy_broker: bool,
        mut directories: Vec<DirectoryId>,
    ) -> Self {
        directories.sort_unstable();
        Self {
            id,
            epoch,
            incarnation_id,
            listeners,
            supported_features,
            rack,
            fenced,
            in_controlled_shutdown,
            is_migrating_legacy_broker,
            directories,
        }
    }

    /// The storage directories this broker owns, in sorted order.
    pub fn directories(&self) -> &[DirectoryId] {
        &self.directories
    }

    pub fn listener(&self, name: &str) -> Option<&ListenerEndpoint> {
        self.listeners.iter().find(|listener| listener.name == name)
    }

    /// Whether `directory` is online in this broker. A broker that registered
    /// without directory information is assumed to have every directory
    /// online.
    pub fn has_online_directory(&self, directory: DirectoryId) -> bool {
        self.directories.is_empty() || self.directories.binary_search(&directory).is_ok()
    }

    /// Applies a registration-change delta. `directories: None` means "no
    /// change"; an explicit empty list is a change and clears the set.
    pub fn with_changes(
        &self,
        fencing: Option<bool>,
        in_controlled_shutdown: Option<bool>,
        directories: Option<Vec<DirectoryId>>,
    ) -> Self {
        let mut next = self.clone();
        if let Some(fenced) = fencing {
            next.fenced = fenced;
        }
        if let Some(in_controlled_shutdown) = in_controlled_shutdown {
            next.in_controlled_shutdown = in_controlled_shutdown;
        }
        if let Some(mut directories) = directories {
            directories.sort_unstable();
            next.directories = directories;
        }
        next
    }
}

/// Durable registration of one controller-quorum member. Replaced wholesale
/// on every registration record.
#[derive(Debug, Clone, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ControllerRegistration {
    pub id: NodeId,
    pub incarnation_id: IncarnationId,
    pub listeners: Vec<ListenerEndpoint>,
    pub supported_features: BTreeMap<String, VersionRange>,
    pub migration_ready: bool,
}

/// Decoded broker registration request, as handed over by the wire layer.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BrokerRegistrationRequest {
    pub cluster_id: String,
    pub broker_id: NodeId,
    pub incarnation_id: IncarnationId,
    pub listeners: Vec<ListenerEndpoint>,
    pub features: BTreeMap<String, VersionRange>,
    pub rack: Option<String>,
    pub directories: Vec<DirectoryId>,
    pub is_migrating_legacy_broker: bool,
}

/// Decoded controller registration request.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ControllerRegistrationRequest {
    pub controller_id: NodeId,
    pub incarnation_id: IncarnationId,
    pub listeners: Vec<ListenerEndpoint>,
    pub features: BTreeMap<String, VersionRange>,
    pub migration_ready: bool,
}

/// Reply to an accepted broker registration, carrying the epoch the broker
/// must cite in subsequent heartbeats and lifecycle requests.
#[derive(Debug, Clone, Copy, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BrokerRegistrationReply {
    pub epoch: BrokerEpoch,
}
