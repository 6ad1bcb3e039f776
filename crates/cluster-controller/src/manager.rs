// Copyright (c) 2023 - 2025 Tidelog Software, Inc.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The cluster control manager owns all hard membership state: broker and
//! controller registrations, fencing, directory ownership and node-identity
//! allocation.
//!
//! Request handlers validate against the manager's current view and propose
//! records for the external replicated log; committed records come back
//! through [`ClusterControlManager::replay`], on the leader as well as on
//! standby replicas, and replay is the only place durable state changes.

use std::cmp;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use bytestring::ByteString;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use tidelog_types::directory::DirectoryId;
use tidelog_types::features::{
    FeatureLevel, FinalizedFeatures, MetadataVersion, VersionRange,
    METADATA_VERSION_FEATURE_NAME, PRODUCTION_FEATURE_NAMES,
};
use tidelog_types::logs::LogOffset;
use tidelog_types::membership::{
    BrokerRegistration, BrokerRegistrationReply, BrokerRegistrationRequest,
    ControllerRegistration, ControllerRegistrationRequest,
};
use tidelog_types::records::{
    BrokerFencingChange, BrokerRegistrationChangeRecord, BrokerRegistrationRecord,
    BrokerShutdownChange, BrokerUnregistrationRecord, ControlRecord, ControllerRegistrationRecord,
    KvPutRecord, NextNodeIdRecord, RecordKind, RecordPayload,
};
use tidelog_types::{BrokerEpoch, NodeId};

use crate::error::{RegistrationError, ReplayFault};
use crate::heartbeat::BrokerHeartbeatManager;
use crate::id_allocator::{
    decode_reusable_node_ids, encode_reusable_node_ids, FIRST_ALLOCATED_NODE_ID,
    REUSABLE_NODE_IDS_KEY,
};
use crate::placement::{ReplicaPlacer, UsableBroker};
use crate::timeline::TimelineMap;
use crate::Options;

/// View of the feature-control collaborator: which metadata version is
/// finalized cluster-wide and whether a legacy migration is underway.
pub trait FeatureControl: Send + Sync {
    fn metadata_version(&self) -> MetadataVersion;

    /// True while legacy metadata migration has started but not completed.
    /// New-protocol brokers cannot register in this window.
    fn in_pre_migration_mode(&self) -> bool;
}

/// Collaborator producing the records that clean up after a broker's
/// previous incarnation when a new one registers.
pub trait UncleanShutdownHandler: Send + Sync {
    fn add_records_for_shutdown(&self, broker_id: NodeId, records: &mut Vec<ControlRecord>);
}

impl<F> UncleanShutdownHandler for F
where
    F: Fn(NodeId, &mut Vec<ControlRecord>) + Send + Sync,
{
    fn add_records_for_shutdown(&self, broker_id: NodeId, records: &mut Vec<ControlRecord>) {
        self(broker_id, records)
    }
}

/// The outcome of an accepted validation operation: the records to append to
/// the control log, plus the reply for the caller. The records take effect
/// only once committed and replayed.
#[derive(Debug)]
pub struct ControllerResult<T> {
    pub records: Vec<ControlRecord>,
    pub response: T,
}

impl<T> ControllerResult<T> {
    pub fn new(records: Vec<ControlRecord>, response: T) -> Self {
        Self { records, response }
    }
}

#[derive(Debug)]
struct ReadyBrokersFuture {
    sender: oneshot::Sender<()>,
    min_brokers: usize,
}

pub struct ClusterControlManager {
    cluster_id: String,
    session_timeout: Duration,
    legacy_migration_enabled: bool,
    feature_control: Arc<dyn FeatureControl>,
    replica_placer: Arc<dyn ReplicaPlacer>,
    unclean_shutdown_handler: Box<dyn UncleanShutdownHandler>,

    brokers: TimelineMap<NodeId, BrokerRegistration>,
    /// Offset of each broker's most recent registration record. Gates "is
    /// this registration durably visible yet" checks elsewhere.
    registration_offsets: TimelineMap<NodeId, LogOffset>,
    controllers: TimelineMap<NodeId, ControllerRegistration>,
    /// Derived index kept in lock-step with every broker's directory set.
    directory_owners: TimelineMap<DirectoryId, NodeId>,
    /// Reserved-key store; currently only holds the reusable-node-id pool.
    reserved_kv: TimelineMap<ByteString, Bytes>,

    /// Present only while this replica is the active leader.
    heartbeat_manager: Option<BrokerHeartbeatManager>,
    ready_brokers_future: Option<ReadyBrokersFuture>,

    /// Last allocated node id; -1 before the first allocation. Restored from
    /// the log on replay.
    next_node_id: AtomicI64,
    max_controller_id: NodeId,
}

impl ClusterControlManager {
    pub fn new(
        options: Options,
        feature_control: Arc<dyn FeatureControl>,
        replica_placer: Arc<dyn ReplicaPlacer>,
        unclean_shutdown_handler: Box<dyn UncleanShutdownHandler>,
    ) -> Self {
        let max_controller_id = options
            .quorum_voters
            .iter()
            .copied()
            .max()
            .unwrap_or(NodeId::MIN);
        Self {
            cluster_id: options.cluster_id.clone(),
            session_timeout: options.session_timeout(),
            legacy_migration_enabled: options.legacy_migration_enabled,
            feature_control,
            replica_placer,
            unclean_shutdown_handler,
            brokers: TimelineMap::default(),
            registration_offsets: TimelineMap::default(),
            controllers: TimelineMap::default(),
            directory_owners: TimelineMap::default(),
            reserved_kv: TimelineMap::default(),
            heartbeat_manager: None,
            ready_brokers_future: None,
            next_node_id: AtomicI64::new(-1),
            max_controller_id,
        }
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn replica_placer(&self) -> &Arc<dyn ReplicaPlacer> {
        &self.replica_placer
    }

    /// Transitions this replica to active. The liveness tracker is built
    /// fresh and seeded from every currently known broker registration.
    pub fn activate(&mut self) {
        let mut heartbeat_manager = BrokerHeartbeatManager::new(self.session_timeout);
        for registration in self.brokers.values() {
            heartbeat_manager.register(registration.id, registration.fenced);
        }
        self.heartbeat_manager = Some(heartbeat_manager);
    }

    /// Transitions this replica to standby. Sessions are meaningless on a
    /// non-leader, so the liveness tracker is torn down entirely, and any
    /// pending readiness waiter is dropped with it.
    pub fn deactivate(&mut self) {
        self.heartbeat_manager = None;
        self.ready_brokers_future = None;
    }

    pub fn heartbeat_manager(&self) -> Result<&BrokerHeartbeatManager, RegistrationError> {
        self.heartbeat_manager
            .as_ref()
            .ok_or(RegistrationError::NotActive)
    }

    pub fn heartbeat_manager_mut(
        &mut self,
    ) -> Result<&mut BrokerHeartbeatManager, RegistrationError> {
        self.heartbeat_manager
            .as_mut()
            .ok_or(RegistrationError::NotActive)
    }

    /// Processes an incoming broker registration request. On success returns
    /// the records to append plus the reply carrying the broker's resulting
    /// epoch; the versioned state itself only changes on replay.
    pub fn register_broker(
        &mut self,
        request: &BrokerRegistrationRequest,
        new_broker_epoch: BrokerEpoch,
        finalized_features: &FinalizedFeatures,
    ) -> Result<ControllerResult<BrokerRegistrationReply>, RegistrationError> {
        if self.heartbeat_manager.is_none() {
            return Err(RegistrationError::NotActive);
        }
        if request.cluster_id != self.cluster_id {
            return Err(RegistrationError::InconsistentClusterId {
                expected: self.cluster_id.clone(),
                actual: request.cluster_id.clone(),
            });
        }
        let broker_id = request.broker_id;
        let existing = self.brokers.get(&broker_id).cloned();
        if let Some(existing) = &existing {
            let session_valid = self
                .heartbeat_manager
                .as_ref()
                .expect("is active")
                .has_valid_session(broker_id);
            if session_valid && request.incarnation_id != existing.incarnation_id {
                return Err(RegistrationError::DuplicateRegistration(broker_id));
            }
        }
        if request.is_migrating_legacy_broker && !self.legacy_registration_allowed() {
            return Err(RegistrationError::RegistrationNotAllowed(
                "this controller does not accept registrations of legacy-migrated brokers",
            ));
        }
        if !request.is_migrating_legacy_broker && self.feature_control.in_pre_migration_mode() {
            return Err(RegistrationError::RegistrationNotAllowed(
                "metadata migration is in progress; new-protocol brokers cannot register until \
                 it completes",
            ));
        }
        let metadata_version = self.feature_control.metadata_version();
        if metadata_version.is_directory_assignment_supported() {
            self.validate_directories(request)?;
        }

        let mut features = BTreeMap::new();
        for (name, range) in &request.features {
            self.process_registration_feature(broker_id, finalized_features, name, *range)?;
            features.insert(name.clone(), *range);
        }
        if !request.features.contains_key(METADATA_VERSION_FEATURE_NAME) {
            // Brokers that don't declare a supported platform-version range
            // are assumed to only support the minimum level.
            let level = MetadataVersion::MINIMUM.level();
            let range = VersionRange { min: level, max: level };
            self.process_registration_feature(
                broker_id,
                finalized_features,
                METADATA_VERSION_FEATURE_NAME,
                range,
            )?;
            features.insert(METADATA_VERSION_FEATURE_NAME.to_owned(), range);
        }

        let mut records = Vec::new();
        let new_incarnation = existing
            .as_ref()
            .map_or(true, |existing| existing.incarnation_id != request.incarnation_id);
        let (epoch, fenced, in_controlled_shutdown) = if new_incarnation {
            let before = records.len();
            self.unclean_shutdown_handler
                .add_records_for_shutdown(broker_id, &mut records);
            let cleanup_records = records.len() - before;
            match &existing {
                None => info!(
                    %broker_id,
                    incarnation_id = %request.incarnation_id,
                    cleanup_records,
                    epoch = %new_broker_epoch,
                    "no previous registration found for broker, registering new incarnation"
                ),
                Some(existing) => info!(
                    %broker_id,
                    previous_incarnation_id = %existing.incarnation_id,
                    incarnation_id = %request.incarnation_id,
                    cleanup_records,
                    epoch = %new_broker_epoch,
                    "registering a new incarnation of broker"
                ),
            }
            // A new incarnation starts out fenced until it catches up and
            // heartbeats its way out.
            (new_broker_epoch, true, false)
        } else {
            let existing = existing.as_ref().expect("amended registration exists");
            info!(
                %broker_id,
                incarnation_id = %request.incarnation_id,
                epoch = %existing.epoch,
                "amending registration of broker, epoch remains unchanged"
            );
            (existing.epoch, existing.fenced, existing.in_controlled_shutdown)
        };

        let directories = if metadata_version.is_directory_assignment_supported() {
            request.directories.clone()
        } else {
            Vec::new()
        };
        records.push(
            RecordPayload::BrokerRegistered(BrokerRegistrationRecord {
                broker_id,
                incarnation_id: request.incarnation_id,
                broker_epoch: epoch,
                listeners: request.listeners.clone(),
                features,
                rack: request.rack.clone(),
                fenced,
                in_controlled_shutdown,
                is_migrating_legacy_broker: request.is_migrating_legacy_broker,
                directories,
            })
            .into(),
        );

        let heartbeat_manager = self.heartbeat_manager.as_mut().expect("is active");
        if new_incarnation {
            // Any session of the old incarnation is void.
            heartbeat_manager.remove(broker_id);
        }
        heartbeat_manager.register(broker_id, fenced);

        records.extend(self.registration_cleanup_records(broker_id));

        Ok(ControllerResult::new(
            records,
            BrokerRegistrationReply { epoch },
        ))
    }

    /// Processes an incoming controller registration request. Controller
    /// identities are replaced wholesale, so there is no amend or duplicate
    /// detection here.
    pub fn register_controller(
        &self,
        request: &ControllerRegistrationRequest,
    ) -> Result<ControllerResult<()>, RegistrationError> {
        if !self
            .feature_control
            .metadata_version()
            .is_controller_registration_supported()
        {
            return Err(RegistrationError::UnsupportedVersion(
                "the current metadata version is too old to support controller registration"
                    .to_owned(),
            ));
        }
        let record = ControllerRegistrationRecord {
            controller_id: request.controller_id,
            incarnation_id: request.incarnation_id,
            listeners: request.listeners.clone(),
            features: request.features.clone(),
            migration_ready: request.migration_ready,
        };
        Ok(ControllerResult::new(
            vec![RecordPayload::ControllerRegistered(record).into()],
            (),
        ))
    }

    /// Proposes the removal of a broker's registration at its current epoch,
    /// parking its id for reuse.
    pub fn unregister_broker(
        &self,
        broker_id: NodeId,
    ) -> Result<ControllerResult<()>, RegistrationError> {
        let registration = self
            .brokers
            .get(&broker_id)
            .ok_or(RegistrationError::BrokerIdNotRegistered(broker_id))?;
        let mut records = vec![RecordPayload::BrokerUnregistered(
            BrokerUnregistrationRecord {
                broker_id,
                broker_epoch: registration.epoch,
            },
        )
        .into()];
        records.extend(self.release_node_id(broker_id));
        Ok(ControllerResult::new(records, ()))
    }

    fn legacy_registration_allowed(&self) -> bool {
        self.legacy_migration_enabled
            && self.feature_control.metadata_version().is_migration_supported()
    }

    fn validate_directories(
        &self,
        request: &BrokerRegistrationRequest,
    ) -> Result<(), RegistrationError> {
        if request.directories.is_empty() {
            return Err(RegistrationError::InvalidDirectoryAssignment(
                "no directories specified in request".to_owned(),
            ));
        }
        if let Some(reserved) = request.directories.iter().find(|d| d.is_reserved()) {
            return Err(RegistrationError::InvalidDirectoryAssignment(format!(
                "reserved directory id {reserved} in request"
            )));
        }
        let unique: HashSet<_> = request.directories.iter().collect();
        if unique.len() != request.directories.len() {
            return Err(RegistrationError::InvalidDirectoryAssignment(
                "duplicate directory id in request".to_owned(),
            ));
        }
        for directory in &request.directories {
            if let Some(owner) = self.directory_owners.get(directory) {
                if *owner != request.broker_id {
                    return Err(RegistrationError::InvalidDirectoryAssignment(format!(
                        "broker {owner} is already registered with directory {directory}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn process_registration_feature(
        &self,
        broker_id: NodeId,
        finalized_features: &FinalizedFeatures,
        name: &str,
        range: VersionRange,
    ) -> Result<(), RegistrationError> {
        // The platform-version feature defaults to level 1, everything else
        // to 0 (not enabled).
        let default_level = if name == METADATA_VERSION_FEATURE_NAME {
            FeatureLevel::new(1)
        } else {
            FeatureLevel::new(0)
        };
        let finalized = finalized_features.version_or_default(name, default_level);
        if !range.contains(finalized) {
            return Err(RegistrationError::UnsupportedVersion(format!(
                "broker {broker_id} does not support version {finalized} of {name}; it supports \
                 versions {range}, inclusive"
            )));
        }
        if !PRODUCTION_FEATURE_NAMES.contains(&name) {
            warn!(
                %broker_id,
                feature = name,
                "broker registered with a feature unknown to the controller"
            );
        }
        Ok(())
    }

    // --- node-identity allocation ---

    /// Hands out the next node id. Prefers the reusable pool; otherwise bumps
    /// the high-water mark past every registered broker and quorum member,
    /// floored at [`FIRST_ALLOCATED_NODE_ID`].
    ///
    /// Durability is asynchronous: the update record is appended, not waited
    /// on, so after a leader failure the next leader may hand out the same
    /// id again. Registration revalidates against actual state, so nothing
    /// trusts an allocated id blindly.
    pub fn allocate_next_node_id(&self) -> ControllerResult<NodeId> {
        let mut pool = self.reusable_node_ids();
        if let Some(node_id) = pool.pop_first() {
            // The id leaves the pool even though the caller might never
            // register it; reuse is opportunistic, not reserved.
            debug!(%node_id, "allocated node id from the reusable pool");
            return ControllerResult::new(vec![self.put_reusable_node_ids(&pool)], node_id);
        }

        let max_broker_id = self.brokers.keys().max().copied().unwrap_or(NodeId::MIN);
        let max_node_id = cmp::max(max_broker_id, self.max_controller_id);
        let mut allocated = 0i64;
        self.next_node_id
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                allocated = cmp::max(
                    cmp::max(last, i64::from(max_node_id.as_u32())) + 1,
                    i64::from(FIRST_ALLOCATED_NODE_ID),
                );
                Some(allocated)
            })
            .expect("the update function never bails");
        let node_id = NodeId::new(u32::try_from(allocated).expect("node id fits in u32"));
        debug!(%node_id, "allocated a fresh node id");
        ControllerResult::new(
            vec![RecordPayload::NextNodeIdUpdated(NextNodeIdRecord { node_id }).into()],
            node_id,
        )
    }

    /// Parks the id of an unregistered broker so a later allocation can hand
    /// it out again.
    pub fn release_node_id(&self, broker_id: NodeId) -> Vec<ControlRecord> {
        let mut pool = self.reusable_node_ids();
        pool.insert(broker_id);
        vec![self.put_reusable_node_ids(&pool)]
    }

    /// Clears a stale reuse entry when a broker registers under an id that is
    /// still parked in the pool.
    fn registration_cleanup_records(&self, broker_id: NodeId) -> Vec<ControlRecord> {
        let mut pool = self.reusable_node_ids();
        if pool.remove(&broker_id) {
            vec![self.put_reusable_node_ids(&pool)]
        } else {
            Vec::new()
        }
    }

    pub fn reusable_node_ids(&self) -> BTreeSet<NodeId> {
        self.reserved_kv
            .get(&REUSABLE_NODE_IDS_KEY)
            .map(|value| decode_reusable_node_ids(value))
            .unwrap_or_default()
    }

    fn put_reusable_node_ids(&self, pool: &BTreeSet<NodeId>) -> ControlRecord {
        RecordPayload::KvPut(KvPutRecord {
            key: REUSABLE_NODE_IDS_KEY.clone(),
            value: encode_reusable_node_ids(pool),
        })
        .into()
    }

    // --- readiness ---

    /// Waits until at least `min_brokers` brokers are unfenced. At most one
    /// waiter is outstanding; a new one displaces any previous waiter, whose
    /// receiver then observes a closed channel. If the threshold is already
    /// met the returned receiver resolves immediately.
    pub fn await_minimum_unfenced_brokers(&mut self, min_brokers: usize) -> oneshot::Receiver<()> {
        let (sender, receiver) = oneshot::channel();
        self.ready_brokers_future = Some(ReadyBrokersFuture { sender, min_brokers });
        self.check_ready_brokers();
        receiver
    }

    fn check_ready_brokers(&mut self) {
        if let Some(ready) = self.ready_brokers_future.take() {
            if self.count_unfenced_brokers() >= ready.min_brokers {
                info!(
                    min_brokers = ready.min_brokers,
                    "reached the minimum number of unfenced brokers"
                );
                let _ = ready.sender.send(());
            } else {
                self.ready_brokers_future = Some(ready);
            }
        }
    }

    fn count_unfenced_brokers(&self) -> usize {
        self.brokers
            .values()
            .filter(|registration| !registration.fenced)
            .count()
    }

    // --- replay ---

    /// Applies one committed record. Replay must be deterministic and safe on
    /// standby replicas; a [`ReplayFault`] means the log and this replica's
    /// state have diverged, and the caller must abort the controller instead
    /// of continuing.
    pub fn replay(&mut self, record: &ControlRecord, offset: LogOffset) -> Result<(), ReplayFault> {
        match &record.payload {
            RecordPayload::BrokerRegistered(record) => {
                self.replay_broker_registered(record, offset)
            }
            RecordPayload::BrokerUnregistered(record) => {
                self.replay_broker_unregistered(record, offset)
            }
            RecordPayload::BrokerFenced(record) => self.replay_registration_change(
                RecordKind::BrokerFenced,
                record.broker_id,
                record.broker_epoch,
                Some(true),
                None,
                None,
                offset,
            ),
            RecordPayload::BrokerUnfenced(record) => self.replay_registration_change(
                RecordKind::BrokerUnfenced,
                record.broker_id,
                record.broker_epoch,
                Some(false),
                None,
                None,
                offset,
            ),
            RecordPayload::BrokerRegistrationChanged(record) => {
                self.replay_broker_registration_changed(record, offset)
            }
            RecordPayload::ControllerRegistered(record) => {
                self.replay_controller_registered(record, offset);
                Ok(())
            }
            RecordPayload::NextNodeIdUpdated(record) => {
                self.next_node_id
                    .store(i64::from(record.node_id.as_u32()), Ordering::Release);
                Ok(())
            }
            RecordPayload::KvPut(record) => {
                self.reserved_kv
                    .insert(record.key.clone(), record.value.clone(), offset);
                Ok(())
            }
        }
    }

    fn replay_broker_registered(
        &mut self,
        record: &BrokerRegistrationRecord,
        offset: LogOffset,
    ) -> Result<(), ReplayFault> {
        let broker_id = record.broker_id;
        let registration = BrokerRegistration::new(
            broker_id,
            record.broker_epoch,
            record.incarnation_id,
            record.listeners.clone(),
            record.features.clone(),
            record.rack.clone(),
            record.fenced,
            record.in_controlled_shutdown,
            record.is_migrating_legacy_broker,
            record.directories.clone(),
        );
        let next_directories = registration.directories().to_vec();
        let previous = self.brokers.insert(broker_id, registration, offset);
        self.registration_offsets.insert(broker_id, offset, offset);
        let previous_directories = previous
            .as_ref()
            .map(|previous| previous.directories().to_vec());
        self.update_directories(
            broker_id,
            previous_directories.as_deref(),
            Some(&next_directories),
            offset,
        )?;
        if let Some(heartbeat_manager) = self.heartbeat_manager.as_mut() {
            if previous.is_some() {
                heartbeat_manager.remove(broker_id);
            }
            heartbeat_manager.register(broker_id, record.fenced);
        }
        match &previous {
            None => info!(%broker_id, %offset, "replayed initial registration for broker"),
            Some(previous) if previous.incarnation_id == record.incarnation_id => {
                info!(%broker_id, %offset, "replayed registration amendment for broker")
            }
            Some(previous) => info!(
                %broker_id,
                %offset,
                previous_incarnation_id = %previous.incarnation_id,
                "replayed registration establishing a new incarnation of broker"
            ),
        }
        Ok(())
    }

    fn replay_broker_unregistered(
        &mut self,
        record: &BrokerUnregistrationRecord,
        offset: LogOffset,
    ) -> Result<(), ReplayFault> {
        let kind = RecordKind::BrokerUnregistered;
        let broker_id = record.broker_id;
        let registration = self
            .brokers
            .get(&broker_id)
            .ok_or(ReplayFault::UnknownBroker { kind, broker_id })?;
        if registration.epoch != record.broker_epoch {
            return Err(ReplayFault::EpochMismatch {
                kind,
                broker_id,
                current: registration.epoch,
                cited: record.broker_epoch,
            });
        }
        let directories = registration.directories().to_vec();
        if let Some(heartbeat_manager) = self.heartbeat_manager.as_mut() {
            heartbeat_manager.remove(broker_id);
        }
        self.update_directories(broker_id, Some(&directories), None, offset)?;
        self.brokers.remove(&broker_id, offset);
        self.registration_offsets.remove(&broker_id, offset);
        info!(%broker_id, epoch = %record.broker_epoch, "replayed unregistration of broker");
        Ok(())
    }

    fn replay_broker_registration_changed(
        &mut self,
        record: &BrokerRegistrationChangeRecord,
        offset: LogOffset,
    ) -> Result<(), ReplayFault> {
        let kind = RecordKind::BrokerRegistrationChanged;
        let fencing = BrokerFencingChange::from_value(record.fenced).ok_or(
            ReplayFault::UnknownFencingChange {
                kind,
                value: record.fenced,
            },
        )?;
        let shutdown = BrokerShutdownChange::from_value(record.in_controlled_shutdown).ok_or(
            ReplayFault::UnknownShutdownChange {
                kind,
                value: record.in_controlled_shutdown,
            },
        )?;
        // An empty directory list is "no change"; explicit directory updates
        // always carry at least one entry.
        let directories = (!record.directories.is_empty()).then(|| record.directories.clone());
        self.replay_registration_change(
            kind,
            record.broker_id,
            record.broker_epoch,
            fencing.as_bool(),
            shutdown.as_bool(),
            directories,
            offset,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn replay_registration_change(
        &mut self,
        kind: RecordKind,
        broker_id: NodeId,
        broker_epoch: BrokerEpoch,
        fencing: Option<bool>,
        in_controlled_shutdown: Option<bool>,
        directories: Option<Vec<DirectoryId>>,
        offset: LogOffset,
    ) -> Result<(), ReplayFault> {
        let current = self
            .brokers
            .get(&broker_id)
            .cloned()
            .ok_or(ReplayFault::UnknownBroker { kind, broker_id })?;
        if current.epoch != broker_epoch {
            return Err(ReplayFault::EpochMismatch {
                kind,
                broker_id,
                current: current.epoch,
                cited: broker_epoch,
            });
        }
        let next = current.with_changes(fencing, in_controlled_shutdown, directories);
        let next_directories = next.directories().to_vec();
        let next_fenced = next.fenced;
        if next != current {
            info!(%broker_id, record = %kind, "replayed registration change for broker");
            self.brokers.insert(broker_id, next, offset);
        } else {
            debug!(%broker_id, record = %kind, "ignoring no-op registration change");
        }
        self.update_directories(
            broker_id,
            Some(current.directories()),
            Some(&next_directories),
            offset,
        )?;
        if let Some(heartbeat_manager) = self.heartbeat_manager.as_mut() {
            heartbeat_manager.register(broker_id, next_fenced);
        }
        self.check_ready_brokers();
        Ok(())
    }

    fn replay_controller_registered(
        &mut self,
        record: &ControllerRegistrationRecord,
        offset: LogOffset,
    ) {
        let controller_id = record.controller_id;
        let registration = ControllerRegistration {
            id: controller_id,
            incarnation_id: record.incarnation_id,
            listeners: record.listeners.clone(),
            supported_features: record.features.clone(),
            migration_ready: record.migration_ready,
        };
        let previous = self.controllers.insert(controller_id, registration, offset);
        match previous {
            None => info!(%controller_id, "replayed controller registration"),
            Some(previous) => info!(
                %controller_id,
                previous_incarnation_id = %previous.incarnation_id,
                "replayed controller registration replacing a previous incarnation"
            ),
        }
    }

    /// Reconciles the directory-ownership index with a broker's directory
    /// set. Any contradiction here means the index and the registrations
    /// have diverged, which is a fault, not a user error.
    fn update_directories(
        &mut self,
        broker_id: NodeId,
        remove: Option<&[DirectoryId]>,
        add: Option<&[DirectoryId]>,
        offset: LogOffset,
    ) -> Result<(), ReplayFault> {
        if let Some(remove) = remove {
            for directory in remove {
                match self.directory_owners.get(directory) {
                    Some(owner) if *owner == broker_id => {
                        self.directory_owners.remove(directory, offset);
                    }
                    _ => {
                        return Err(ReplayFault::DirectoryNotAssigned {
                            directory: *directory,
                            broker_id,
                        })
                    }
                }
            }
        }
        if let Some(add) = add {
            for directory in add {
                match self.directory_owners.get(directory) {
                    Some(owner) if *owner != broker_id => {
                        return Err(ReplayFault::DirectoryAlreadyAssigned {
                            directory: *directory,
                            owner: *owner,
                        })
                    }
                    Some(_) => {}
                    None => {
                        self.directory_owners.insert(*directory, broker_id, offset);
                    }
                }
            }
        }
        Ok(())
    }

    // --- queries ---

    pub fn registration(&self, broker_id: NodeId) -> Option<&BrokerRegistration> {
        self.brokers.get(&broker_id)
    }

    /// Reads a broker's registration as of a committed offset, for readers
    /// lagging behind the replay cursor.
    pub fn registration_at(
        &self,
        broker_id: NodeId,
        offset: LogOffset,
    ) -> Option<&BrokerRegistration> {
        self.brokers.get_at(&broker_id, offset)
    }

    pub fn controller_registration(
        &self,
        controller_id: NodeId,
    ) -> Option<&ControllerRegistration> {
        self.controllers.get(&controller_id)
    }

    /// Offset of the broker's most recent registration record, if any.
    pub fn registration_offset(&self, broker_id: NodeId) -> Option<LogOffset> {
        self.registration_offsets.get(&broker_id).copied()
    }

    pub fn directory_owner(&self, directory: DirectoryId) -> Option<NodeId> {
        self.directory_owners.get(&directory).copied()
    }

    /// Returns true if the broker is unfenced; false if it is not or if it
    /// does not exist.
    pub fn is_unfenced(&self, broker_id: NodeId) -> bool {
        self.brokers
            .get(&broker_id)
            .is_some_and(|registration| !registration.fenced)
    }

    /// Returns true if the broker is in controlled shutdown; false if it is
    /// not or if it does not exist.
    pub fn in_controlled_shutdown(&self, broker_id: NodeId) -> bool {
        self.brokers
            .get(&broker_id)
            .is_some_and(|registration| registration.in_controlled_shutdown)
    }

    /// Returns true if the broker is active: registered, unfenced and not in
    /// controlled shutdown.
    pub fn is_active(&self, broker_id: NodeId) -> bool {
        self.brokers.get(&broker_id).is_some_and(|registration| {
            !registration.fenced && !registration.in_controlled_shutdown
        })
    }

    /// Whether `directory` is online in `broker_id`. False if the broker is
    /// not registered.
    pub fn has_online_directory(&self, broker_id: NodeId, directory: DirectoryId) -> bool {
        self.brokers
            .get(&broker_id)
            .is_some_and(|registration| registration.has_online_directory(directory))
    }

    /// The default directory for new replicas on the given broker:
    /// [`DirectoryId::MIGRATING`] if the broker registered without directory
    /// information, the directory itself if it has exactly one, and
    /// [`DirectoryId::UNASSIGNED`] otherwise. An unregistered broker also
    /// reports [`DirectoryId::UNASSIGNED`] so admin paths can surface the
    /// missing registration themselves.
    pub fn default_directory(&self, broker_id: NodeId) -> DirectoryId {
        let Some(registration) = self.brokers.get(&broker_id) else {
            return DirectoryId::UNASSIGNED;
        };
        match registration.directories() {
            [] => DirectoryId::MIGRATING,
            [directory] => *directory,
            _ => DirectoryId::UNASSIGNED,
        }
    }

    /// Validates the epoch a broker cites in a heartbeat or lifecycle
    /// request against its registration.
    pub fn check_broker_epoch(
        &self,
        broker_id: NodeId,
        broker_epoch: BrokerEpoch,
    ) -> Result<(), RegistrationError> {
        let registration = self
            .brokers
            .get(&broker_id)
            .ok_or(RegistrationError::BrokerIdNotRegistered(broker_id))?;
        if registration.epoch != broker_epoch {
            return Err(RegistrationError::StaleBrokerEpoch {
                expected: registration.epoch,
                actual: broker_epoch,
            });
        }
        Ok(())
    }

    pub fn fenced_broker_ids(&self) -> BTreeSet<NodeId> {
        self.brokers
            .values()
            .filter(|registration| registration.fenced)
            .map(|registration| registration.id)
            .collect()
    }

    pub fn active_brokers(&self) -> impl Iterator<Item = &BrokerRegistration> {
        self.brokers.values().filter(|registration| {
            !registration.fenced && !registration.in_controlled_shutdown
        })
    }

    /// Rack-aware iterator over the brokers currently tracked by the
    /// liveness tracker, for external placement logic. Only available while
    /// active.
    pub fn usable_brokers(
        &self,
    ) -> Result<impl Iterator<Item = UsableBroker> + '_, RegistrationError> {
        let heartbeat_manager = self.heartbeat_manager()?;
        Ok(heartbeat_manager.usable_brokers(|broker_id| {
            self.brokers
                .get(&broker_id)
                .and_then(|registration| registration.rack.clone())
        }))
    }

    pub fn broker_supported_features(
        &self,
    ) -> impl Iterator<Item = (NodeId, &BTreeMap<String, VersionRange>)> {
        self.brokers
            .values()
            .map(|registration| (registration.id, &registration.supported_features))
    }

    pub fn controller_supported_features(
        &self,
    ) -> Result<impl Iterator<Item = (NodeId, &BTreeMap<String, VersionRange>)>, RegistrationError>
    {
        if !self
            .feature_control
            .metadata_version()
            .is_controller_registration_supported()
        {
            return Err(RegistrationError::UnsupportedVersion(
                "the current metadata version is too old to support controller registration"
                    .to_owned(),
            ));
        }
        Ok(self
            .controllers
            .values()
            .map(|registration| (registration.id, &registration.supported_features)))
    }

    /// Drops versioned-map history that no reader can need anymore, e.g.
    /// after the external log reports a new trim point.
    pub fn purge_history_up_to(&mut self, offset: LogOffset) {
        self.brokers.purge_up_to(offset);
        self.registration_offsets.purge_up_to(offset);
        self.controllers.purge_up_to(offset);
        self.directory_owners.purge_up_to(offset);
        self.reserved_kv.purge_up_to(offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tidelog_types::membership::ListenerEndpoint;
    use tidelog_types::records::{FenceBrokerRecord, UnfenceBrokerRecord};
    use tidelog_types::IncarnationId;

    use crate::placement::PlacementError;

    const NEW_EPOCH: BrokerEpoch = BrokerEpoch::new(10);

    struct StaticFeatureControl {
        metadata_version: MetadataVersion,
        pre_migration: bool,
    }

    impl FeatureControl for StaticFeatureControl {
        fn metadata_version(&self) -> MetadataVersion {
            self.metadata_version
        }

        fn in_pre_migration_mode(&self) -> bool {
            self.pre_migration
        }
    }

    struct NoPlacement;

    impl ReplicaPlacer for NoPlacement {
        fn place(
            &self,
            _partition_count: u32,
            _replication_factor: u16,
            _candidates: Vec<UsableBroker>,
        ) -> Result<Vec<Vec<NodeId>>, PlacementError> {
            Ok(Vec::new())
        }
    }

    fn manager_with(
        metadata_version: MetadataVersion,
        pre_migration: bool,
        legacy_migration_enabled: bool,
    ) -> ClusterControlManager {
        let options = Options {
            cluster_id: "test-cluster".to_owned(),
            legacy_migration_enabled,
            ..Options::default()
        };
        ClusterControlManager::new(
            options,
            Arc::new(StaticFeatureControl {
                metadata_version,
                pre_migration,
            }),
            Arc::new(NoPlacement),
            Box::new(|_: NodeId, _: &mut Vec<ControlRecord>| {}),
        )
    }

    fn manager_at(metadata_version: MetadataVersion) -> ClusterControlManager {
        manager_with(metadata_version, false, false)
    }

    fn active_manager() -> ClusterControlManager {
        let mut manager = manager_at(MetadataVersion::LATEST);
        manager.activate();
        manager
    }

    fn finalized_features() -> FinalizedFeatures {
        FinalizedFeatures::new(MetadataVersion::LATEST)
    }

    fn directory(value: u128) -> DirectoryId {
        DirectoryId::from_u128(value)
    }

    fn request(
        broker_id: u32,
        incarnation: u128,
        directories: &[DirectoryId],
    ) -> BrokerRegistrationRequest {
        BrokerRegistrationRequest {
            cluster_id: "test-cluster".to_owned(),
            broker_id: NodeId::new(broker_id),
            incarnation_id: IncarnationId::from_u128(incarnation),
            listeners: vec![ListenerEndpoint::new(
                "internal",
                format!("broker-{broker_id}"),
                9092,
            )],
            features: [(
                METADATA_VERSION_FEATURE_NAME.to_owned(),
                VersionRange::of(1, 7),
            )]
            .into_iter()
            .collect(),
            rack: Some("rack-a".to_owned()),
            directories: directories.to_vec(),
            is_migrating_legacy_broker: false,
        }
    }

    fn controller_request(id: u32, incarnation: u128) -> ControllerRegistrationRequest {
        ControllerRegistrationRequest {
            controller_id: NodeId::new(id),
            incarnation_id: IncarnationId::from_u128(incarnation),
            listeners: vec![ListenerEndpoint::new(
                "controller",
                format!("controller-{id}"),
                9093,
            )],
            features: [(
                METADATA_VERSION_FEATURE_NAME.to_owned(),
                VersionRange::of(1, 7),
            )]
            .into_iter()
            .collect(),
            migration_ready: false,
        }
    }

    fn registration_record(
        broker_id: u32,
        incarnation: u128,
        epoch: u64,
        directories: &[DirectoryId],
    ) -> ControlRecord {
        RecordPayload::BrokerRegistered(BrokerRegistrationRecord {
            broker_id: NodeId::new(broker_id),
            incarnation_id: IncarnationId::from_u128(incarnation),
            broker_epoch: BrokerEpoch::new(epoch),
            listeners: vec![ListenerEndpoint::new(
                "internal",
                format!("broker-{broker_id}"),
                9092,
            )],
            features: BTreeMap::new(),
            rack: None,
            fenced: true,
            in_controlled_shutdown: false,
            is_migrating_legacy_broker: false,
            directories: directories.to_vec(),
        })
        .into()
    }

    fn fence_record(broker_id: u32, epoch: u64) -> ControlRecord {
        RecordPayload::BrokerFenced(FenceBrokerRecord {
            broker_id: NodeId::new(broker_id),
            broker_epoch: BrokerEpoch::new(epoch),
        })
        .into()
    }

    fn unfence_record(broker_id: u32, epoch: u64) -> ControlRecord {
        RecordPayload::BrokerUnfenced(UnfenceBrokerRecord {
            broker_id: NodeId::new(broker_id),
            broker_epoch: BrokerEpoch::new(epoch),
        })
        .into()
    }

    fn replay_all(
        manager: &mut ClusterControlManager,
        records: &[ControlRecord],
        first_offset: u64,
    ) -> LogOffset {
        let mut offset = LogOffset::new(first_offset);
        for record in records {
            manager.replay(record, offset).expect("replay succeeds");
            offset = offset.next();
        }
        offset
    }

    fn register(
        manager: &mut ClusterControlManager,
        broker_id: u32,
        incarnation: u128,
        directories: &[DirectoryId],
        first_offset: u64,
    ) -> BrokerRegistrationReply {
        let request = request(broker_id, incarnation, directories);
        let result = manager
            .register_broker(&request, NEW_EPOCH, &finalized_features())
            .expect("registration accepted");
        replay_all(manager, &result.records, first_offset);
        result.response
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn register_broker_round_trip() {
        let mut manager = active_manager();
        let d1 = directory(1001);

        let reply = register(&mut manager, 5, 0xa, &[d1], 0);
        assert_eq!(reply.epoch, NEW_EPOCH);

        let registration = manager.registration(NodeId::new(5)).expect("registered");
        assert_eq!(registration.epoch, NEW_EPOCH);
        assert!(registration.fenced);
        assert!(!manager.is_unfenced(NodeId::new(5)));
        assert_eq!(
            manager.registration_offset(NodeId::new(5)),
            Some(LogOffset::new(0))
        );
        assert_eq!(manager.directory_owner(d1), Some(NodeId::new(5)));
        assert!(manager
            .heartbeat_manager()
            .expect("active")
            .has_valid_session(NodeId::new(5)));
        assert_eq!(manager.broker_supported_features().count(), 1);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn fencing_round_trip() {
        let mut manager = active_manager();
        register(&mut manager, 5, 0xa, &[directory(1001)], 0);
        assert!(!manager.is_unfenced(NodeId::new(5)));

        manager
            .replay(&fence_record(5, 10), LogOffset::new(1))
            .expect("fence replays");
        assert!(!manager.is_unfenced(NodeId::new(5)));

        manager
            .replay(&unfence_record(5, 10), LogOffset::new(2))
            .expect("unfence replays");
        assert!(manager.is_unfenced(NodeId::new(5)));
        assert!(manager.is_active(NodeId::new(5)));
        assert_eq!(manager.fenced_broker_ids().len(), 0);
        assert_eq!(manager.active_brokers().count(), 1);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn live_brokers_cannot_be_replaced() {
        let mut manager = active_manager();
        register(&mut manager, 5, 0xa, &[directory(1001)], 0);

        let err = manager
            .register_broker(
                &request(5, 0xb, &[directory(1001)]),
                BrokerEpoch::new(20),
                &finalized_features(),
            )
            .unwrap_err();
        assert_eq!(err, RegistrationError::DuplicateRegistration(NodeId::new(5)));

        // once the session expires, a new incarnation may take over
        tokio::time::advance(Duration::from_secs(10)).await;
        let result = manager
            .register_broker(
                &request(5, 0xb, &[directory(1001)]),
                BrokerEpoch::new(20),
                &finalized_features(),
            )
            .expect("takeover accepted");
        assert_eq!(result.response.epoch, BrokerEpoch::new(20));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn amending_a_registration_preserves_liveness_state() {
        let mut manager = active_manager();
        register(&mut manager, 5, 0xa, &[directory(1001)], 0);
        manager
            .replay(&unfence_record(5, 10), LogOffset::new(1))
            .expect("unfence replays");

        let result = manager
            .register_broker(
                &request(5, 0xa, &[directory(1001)]),
                BrokerEpoch::new(42),
                &finalized_features(),
            )
            .expect("amend accepted");
        assert_eq!(result.response.epoch, NEW_EPOCH);
        let RecordPayload::BrokerRegistered(record) = &result.records[0].payload else {
            panic!("expected a registration record");
        };
        assert_eq!(record.broker_epoch, NEW_EPOCH);
        assert!(!record.fenced);

        replay_all(&mut manager, &result.records, 2);
        assert!(manager.is_unfenced(NodeId::new(5)));
        assert_eq!(manager.registration(NodeId::new(5)).unwrap().epoch, NEW_EPOCH);
    }

    #[test]
    fn rejects_when_not_active() {
        let mut manager = manager_at(MetadataVersion::LATEST);
        let err = manager
            .register_broker(
                &request(5, 0xa, &[directory(1001)]),
                NEW_EPOCH,
                &finalized_features(),
            )
            .unwrap_err();
        assert_eq!(err, RegistrationError::NotActive);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn rejects_foreign_cluster_ids() {
        let mut manager = active_manager();
        let mut req = request(5, 0xa, &[directory(1001)]);
        req.cluster_id = "other-cluster".to_owned();
        let err = manager
            .register_broker(&req, NEW_EPOCH, &finalized_features())
            .unwrap_err();
        assert_eq!(
            err,
            RegistrationError::InconsistentClusterId {
                expected: "test-cluster".to_owned(),
                actual: "other-cluster".to_owned(),
            }
        );
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn rejects_invalid_directory_assignments() {
        let mut manager = active_manager();
        let d1 = directory(1001);
        let d2 = directory(1002);
        register(&mut manager, 7, 0x7, &[d1, d2], 0);

        for req in [
            request(8, 0x8, &[]),
            request(8, 0x8, &[DirectoryId::UNASSIGNED]),
            request(8, 0x8, &[directory(1003), directory(1003)]),
            request(8, 0x8, &[d1]),
        ] {
            let err = manager
                .register_broker(&req, NEW_EPOCH, &finalized_features())
                .unwrap_err();
            assert!(
                matches!(err, RegistrationError::InvalidDirectoryAssignment(_)),
                "unexpected error: {err}"
            );
        }

        // a broker may re-claim its own directories
        manager
            .register_broker(&request(7, 0x7, &[d1]), NEW_EPOCH, &finalized_features())
            .expect("own directories accepted");
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn directories_are_ignored_below_the_assignment_version() {
        let mut manager = manager_with(MetadataVersion::new(5), false, false);
        manager.activate();
        let finalized = FinalizedFeatures::new(MetadataVersion::new(5));

        let result = manager
            .register_broker(&request(5, 0xa, &[directory(1001)]), NEW_EPOCH, &finalized)
            .expect("accepted without directory validation");
        let RecordPayload::BrokerRegistered(record) = &result.records[0].payload else {
            panic!("expected a registration record");
        };
        assert!(record.directories.is_empty());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn rejects_unsupported_feature_versions() {
        let mut manager = active_manager();

        let mut req = request(5, 0xa, &[directory(1001)]);
        req.features.insert(
            METADATA_VERSION_FEATURE_NAME.to_owned(),
            VersionRange::of(1, 3),
        );
        let err = manager
            .register_broker(&req, NEW_EPOCH, &finalized_features())
            .unwrap_err();
        assert!(matches!(err, RegistrationError::UnsupportedVersion(_)));

        // brokers that omit the platform-version feature only support the
        // minimum level
        let mut req = request(5, 0xa, &[directory(1001)]);
        req.features.clear();
        let err = manager
            .register_broker(&req, NEW_EPOCH, &finalized_features())
            .unwrap_err();
        assert!(matches!(err, RegistrationError::UnsupportedVersion(_)));

        let result = manager
            .register_broker(
                &req,
                NEW_EPOCH,
                &FinalizedFeatures::new(MetadataVersion::MINIMUM),
            )
            .expect("minimum level accepted");
        let RecordPayload::BrokerRegistered(record) = &result.records[0].payload else {
            panic!("expected a registration record");
        };
        assert!(record.features.contains_key(METADATA_VERSION_FEATURE_NAME));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn unknown_features_are_logged_not_rejected() {
        let mut manager = active_manager();
        let mut req = request(5, 0xa, &[directory(1001)]);
        req.features
            .insert("tiered.compaction".to_owned(), VersionRange::of(0, 1));

        let result = manager
            .register_broker(&req, NEW_EPOCH, &finalized_features())
            .expect("accepted");
        let RecordPayload::BrokerRegistered(record) = &result.records[0].payload else {
            panic!("expected a registration record");
        };
        assert!(record.features.contains_key("tiered.compaction"));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn migration_gates() {
        // legacy broker, but migration is not enabled
        let mut manager = active_manager();
        let mut req = request(5, 0xa, &[directory(1001)]);
        req.is_migrating_legacy_broker = true;
        let err = manager
            .register_broker(&req, NEW_EPOCH, &finalized_features())
            .unwrap_err();
        assert!(matches!(err, RegistrationError::RegistrationNotAllowed(_)));

        // mid-migration, new-protocol brokers must wait
        let mut manager = manager_with(MetadataVersion::LATEST, true, true);
        manager.activate();
        let err = manager
            .register_broker(
                &request(5, 0xa, &[directory(1001)]),
                NEW_EPOCH,
                &finalized_features(),
            )
            .unwrap_err();
        assert!(matches!(err, RegistrationError::RegistrationNotAllowed(_)));

        // while the legacy broker itself may register
        let mut req = request(5, 0xa, &[directory(1001)]);
        req.is_migrating_legacy_broker = true;
        manager
            .register_broker(&req, NEW_EPOCH, &finalized_features())
            .expect("legacy broker accepted");
    }

    #[test]
    fn stale_epoch_unregistration_is_a_fatal_fault() {
        let mut manager = manager_at(MetadataVersion::LATEST);
        let d1 = directory(1001);
        manager
            .replay(&registration_record(5, 0xa, 10, &[d1]), LogOffset::new(0))
            .expect("registration replays");

        let record: ControlRecord =
            RecordPayload::BrokerUnregistered(BrokerUnregistrationRecord {
                broker_id: NodeId::new(5),
                broker_epoch: BrokerEpoch::new(9),
            })
            .into();
        let fault = manager.replay(&record, LogOffset::new(1)).unwrap_err();
        assert!(matches!(fault, ReplayFault::EpochMismatch { .. }));

        // no state change
        assert!(manager.registration(NodeId::new(5)).is_some());
        assert_eq!(
            manager.registration_offset(NodeId::new(5)),
            Some(LogOffset::new(0))
        );
        assert_eq!(manager.directory_owner(d1), Some(NodeId::new(5)));
    }

    #[test]
    fn change_records_for_unknown_brokers_are_fatal() {
        let mut manager = manager_at(MetadataVersion::LATEST);
        let fault = manager
            .replay(&fence_record(5, 10), LogOffset::new(0))
            .unwrap_err();
        assert!(matches!(fault, ReplayFault::UnknownBroker { .. }));
    }

    #[test]
    fn stale_epochs_never_mutate_state() {
        let mut manager = manager_at(MetadataVersion::LATEST);
        manager
            .replay(
                &registration_record(5, 0xa, 10, &[directory(1001)]),
                LogOffset::new(0),
            )
            .expect("registration replays");
        manager
            .replay(&unfence_record(5, 10), LogOffset::new(1))
            .expect("unfence replays");

        let fault = manager
            .replay(&fence_record(5, 9), LogOffset::new(2))
            .unwrap_err();
        assert!(matches!(fault, ReplayFault::EpochMismatch { .. }));
        assert!(manager.is_unfenced(NodeId::new(5)));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn unregistration_releases_directories_and_parks_the_id() {
        let mut manager = active_manager();
        let d1 = directory(1001);
        register(&mut manager, 1005, 0xa, &[d1], 0);

        let result = manager
            .unregister_broker(NodeId::new(1005))
            .expect("registered");
        assert_eq!(result.records.len(), 2);
        replay_all(&mut manager, &result.records, 1);

        assert!(manager.registration(NodeId::new(1005)).is_none());
        assert_eq!(manager.registration_offset(NodeId::new(1005)), None);
        assert_eq!(manager.directory_owner(d1), None);
        assert!(manager.reusable_node_ids().contains(&NodeId::new(1005)));
        assert!(!manager
            .heartbeat_manager()
            .expect("active")
            .has_valid_session(NodeId::new(1005)));

        assert_eq!(
            manager.unregister_broker(NodeId::new(1005)).unwrap_err(),
            RegistrationError::BrokerIdNotRegistered(NodeId::new(1005))
        );
    }

    #[test]
    fn replaying_a_registration_record_twice_is_idempotent() {
        let mut manager = manager_at(MetadataVersion::LATEST);
        let record = registration_record(5, 0xa, 10, &[directory(1001)]);

        manager.replay(&record, LogOffset::new(7)).expect("first replay");
        let first = manager.registration(NodeId::new(5)).cloned();
        manager.replay(&record, LogOffset::new(7)).expect("second replay");

        assert_eq!(manager.registration(NodeId::new(5)).cloned(), first);
        assert_eq!(
            manager.directory_owner(directory(1001)),
            Some(NodeId::new(5))
        );
        assert_eq!(
            manager.registration_offset(NodeId::new(5)),
            Some(LogOffset::new(7))
        );
    }

    #[test]
    fn allocates_node_ids_from_one_thousand() {
        let manager = manager_at(MetadataVersion::LATEST);

        let first = manager.allocate_next_node_id();
        assert_eq!(first.response, NodeId::new(1000));
        assert!(matches!(
            first.records[0].payload,
            RecordPayload::NextNodeIdUpdated(NextNodeIdRecord { node_id })
                if node_id == NodeId::new(1000)
        ));

        let second = manager.allocate_next_node_id();
        assert_eq!(second.response, NodeId::new(1001));
    }

    #[test]
    fn allocation_skips_past_registered_brokers() {
        let mut manager = manager_at(MetadataVersion::LATEST);
        manager
            .replay(
                &registration_record(2000, 0xa, 10, &[directory(1001)]),
                LogOffset::new(0),
            )
            .expect("registration replays");
        assert_eq!(manager.allocate_next_node_id().response, NodeId::new(2001));
    }

    #[test]
    fn allocation_stays_above_quorum_voters() {
        let options = Options {
            cluster_id: "test-cluster".to_owned(),
            quorum_voters: vec![NodeId::new(1), NodeId::new(3001)],
            ..Options::default()
        };
        let manager = ClusterControlManager::new(
            options,
            Arc::new(StaticFeatureControl {
                metadata_version: MetadataVersion::LATEST,
                pre_migration: false,
            }),
            Arc::new(NoPlacement),
            Box::new(|_: NodeId, _: &mut Vec<ControlRecord>| {}),
        );
        assert_eq!(manager.allocate_next_node_id().response, NodeId::new(3002));
    }

    #[test]
    fn released_ids_are_preferred_over_the_high_water_mark() {
        let mut manager = manager_at(MetadataVersion::LATEST);
        let records = manager.release_node_id(NodeId::new(1005));
        replay_all(&mut manager, &records, 0);

        let result = manager.allocate_next_node_id();
        assert_eq!(result.response, NodeId::new(1005));
        replay_all(&mut manager, &result.records, 1);
        assert!(manager.reusable_node_ids().is_empty());

        // pool exhausted, back to the high-water mark
        assert_eq!(manager.allocate_next_node_id().response, NodeId::new(1000));
    }

    #[test]
    fn high_water_mark_is_restored_from_the_log() {
        let mut manager = manager_at(MetadataVersion::LATEST);
        let record: ControlRecord = RecordPayload::NextNodeIdUpdated(NextNodeIdRecord {
            node_id: NodeId::new(1500),
        })
        .into();
        manager.replay(&record, LogOffset::new(0)).expect("replays");
        assert_eq!(manager.allocate_next_node_id().response, NodeId::new(1501));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn registration_clears_stale_reuse_entries() {
        let mut manager = active_manager();
        let records = manager.release_node_id(NodeId::new(1005));
        replay_all(&mut manager, &records, 0);

        let result = manager
            .register_broker(
                &request(1005, 0xa, &[directory(1001)]),
                NEW_EPOCH,
                &finalized_features(),
            )
            .expect("accepted");
        assert!(matches!(
            result.records.last().map(|record| &record.payload),
            Some(RecordPayload::KvPut(_))
        ));
        replay_all(&mut manager, &result.records, 1);
        assert!(manager.reusable_node_ids().is_empty());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn readiness_waiter_resolves_on_the_threshold_transition() {
        let mut manager = active_manager();
        register(&mut manager, 1000, 0xa, &[directory(2001)], 0);
        register(&mut manager, 1001, 0xb, &[directory(2002)], 1);

        let mut ready = manager.await_minimum_unfenced_brokers(2);
        assert!(ready.try_recv().is_err());

        manager
            .replay(&unfence_record(1000, 10), LogOffset::new(2))
            .expect("unfence replays");
        assert!(ready.try_recv().is_err());

        manager
            .replay(&unfence_record(1001, 10), LogOffset::new(3))
            .expect("unfence replays");
        assert!(matches!(ready.try_recv(), Ok(())));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn readiness_waiter_resolves_immediately_when_already_met() {
        let mut manager = active_manager();
        register(&mut manager, 1000, 0xa, &[directory(2001)], 0);
        manager
            .replay(&unfence_record(1000, 10), LogOffset::new(1))
            .expect("unfence replays");

        let mut ready = manager.await_minimum_unfenced_brokers(1);
        assert!(matches!(ready.try_recv(), Ok(())));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn a_new_waiter_displaces_the_previous_one() {
        let mut manager = active_manager();
        register(&mut manager, 1000, 0xa, &[directory(2001)], 0);

        let mut displaced = manager.await_minimum_unfenced_brokers(5);
        let mut ready = manager.await_minimum_unfenced_brokers(1);
        assert!(matches!(
            displaced.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));

        manager
            .replay(&unfence_record(1000, 10), LogOffset::new(1))
            .expect("unfence replays");
        assert!(matches!(ready.try_recv(), Ok(())));

        // resolved exactly once; later transitions find no waiter
        manager
            .replay(&fence_record(1000, 10), LogOffset::new(2))
            .expect("fence replays");
        manager
            .replay(&unfence_record(1000, 10), LogOffset::new(3))
            .expect("unfence replays");
    }

    #[test]
    fn controller_registration_requires_a_recent_metadata_version() {
        let manager = manager_at(MetadataVersion::MINIMUM);
        let err = manager
            .register_controller(&controller_request(1, 0xc))
            .unwrap_err();
        assert!(matches!(err, RegistrationError::UnsupportedVersion(_)));
        assert!(manager.controller_supported_features().is_err());
    }

    #[test]
    fn controller_registrations_are_replaced_wholesale() {
        let mut manager = manager_at(MetadataVersion::LATEST);

        let result = manager
            .register_controller(&controller_request(1, 0xc))
            .expect("accepted");
        replay_all(&mut manager, &result.records, 0);
        assert_eq!(
            manager
                .controller_registration(NodeId::new(1))
                .unwrap()
                .incarnation_id,
            IncarnationId::from_u128(0xc)
        );

        let result = manager
            .register_controller(&controller_request(1, 0xd))
            .expect("accepted");
        replay_all(&mut manager, &result.records, 1);
        assert_eq!(
            manager
                .controller_registration(NodeId::new(1))
                .unwrap()
                .incarnation_id,
            IncarnationId::from_u128(0xd)
        );

        let features: Vec<_> = manager
            .controller_supported_features()
            .expect("supported")
            .collect();
        assert_eq!(features.len(), 1);
    }

    #[test]
    fn unknown_change_encodings_are_fatal() {
        let mut manager = manager_at(MetadataVersion::LATEST);
        manager
            .replay(
                &registration_record(5, 0xa, 10, &[directory(1001)]),
                LogOffset::new(0),
            )
            .expect("registration replays");

        let record: ControlRecord =
            RecordPayload::BrokerRegistrationChanged(BrokerRegistrationChangeRecord {
                broker_id: NodeId::new(5),
                broker_epoch: BrokerEpoch::new(10),
                fenced: 7,
                in_controlled_shutdown: 0,
                directories: vec![],
            })
            .into();
        assert!(matches!(
            manager.replay(&record, LogOffset::new(1)).unwrap_err(),
            ReplayFault::UnknownFencingChange { value: 7, .. }
        ));

        let record: ControlRecord =
            RecordPayload::BrokerRegistrationChanged(BrokerRegistrationChangeRecord {
                broker_id: NodeId::new(5),
                broker_epoch: BrokerEpoch::new(10),
                fenced: 0,
                in_controlled_shutdown: 5,
                directories: vec![],
            })
            .into();
        assert!(matches!(
            manager.replay(&record, LogOffset::new(1)).unwrap_err(),
            ReplayFault::UnknownShutdownChange { value: 5, .. }
        ));

        assert!(!manager.is_unfenced(NodeId::new(5)));
    }

    #[test]
    fn change_records_apply_shutdown_and_directory_deltas() {
        let mut manager = manager_at(MetadataVersion::LATEST);
        let d1 = directory(1001);
        let d2 = directory(1002);
        manager
            .replay(&registration_record(5, 0xa, 10, &[d1]), LogOffset::new(0))
            .expect("registration replays");

        let record: ControlRecord =
            RecordPayload::BrokerRegistrationChanged(BrokerRegistrationChangeRecord {
                broker_id: NodeId::new(5),
                broker_epoch: BrokerEpoch::new(10),
                fenced: BrokerFencingChange::Unfence.value(),
                in_controlled_shutdown: BrokerShutdownChange::InControlledShutdown.value(),
                directories: vec![d2],
            })
            .into();
        manager.replay(&record, LogOffset::new(1)).expect("replays");

        assert!(manager.is_unfenced(NodeId::new(5)));
        assert!(manager.in_controlled_shutdown(NodeId::new(5)));
        assert!(!manager.is_active(NodeId::new(5)));
        assert_eq!(manager.directory_owner(d1), None);
        assert_eq!(manager.directory_owner(d2), Some(NodeId::new(5)));
    }

    #[test]
    fn conflicting_directory_claims_are_fatal_at_replay() {
        let mut manager = manager_at(MetadataVersion::LATEST);
        let d1 = directory(1001);
        manager
            .replay(&registration_record(7, 0x7, 10, &[d1]), LogOffset::new(0))
            .expect("registration replays");

        let fault = manager
            .replay(&registration_record(8, 0x8, 10, &[d1]), LogOffset::new(1))
            .unwrap_err();
        assert!(matches!(
            fault,
            ReplayFault::DirectoryAlreadyAssigned { owner, .. } if owner == NodeId::new(7)
        ));
    }

    #[test]
    fn default_directory_resolution() {
        let mut manager = manager_at(MetadataVersion::LATEST);
        assert_eq!(
            manager.default_directory(NodeId::new(9)),
            DirectoryId::UNASSIGNED
        );

        manager
            .replay(&registration_record(5, 0xa, 10, &[]), LogOffset::new(0))
            .expect("registration replays");
        assert_eq!(
            manager.default_directory(NodeId::new(5)),
            DirectoryId::MIGRATING
        );

        let d1 = directory(1001);
        manager
            .replay(&registration_record(6, 0xb, 10, &[d1]), LogOffset::new(1))
            .expect("registration replays");
        assert_eq!(manager.default_directory(NodeId::new(6)), d1);

        manager
            .replay(
                &registration_record(7, 0xc, 10, &[directory(1002), directory(1003)]),
                LogOffset::new(2),
            )
            .expect("registration replays");
        assert_eq!(
            manager.default_directory(NodeId::new(7)),
            DirectoryId::UNASSIGNED
        );

        assert!(manager.has_online_directory(NodeId::new(6), d1));
        assert!(manager.has_online_directory(NodeId::new(5), d1));
        assert!(!manager.has_online_directory(NodeId::new(7), d1));
    }

    #[test]
    fn broker_epoch_checks() {
        let mut manager = manager_at(MetadataVersion::LATEST);
        manager
            .replay(
                &registration_record(5, 0xa, 10, &[directory(1001)]),
                LogOffset::new(0),
            )
            .expect("registration replays");

        assert_eq!(
            manager.check_broker_epoch(NodeId::new(5), BrokerEpoch::new(10)),
            Ok(())
        );
        assert_eq!(
            manager.check_broker_epoch(NodeId::new(5), BrokerEpoch::new(9)),
            Err(RegistrationError::StaleBrokerEpoch {
                expected: BrokerEpoch::new(10),
                actual: BrokerEpoch::new(9),
            })
        );
        assert_eq!(
            manager.check_broker_epoch(NodeId::new(6), BrokerEpoch::new(10)),
            Err(RegistrationError::BrokerIdNotRegistered(NodeId::new(6)))
        );
    }

    #[test]
    fn point_in_time_reads_follow_the_replay_cursor() {
        let mut manager = manager_at(MetadataVersion::LATEST);
        manager
            .replay(
                &registration_record(5, 0xa, 10, &[directory(1001)]),
                LogOffset::new(5),
            )
            .expect("registration replays");
        manager
            .replay(&unfence_record(5, 10), LogOffset::new(9))
            .expect("unfence replays");

        assert!(manager
            .registration_at(NodeId::new(5), LogOffset::new(4))
            .is_none());
        assert!(manager
            .registration_at(NodeId::new(5), LogOffset::new(5))
            .unwrap()
            .fenced);
        assert!(!manager
            .registration_at(NodeId::new(5), LogOffset::new(9))
            .unwrap()
            .fenced);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn usable_brokers_reflect_registrations() {
        let mut manager = active_manager();
        register(&mut manager, 1000, 0xa, &[directory(2001)], 0);

        let brokers: Vec<_> = manager.usable_brokers().expect("active").collect();
        assert_eq!(brokers.len(), 1);
        assert_eq!(brokers[0].id, NodeId::new(1000));
        assert_eq!(brokers[0].rack.as_deref(), Some("rack-a"));
        assert!(brokers[0].fenced);

        manager.deactivate();
        assert!(manager.usable_brokers().is_err());

        // reactivation seeds the tracker from durable state
        manager.activate();
        assert_eq!(manager.usable_brokers().expect("active").count(), 1);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn unclean_shutdown_cleanup_precedes_the_registration() {
        let options = Options {
            cluster_id: "test-cluster".to_owned(),
            ..Options::default()
        };
        let mut manager = ClusterControlManager::new(
            options,
            Arc::new(StaticFeatureControl {
                metadata_version: MetadataVersion::LATEST,
                pre_migration: false,
            }),
            Arc::new(NoPlacement),
            Box::new(|broker_id: NodeId, records: &mut Vec<ControlRecord>| {
                records.push(
                    RecordPayload::BrokerUnregistered(BrokerUnregistrationRecord {
                        broker_id,
                        broker_epoch: BrokerEpoch::INITIAL,
                    })
                    .into(),
                );
            }),
        );
        manager.activate();

        let result = manager
            .register_broker(
                &request(5, 0xa, &[directory(1001)]),
                NEW_EPOCH,
                &finalized_features(),
            )
            .expect("accepted");
        assert!(matches!(
            result.records[0].payload,
            RecordPayload::BrokerUnregistered(_)
        ));
        assert!(matches!(
            result.records[1].payload,
            RecordPayload::BrokerRegistered(_)
        ));
    }
}
