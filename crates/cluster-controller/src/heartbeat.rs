// Copyright (c) 2023 - 2025 Tidelog Software, Inc.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Liveness sessions of registered brokers.
//!
//! The heartbeat manager is a derived, timer-driven view over the durable
//! registrations; it is never the source of truth. It only exists while the
//! controller is active, since only the leader processes heartbeats, and is
//! rebuilt from durable state on every leadership transition.

use std::time::Duration;

use ahash::HashMap;
use tokio::time::Instant;
use tracing::trace;

use tidelog_types::NodeId;

use crate::placement::UsableBroker;

#[derive(Debug, Clone)]
struct BrokerSession {
    last_contact: Instant,
    fenced: bool,
}

#[derive(Debug)]
pub struct BrokerHeartbeatManager {
    session_timeout: Duration,
    sessions: HashMap<NodeId, BrokerSession>,
}

impl BrokerHeartbeatManager {
    pub fn new(session_timeout: Duration) -> Self {
        Self {
            session_timeout,
            sessions: HashMap::default(),
        }
    }

    /// Starts (or restarts) tracking a broker. The session begins valid;
    /// expiry is measured from now.
    pub fn register(&mut self, broker_id: NodeId, fenced: bool) {
        trace!(%broker_id, fenced, "registering broker session");
        self.sessions.insert(
            broker_id,
            BrokerSession {
                last_contact: Instant::now(),
                fenced,
            },
        );
    }

    pub fn remove(&mut self, broker_id: NodeId) {
        trace!(%broker_id, "removing broker session");
        self.sessions.remove(&broker_id);
    }

    /// Refreshes the session on an incoming heartbeat.
    pub fn touch(&mut self, broker_id: NodeId) {
        if let Some(session) = self.sessions.get_mut(&broker_id) {
            session.last_contact = Instant::now();
        }
    }

    pub fn has_valid_session(&self, broker_id: NodeId) -> bool {
        self.sessions
            .get(&broker_id)
            .is_some_and(|session| session.last_contact.elapsed() < self.session_timeout)
    }

    /// Iterates over every tracked broker, resolving racks through
    /// `rack_lookup`. Placement logic downstream decides how to use the
    /// fenced ones.
    pub fn usable_brokers<'a>(
        &'a self,
        rack_lookup: impl Fn(NodeId) -> Option<String> + 'a,
    ) -> impl Iterator<Item = UsableBroker> + 'a {
        self.sessions.iter().map(move |(id, session)| UsableBroker {
            id: *id,
            rack: rack_lookup(*id),
            fenced: session.fenced,
        })
    }
}
