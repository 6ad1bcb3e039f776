// Copyright (c) 2023 - 2025 Tidelog Software, Inc.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::time::Duration;

use tidelog_types::NodeId;

/// # Cluster controller options
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, derive_builder::Builder)]
#[builder(default)]
pub struct Options {
    /// The id of the cluster this controller manages. Registration requests
    /// citing any other cluster id are rejected.
    pub cluster_id: String,

    /// How long a broker's liveness session lasts without contact before the
    /// broker is considered for fencing.
    #[serde(with = "serde_with::As::<serde_with::DisplayFromStr>")]
    pub session_timeout: humantime::Duration,

    /// Whether brokers still running the legacy protocol may register while
    /// their metadata is being migrated.
    pub legacy_migration_enabled: bool,

    /// The static controller-quorum voters. Only used to compute the highest
    /// controller id, which new broker ids must stay above.
    pub quorum_voters: Vec<NodeId>,
}

impl Options {
    pub fn session_timeout(&self) -> Duration {
        self.session_timeout.into()
    }
}

impl Default for Options {
    fn default() -> Self {
        Options {
            cluster_id: "Unspecified".to_owned(),
            session_timeout: Duration::from_secs(9).into(),
            legacy_migration_enabled: false,
            quorum_voters: Vec::new(),
        }
    }
}
