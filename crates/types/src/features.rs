// Copyright (c) 2023 - 2025 Tidelog Software, Inc.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Feature levels negotiated between nodes and the controller quorum.

use std::collections::BTreeMap;
use std::fmt;

/// Name of the platform-version feature every node implicitly negotiates.
pub const METADATA_VERSION_FEATURE_NAME: &str = "metadata.version";

/// Feature names the controller itself knows about. Nodes may declare other
/// names; those are logged, not rejected.
pub const PRODUCTION_FEATURE_NAMES: &[&str] = &[METADATA_VERSION_FEATURE_NAME];

/// Finalized level of a single feature.
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
pub struct FeatureLevel(u16);

impl FeatureLevel {
    pub const fn new(level: u16) -> Self {
        Self(level)
    }
}

/// Inclusive `[min, max]` range of feature levels a node supports.
#[derive(Debug, Clone, Copy, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct VersionRange {
    pub min: FeatureLevel,
    pub max: FeatureLevel,
}

impl VersionRange {
    pub const fn of(min: u16, max: u16) -> Self {
        Self {
            min: FeatureLevel::new(min),
            max: FeatureLevel::new(max),
        }
    }

    pub fn contains(&self, level: FeatureLevel) -> bool {
        self.min <= level && level <= self.max
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

/// The finalized platform metadata version, expressed as the feature level of
/// [`METADATA_VERSION_FEATURE_NAME`]. Capability gates compare against the
/// level that introduced them.
#[derive(
    Debug,
    Clone,
    Copy,
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
pub struct MetadataVersion(FeatureLevel);

impl MetadataVersion {
    /// The oldest level the platform still speaks. Nodes that do not declare
    /// the platform-version feature are assumed to support only this level.
    pub const MINIMUM: MetadataVersion = MetadataVersion::new(1);

    /// First level where legacy-protocol migration is possible.
    pub const MIGRATION: MetadataVersion = MetadataVersion::new(4);

    /// First level where controllers register themselves through the log.
    pub const CONTROLLER_REGISTRATION: MetadataVersion = MetadataVersion::new(5);

    /// First level where brokers must declare their storage directories.
    pub const DIRECTORY_ASSIGNMENT: MetadataVersion = MetadataVersion::new(7);

    pub const LATEST: MetadataVersion = MetadataVersion::new(7);

    pub const fn new(level: u16) -> Self {
        Self(FeatureLevel::new(level))
    }

    pub const fn level(self) -> FeatureLevel {
        self.0
    }

    pub fn is_migration_supported(self) -> bool {
        self >= Self::MIGRATION
    }

    pub fn is_controller_registration_supported(self) -> bool {
        self >= Self::CONTROLLER_REGISTRATION
    }

    pub fn is_directory_assignment_supported(self) -> bool {
        self >= Self::DIRECTORY_ASSIGNMENT
    }
}

/// Snapshot of the cluster's finalized feature levels, taken at a committed
/// log offset by the feature-control collaborator.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FinalizedFeatures {
    pub metadata_version: MetadataVersion,
    pub finalized: BTreeMap<String, FeatureLevel>,
}

impl FinalizedFeatures {
    pub fn new(metadata_version: MetadataVersion) -> Self {
        let mut finalized = BTreeMap::new();
        finalized.insert(
            METADATA_VERSION_FEATURE_NAME.to_owned(),
            metadata_version.level(),
        );
        Self {
            metadata_version,
            finalized,
        }
    }

    pub fn with_feature(mut self, name: impl Into<String>, level: FeatureLevel) -> Self {
        self.finalized.insert(name.into(), level);
        self
    }

    pub fn version_or_default(&self, name: &str, default: FeatureLevel) -> FeatureLevel {
        self.finalized.get(name).copied().unwrap_or(default)
    }
}
