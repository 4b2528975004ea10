//! Static audit of migration fixtures.
//!
//! Every registered migration version must have at least one before/after
//! fixture, and every fixture must hold: running its single step on `before`
//! yields exactly `after`. The audit only looks at the registry, never at
//! stored documents, so it can run in CI or from the CLI before deployment.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::MigrationRegistry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationFixture {
    pub collection: String,
    pub version: u32,
    pub before: Value,
    pub after: Value,
}

impl MigrationFixture {
    pub fn new(collection: impl Into<String>, version: u32, before: Value, after: Value) -> Self {
        Self {
            collection: collection.into(),
            version,
            before,
            after,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FixtureFailure {
    pub collection: String,
    pub version: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditReport {
    /// Fixtures that ran and matched.
    pub passed: usize,
    /// Registered `(collection, version)` pairs without any fixture.
    pub missing: Vec<(String, u32)>,
    pub failures: Vec<FixtureFailure>,
    /// Fixtures naming a migration that is not registered.
    pub orphaned: Vec<(String, u32)>,
}

impl AuditReport {
    pub fn is_success(&self) -> bool {
        self.missing.is_empty() && self.failures.is_empty() && self.orphaned.is_empty()
    }
}

impl fmt::Display for AuditReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} fixture(s) passed", self.passed)?;
        for (collection, version) in &self.missing {
            writeln!(f, "missing fixture: {collection} migration {version}")?;
        }
        for failure in &self.failures {
            writeln!(
                f,
                "failed fixture: {} migration {}: {}",
                failure.collection, failure.version, failure.reason
            )?;
        }
        for (collection, version) in &self.orphaned {
            writeln!(f, "fixture for unregistered migration: {collection} {version}")?;
        }
        Ok(())
    }
}

pub fn audit(registry: &MigrationRegistry, fixtures: &[MigrationFixture]) -> AuditReport {
    let mut report = AuditReport::default();

    let covered: BTreeSet<(&str, u32)> = fixtures
        .iter()
        .map(|f| (f.collection.as_str(), f.version))
        .collect();
    for collection in registry.collections() {
        for m in registry.migrations(collection) {
            if !covered.contains(&(collection, m.version())) {
                report.missing.push((collection.to_string(), m.version()));
            }
        }
    }

    for fixture in fixtures {
        let registered = fixture.version >= 1
            && fixture.version <= registry.latest_version(&fixture.collection);
        if !registered {
            report
                .orphaned
                .push((fixture.collection.clone(), fixture.version));
            continue;
        }
        match registry.migrate_step(&fixture.collection, fixture.version, fixture.before.clone()) {
            Ok(out) if out == fixture.after => report.passed += 1,
            Ok(out) => report.failures.push(FixtureFailure {
                collection: fixture.collection.clone(),
                version: fixture.version,
                reason: format!("expected {}, got {}", fixture.after, out),
            }),
            Err(e) => report.failures.push(FixtureFailure {
                collection: fixture.collection.clone(),
                version: fixture.version,
                reason: e.to_string(),
            }),
        }
    }

    report
}
