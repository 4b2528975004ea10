//! Revert documents to a historical version.
//!
//! A revert is an ordinary submit: the difference between the current data
//! and the (migrated) historical data is committed on top of the current
//! version, so it goes through access control, gets broadcast, and becomes
//! part of history like any other edit.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::document::OpKind;
use crate::error::SyncError;
use crate::migration::MigrationRegistry;
use crate::ot::Operation;
use crate::service::DocumentService;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevertTarget {
    pub collection: String,
    pub id: String,
    pub version: u64,
}

impl fmt::Display for RevertTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.collection, self.id, self.version)
    }
}

/// JSON list of `{collection, id, version}` entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevertManifest(pub Vec<RevertTarget>);

impl RevertManifest {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// What reverting one document would submit.
#[derive(Debug, Clone, PartialEq)]
pub struct RevertPlan {
    pub target: RevertTarget,
    /// Current version the change would be submitted against.
    pub base_version: u64,
    /// `None` when the document already matches the target.
    pub change: Option<OpKind>,
}

#[derive(Debug, Default)]
pub struct RevertSummary {
    /// Target and the version the revert committed.
    pub reverted: Vec<(RevertTarget, u64)>,
    pub unchanged: Vec<RevertTarget>,
    pub failed: Vec<(RevertTarget, SyncError)>,
}

impl RevertSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

impl fmt::Display for RevertSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} reverted, {} already current, {} failed",
            self.reverted.len(),
            self.unchanged.len(),
            self.failed.len()
        )
    }
}

pub struct SnapshotReverter<S> {
    service: S,
    registry: MigrationRegistry,
}

impl<S: DocumentService> SnapshotReverter<S> {
    pub fn new(service: S, registry: MigrationRegistry) -> Self {
        Self { service, registry }
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn into_service(self) -> S {
        self.service
    }

    pub async fn plan(&self, collection: &str, id: &str, version: u64) -> Result<RevertPlan, SyncError> {
        let historical = self.service.fetch_snapshot(collection, id, version).await?;
        let current = self.service.fetch(collection, id).await?;

        let schema_version = if current.exists() {
            current.schema_version
        } else {
            self.registry.latest_version(collection)
        };
        let target_data = match &historical.data {
            Some(data) => Some(
                self.registry
                    .migrate_doc(collection, data, historical.schema_version, schema_version)?
                    .0,
            ),
            None => None,
        };

        let change = match (target_data, &current.data) {
            (None, None) => None,
            (None, Some(_)) => Some(OpKind::Delete),
            (Some(data), None) => Some(OpKind::Create { data }),
            (Some(data), Some(now)) => {
                let op = Operation::diff(now, &data)?;
                (!op.is_noop()).then(|| OpKind::edit(op))
            }
        };
        Ok(RevertPlan {
            target: RevertTarget {
                collection: collection.to_string(),
                id: id.to_string(),
                version,
            },
            base_version: current.version,
            change,
        })
    }

    /// Revert one document. Returns the committed version, or `None` if the
    /// document already matched.
    pub async fn revert(&self, collection: &str, id: &str, version: u64) -> Result<Option<u64>, SyncError> {
        let plan = self.plan(collection, id, version).await?;
        let Some(change) = plan.change else {
            log::info!("{} already matches, nothing to revert", plan.target);
            return Ok(None);
        };
        let label = change.label();
        let committed = self
            .service
            .submit(collection, id, plan.base_version, change)
            .await?;
        log::info!("Reverted {} with {label} committed as v{committed}", plan.target);
        Ok(Some(committed))
    }

    /// Revert every entry, continuing past failures. With `dry_run` nothing
    /// is submitted and planned changes count as reverted at their base version.
    pub async fn revert_manifest(&self, manifest: &RevertManifest, dry_run: bool) -> RevertSummary {
        let mut summary = RevertSummary::default();
        for target in &manifest.0 {
            let result = if dry_run {
                self.plan(&target.collection, &target.id, target.version)
                    .await
                    .map(|plan| {
                        if let Some(change) = &plan.change {
                            log::info!("[dry run] {target}: would submit {} at v{}", change.label(), plan.base_version);
                        }
                        plan.change.map(|_| plan.base_version)
                    })
            } else {
                self.revert(&target.collection, &target.id, target.version).await
            };
            match result {
                Ok(Some(version)) => summary.reverted.push((target.clone(), version)),
                Ok(None) => summary.unchanged.push(target.clone()),
                Err(e) => {
                    log::error!("Failed to revert {target}: {e}");
                    summary.failed.push((target.clone(), e));
                }
            }
        }
        summary
    }
}
