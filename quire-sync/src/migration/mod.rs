//! Versioned document migrations.
//!
//! Each collection owns an ordered list of migrations numbered 1, 2, 3, ...
//! A document's `schema_version` records the highest migration applied to it;
//! loading a lagging document runs the missing steps once and persists the
//! result. The registry is validated when built, so a gap or a misordered
//! version stops the process before any document is served.
//!
//! An op written against an older shape is carried across a migration record
//! with [`Migration::migrate_op`] instead of being transformed over the
//! record's diff.

pub mod audit;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{MigrationConfigError, SyncError};
use crate::ot::{DocData, Operation};

/// One step upgrading a collection's document shape from `version - 1` to `version`.
pub trait Migration: Send + Sync {
    fn version(&self) -> u32;

    /// Pure transform of the document body.
    fn migrate(&self, data: Value) -> Result<Value, SyncError>;

    /// Rewrite an op written against the previous shape so it applies to
    /// the migrated one. `None` drops the op.
    fn migrate_op(&self, op: &Operation) -> Result<Option<Operation>, SyncError> {
        Ok(Some(op.clone()))
    }

    fn description(&self) -> &str {
        ""
    }
}

type OpRewrite = fn(&Operation) -> Result<Option<Operation>, SyncError>;

/// Migration backed by plain functions.
pub struct FnMigration {
    version: u32,
    description: &'static str,
    apply: fn(Value) -> Result<Value, SyncError>,
    rewrite_op: Option<OpRewrite>,
}

impl FnMigration {
    /// Also rewrite ops that predate this migration.
    pub fn with_op(mut self, rewrite_op: OpRewrite) -> Self {
        self.rewrite_op = Some(rewrite_op);
        self
    }

    pub fn into_arc(self) -> Arc<dyn Migration> {
        Arc::new(self)
    }
}

impl Migration for FnMigration {
    fn version(&self) -> u32 {
        self.version
    }

    fn migrate(&self, data: Value) -> Result<Value, SyncError> {
        (self.apply)(data)
    }

    fn migrate_op(&self, op: &Operation) -> Result<Option<Operation>, SyncError> {
        match self.rewrite_op {
            Some(rewrite) => rewrite(op),
            None => Ok(Some(op.clone())),
        }
    }

    fn description(&self) -> &str {
        self.description
    }
}

pub fn migration(
    version: u32,
    description: &'static str,
    apply: fn(Value) -> Result<Value, SyncError>,
) -> Arc<dyn Migration> {
    fn_migration(version, description, apply).into_arc()
}

/// Unboxed form of [`migration`], for attaching an op rewrite.
pub fn fn_migration(
    version: u32,
    description: &'static str,
    apply: fn(Value) -> Result<Value, SyncError>,
) -> FnMigration {
    FnMigration {
        version,
        description,
        apply,
        rewrite_op: None,
    }
}

/// Validated set of migrations for every collection.
#[derive(Clone, Default)]
pub struct MigrationRegistry {
    collections: BTreeMap<String, Vec<Arc<dyn Migration>>>,
}

impl std::fmt::Debug for MigrationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (name, list) in &self.collections {
            map.entry(name, &list.len());
        }
        map.finish()
    }
}

impl MigrationRegistry {
    pub fn builder() -> MigrationRegistryBuilder {
        MigrationRegistryBuilder::default()
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn collections(&self) -> impl Iterator<Item = &str> {
        self.collections.keys().map(String::as_str)
    }

    /// Registered migrations of `collection`, in version order.
    pub fn migrations(&self, collection: &str) -> &[Arc<dyn Migration>] {
        self.collections
            .get(collection)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Highest registered version, 0 when the collection never changed shape.
    pub fn latest_version(&self, collection: &str) -> u32 {
        self.migrations(collection).len() as u32
    }

    fn step(&self, collection: &str, version: u32) -> Result<&Arc<dyn Migration>, SyncError> {
        self.migrations(collection)
            .get((version as usize).wrapping_sub(1))
            .ok_or_else(|| SyncError::Migration(format!("{collection} has no migration {version}")))
    }

    /// Apply one step.
    pub fn migrate_step(&self, collection: &str, version: u32, data: Value) -> Result<Value, SyncError> {
        self.step(collection, version)?.migrate(data).map_err(|e| {
            SyncError::Migration(format!("{collection} migration {version}: {e}"))
        })
    }

    /// Carry an op from schema `from_version` to `to_version` through each
    /// step's [`Migration::migrate_op`]. `None` once any step drops it.
    pub fn migrate_op(
        &self,
        collection: &str,
        op: Operation,
        from_version: u32,
        to_version: u32,
    ) -> Result<Option<Operation>, SyncError> {
        let target = to_version.min(self.latest_version(collection));
        let mut op = op;
        for version in from_version + 1..=target {
            let rewritten = self.step(collection, version)?.migrate_op(&op).map_err(|e| {
                SyncError::Migration(format!("{collection} migration {version} op: {e}"))
            })?;
            match rewritten {
                Some(next) => op = next,
                None => return Ok(None),
            }
        }
        Ok(Some(op))
    }

    /// Apply every step after `from_version` up to the latest.
    pub fn migrate(&self, collection: &str, data: Value, from_version: u32) -> Result<(Value, u32), SyncError> {
        self.migrate_to(collection, data, from_version, self.latest_version(collection))
    }

    /// Apply steps `from_version + 1 ..= to_version`. Already-applied
    /// versions are skipped, so a document ahead of `to_version` is returned unchanged.
    pub fn migrate_to(
        &self,
        collection: &str,
        data: Value,
        from_version: u32,
        to_version: u32,
    ) -> Result<(Value, u32), SyncError> {
        let target = to_version.min(self.latest_version(collection));
        if from_version >= target {
            return Ok((data, from_version));
        }
        let mut data = data;
        for version in from_version + 1..=target {
            data = self.migrate_step(collection, version, data)?;
        }
        log::debug!("Migrated {collection} document from v{from_version} to v{target}");
        Ok((data, target))
    }

    /// [`migrate_to`](Self::migrate_to) over typed document content.
    pub fn migrate_doc(
        &self,
        collection: &str,
        data: &DocData,
        from_version: u32,
        to_version: u32,
    ) -> Result<(DocData, u32), SyncError> {
        let (value, reached) = self.migrate_to(collection, data.to_value(), from_version, to_version)?;
        if reached == from_version {
            return Ok((data.clone(), reached));
        }
        Ok((DocData::from_value(data.doc_type(), value)?, reached))
    }
}

#[derive(Default)]
pub struct MigrationRegistryBuilder {
    entries: Vec<(String, Vec<Arc<dyn Migration>>)>,
}

impl MigrationRegistryBuilder {
    pub fn collection(
        mut self,
        name: impl Into<String>,
        migrations: Vec<Arc<dyn Migration>>,
    ) -> Self {
        self.entries.push((name.into(), migrations));
        self
    }

    /// Validate ordering: versions start at 1 and increase by exactly one.
    pub fn build(self) -> Result<MigrationRegistry, MigrationConfigError> {
        let mut collections = BTreeMap::new();
        for (name, migrations) in self.entries {
            let mut previous = 0u32;
            for m in &migrations {
                let found = m.version();
                if previous == 0 && found != 1 {
                    return Err(MigrationConfigError::DoesNotStartAtOne {
                        collection: name,
                        found,
                    });
                }
                if previous != 0 && found != previous + 1 {
                    return Err(MigrationConfigError::OutOfSequence {
                        collection: name,
                        previous,
                        found,
                    });
                }
                previous = found;
            }
            if collections.insert(name.clone(), migrations).is_some() {
                return Err(MigrationConfigError::DuplicateCollection(name));
            }
        }
        Ok(MigrationRegistry { collections })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::json::path;
    use crate::ot::{JsonOp, PathSeg};
    use serde_json::json;

    fn add_field(mut data: Value) -> Result<Value, SyncError> {
        if let Some(obj) = data.as_object_mut() {
            obj.entry("editable").or_insert(json!(true));
        }
        Ok(data)
    }

    fn rename_title(mut data: Value) -> Result<Value, SyncError> {
        if let Some(obj) = data.as_object_mut() {
            if let Some(title) = obj.remove("title") {
                obj.insert("name".into(), title);
            }
        }
        Ok(data)
    }

    /// Ops touching `title` predate step 2 and are dropped.
    fn drop_title_ops(op: &Operation) -> Result<Option<Operation>, SyncError> {
        let Operation::Json(op) = op else {
            return Ok(Some(op.clone()));
        };
        let kept: Vec<_> = op
            .components()
            .iter()
            .filter(|c| c.path().first() != Some(&PathSeg::from("title")))
            .cloned()
            .collect();
        Ok((!kept.is_empty()).then(|| Operation::Json(JsonOp(kept))))
    }

    fn fail(_: Value) -> Result<Value, SyncError> {
        Err(SyncError::InvalidOp("bad shape".into()))
    }

    fn registry() -> MigrationRegistry {
        MigrationRegistry::builder()
            .collection(
                "projects",
                vec![migration(1, "add editable", add_field), migration(2, "rename title", rename_title)],
            )
            .collection("users", vec![])
            .build()
            .unwrap()
    }

    #[test]
    fn test_migrate_from_zero() {
        let reg = registry();
        let (data, to) = reg.migrate("projects", json!({"title": "A"}), 0).unwrap();
        assert_eq!(to, 2);
        assert_eq!(data, json!({"name": "A", "editable": true}));
    }

    #[test]
    fn test_migrate_skips_applied_versions() {
        let reg = registry();
        let (once, v1) = reg.migrate("projects", json!({"title": "A"}), 0).unwrap();
        let (twice, v2) = reg.migrate("projects", once.clone(), v1).unwrap();
        assert_eq!(once, twice);
        assert_eq!(v1, v2);

        // Document at v1 only gets step 2.
        let (data, _) = reg.migrate("projects", json!({"title": "B"}), 1).unwrap();
        assert_eq!(data, json!({"name": "B"}));
    }

    #[test]
    fn test_empty_and_unknown_collections() {
        let reg = registry();
        assert_eq!(reg.latest_version("users"), 0);
        assert_eq!(reg.latest_version("texts"), 0);
        let (data, to) = reg.migrate("texts", json!({"x": 1}), 0).unwrap();
        assert_eq!((data, to), (json!({"x": 1}), 0));
    }

    #[test]
    fn test_gap_is_config_error() {
        let err = MigrationRegistry::builder()
            .collection("widgets", vec![migration(1, "", add_field), migration(3, "", add_field)])
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            MigrationConfigError::OutOfSequence {
                collection: "widgets".into(),
                previous: 1,
                found: 3
            }
        );
    }

    #[test]
    fn test_bad_start_and_duplicates() {
        let err = MigrationRegistry::builder()
            .collection("widgets", vec![migration(2, "", add_field)])
            .build()
            .unwrap_err();
        assert!(matches!(err, MigrationConfigError::DoesNotStartAtOne { found: 2, .. }));

        let err = MigrationRegistry::builder()
            .collection("widgets", vec![migration(1, "", add_field), migration(1, "", add_field)])
            .build()
            .unwrap_err();
        assert!(matches!(err, MigrationConfigError::OutOfSequence { previous: 1, found: 1, .. }));

        let err = MigrationRegistry::builder()
            .collection("widgets", vec![])
            .collection("widgets", vec![])
            .build()
            .unwrap_err();
        assert_eq!(err, MigrationConfigError::DuplicateCollection("widgets".into()));
    }

    #[test]
    fn test_migrate_op_through_steps() {
        let reg = MigrationRegistry::builder()
            .collection(
                "projects",
                vec![
                    migration(1, "add editable", add_field),
                    fn_migration(2, "rename title", rename_title)
                        .with_op(drop_title_ops)
                        .into_arc(),
                ],
            )
            .build()
            .unwrap();
        let both = Operation::Json(
            JsonOp::new()
                .set(path(&["title"]), json!("T"))
                .set(path(&["editable"]), json!(false)),
        );

        // Step 1 has no rewrite, step 2 drops the title component.
        let migrated = reg.migrate_op("projects", both.clone(), 0, 2).unwrap();
        assert_eq!(
            migrated,
            Some(Operation::Json(JsonOp::new().set(path(&["editable"]), json!(false))))
        );
        let title_only = Operation::Json(JsonOp::new().set(path(&["title"]), json!("T")));
        assert_eq!(reg.migrate_op("projects", title_only, 1, 2).unwrap(), None);
        // Nothing to cross.
        assert_eq!(reg.migrate_op("projects", both.clone(), 2, 2).unwrap(), Some(both));
    }

    #[test]
    fn test_failing_step_reports_version() {
        let reg = MigrationRegistry::builder()
            .collection("widgets", vec![migration(1, "", add_field), migration(2, "", fail)])
            .build()
            .unwrap();
        let err = reg.migrate("widgets", json!({}), 0).unwrap_err();
        assert!(matches!(err, SyncError::Migration(msg) if msg.contains("migration 2")));
    }
}
