use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::SyncError;

/// One read-time transform, lifting a payload from `from_version` to
/// `from_version + 1`. Transforms must be pure; a failing transform aborts
/// the load and leaves the stored record untouched.
pub type MigrationFn = Arc<dyn Fn(Value) -> Result<Value, SyncError> + Send + Sync>;

/// Ordered set of migration steps for one dataset, keyed by the version a
/// step migrates *from*.
#[derive(Clone, Default)]
pub struct MigrationRegistry {
    steps: BTreeMap<u32, MigrationFn>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the step from `from_version` to `from_version + 1`.
    ///
    /// Registering the same version twice replaces the earlier step (with a
    /// warning): migrations are wired up once at startup, and the latest
    /// registration is taken as the corrected one.
    pub fn register<F>(&mut self, from_version: u32, step: F)
    where
        F: Fn(Value) -> Result<Value, SyncError> + Send + Sync + 'static,
    {
        if self.steps.insert(from_version, Arc::new(step)).is_some() {
            tracing::warn!(from_version, "migration step replaced by later registration");
        }
    }

    /// The consecutive steps needed to lift a payload from `from` up to
    /// `to`. Fails closed: any gap in the chain yields
    /// [`SyncError::MigrationMissing`] and nothing is migrated.
    pub fn plan(&self, from: u32, to: u32) -> Result<Vec<MigrationFn>, SyncError> {
        let mut chain = Vec::with_capacity((to.saturating_sub(from)) as usize);
        for version in from..to {
            match self.steps.get(&version) {
                Some(step) => chain.push(step.clone()),
                None => {
                    return Err(SyncError::MigrationMissing {
                        from_version: version,
                        current_version: to,
                    })
                }
            }
        }
        Ok(chain)
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl fmt::Debug for MigrationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationRegistry")
            .field("from_versions", &self.steps.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plan_applies_steps_in_order() {
        let mut reg = MigrationRegistry::new();
        reg.register(1, |v| Ok(json!({ "v1": v })));
        reg.register(2, |v| Ok(json!({ "v2": v })));

        let chain = reg.plan(1, 3).unwrap();
        assert_eq!(chain.len(), 2);

        let mut value = json!("seed");
        for step in &chain {
            value = step(value).unwrap();
        }
        assert_eq!(value, json!({ "v2": { "v1": "seed" } }));
    }

    #[test]
    fn plan_with_gap_fails_closed() {
        let mut reg = MigrationRegistry::new();
        reg.register(1, Ok);
        // No step from version 2.
        reg.register(3, Ok);

        let err = reg.plan(1, 4).err().unwrap();
        assert!(matches!(
            err,
            SyncError::MigrationMissing {
                from_version: 2,
                current_version: 4,
            }
        ));
    }

    #[test]
    fn plan_for_current_version_is_empty() {
        let reg = MigrationRegistry::new();
        assert!(reg.plan(3, 3).unwrap().is_empty());
    }

    #[test]
    fn later_registration_wins() {
        let mut reg = MigrationRegistry::new();
        reg.register(1, |_| Ok(json!("first")));
        reg.register(1, |_| Ok(json!("second")));

        let chain = reg.plan(1, 2).unwrap();
        assert_eq!(chain[0](json!(null)).unwrap(), json!("second"));
    }

    #[test]
    fn failing_step_surfaces_its_error() {
        let mut reg = MigrationRegistry::new();
        reg.register(1, |_| Err(SyncError::Deserialization("not a v1 payload".into())));

        let chain = reg.plan(1, 2).unwrap();
        assert!(matches!(
            chain[0](json!(null)),
            Err(SyncError::Deserialization(_))
        ));
    }
}
