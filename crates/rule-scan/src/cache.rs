//! Single-generation rule-set cache keyed by source modification time.

use std::sync::Arc;
use std::time::SystemTime;

use crate::compile::{CompileError, RuleSet};

/// Retains at most one compiled [`RuleSet`] -- the generation built from
/// the most recently seen source timestamp. A successful compile for a new
/// timestamp evicts the previous generation; a failed compile leaves it in
/// force.
#[derive(Default)]
pub struct RuleSetCache {
    current: Option<Arc<RuleSet>>,
    compiles: u64,
}

impl RuleSetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached set when `mtime` matches the current generation,
    /// otherwise compile `source` and make the result the sole cached
    /// entry.
    pub fn get_or_compile(
        &mut self,
        source: &str,
        mtime: SystemTime,
    ) -> Result<Arc<RuleSet>, CompileError> {
        if let Some(current) = &self.current {
            if current.mtime() == mtime {
                return Ok(Arc::clone(current));
            }
        }

        self.compiles += 1;
        let set = Arc::new(RuleSet::compile(source, mtime)?);
        self.current = Some(Arc::clone(&set));
        Ok(set)
    }

    /// The generation currently held, if any.
    pub fn current(&self) -> Option<Arc<RuleSet>> {
        self.current.clone()
    }

    /// How many compile attempts have run (successful or not). Used by
    /// tests to verify that unchanged sources are not recompiled.
    pub fn compile_count(&self) -> u64 {
        self.compiles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const RULES: &str = r#"
version: "1.0"
rules:
  - name: "r1"
    tags: [log]
    patterns: ["x"]
"#;

    const MORE_RULES: &str = r#"
version: "1.0"
rules:
  - name: "r1"
    tags: [log]
    patterns: ["x"]
  - name: "r2"
    tags: [warn]
    patterns: ["y"]
"#;

    #[test]
    fn unchanged_mtime_does_not_recompile() {
        let mut cache = RuleSetCache::new();
        let t0 = SystemTime::UNIX_EPOCH;

        let a = cache.get_or_compile(RULES, t0).unwrap();
        let b = cache.get_or_compile(RULES, t0).unwrap();

        assert_eq!(cache.compile_count(), 1);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn new_mtime_recompiles_and_evicts_the_old_generation() {
        let mut cache = RuleSetCache::new();
        let t0 = SystemTime::UNIX_EPOCH;
        let t1 = t0 + Duration::from_secs(1);

        let old = cache.get_or_compile(RULES, t0).unwrap();
        let new = cache.get_or_compile(MORE_RULES, t1).unwrap();

        assert_eq!(cache.compile_count(), 2);
        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(new.len(), 2);

        // The old generation is gone: asking for its timestamp compiles
        // again rather than finding a retained entry.
        cache.get_or_compile(RULES, t0).unwrap();
        assert_eq!(cache.compile_count(), 3);
    }

    #[test]
    fn failed_compile_keeps_the_previous_generation() {
        let mut cache = RuleSetCache::new();
        let t0 = SystemTime::UNIX_EPOCH;
        let t1 = t0 + Duration::from_secs(1);

        let old = cache.get_or_compile(RULES, t0).unwrap();
        let err = cache.get_or_compile(": broken [", t1);
        assert!(err.is_err());

        let retained = cache.current().expect("previous generation retained");
        assert!(Arc::ptr_eq(&old, &retained));

        // The old timestamp still hits the cache.
        let again = cache.get_or_compile(RULES, t0).unwrap();
        assert!(Arc::ptr_eq(&old, &again));
        assert_eq!(cache.compile_count(), 2);
    }

    #[test]
    fn empty_cache_has_no_current_generation() {
        let cache = RuleSetCache::new();
        assert!(cache.current().is_none());
        assert_eq!(cache.compile_count(), 0);
    }
}
