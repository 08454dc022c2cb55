//! Hash-keyed program cache.

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::BytecodeError;
use crate::program::{Program, ProgramHash};

/// Thread-safe cache of compiled programs keyed by content hash.
///
/// Owned by the embedding application and passed to whatever needs it;
/// there is no process-wide instance.
#[derive(Debug, Default)]
pub struct ProgramCache {
    programs: DashMap<ProgramHash, Arc<Program>>,
}

impl ProgramCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            programs: DashMap::new(),
        }
    }

    /// Insert a program after checking its hash. Re-inserting an equal
    /// program returns the cached copy.
    pub fn insert(&self, program: Program) -> Result<Arc<Program>, BytecodeError> {
        program.verify_hash()?;
        let hash = program.hash().clone();
        let entry = self
            .programs
            .entry(hash.clone())
            .or_insert_with(|| Arc::new(program))
            .clone();
        tracing::debug!(hash = %hash.short(), "cached program");
        Ok(entry)
    }

    /// Look up a program by hash.
    #[must_use]
    pub fn get(&self, hash: &ProgramHash) -> Option<Arc<Program>> {
        self.programs.get(hash).map(|entry| entry.value().clone())
    }

    /// Whether a program is cached.
    #[must_use]
    pub fn contains(&self, hash: &ProgramHash) -> bool {
        self.programs.contains_key(hash)
    }

    /// Drop a program from the cache.
    pub fn remove(&self, hash: &ProgramHash) -> Option<Arc<Program>> {
        self.programs.remove(hash).map(|(_, v)| v)
    }

    /// Number of cached programs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.programs.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }
}
