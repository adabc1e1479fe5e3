//! Named collection of state systems.

use crate::error::{Result, StateSystemError};
use crate::state_system::{StateSystem, StateSystemReader};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Owns the state systems of an application, keyed by ssid.
///
/// Systems removed from the registry are disposed.
#[derive(Default)]
pub struct StateSystemRegistry {
    systems: RwLock<HashMap<String, Arc<StateSystem>>>,
}

impl StateSystemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `ss` under its ssid. Fails if the id is taken.
    pub fn register(&self, ss: Arc<StateSystem>) -> Result<()> {
        let mut systems = self.systems.write();
        let id = ss.ssid().to_string();
        if systems.contains_key(&id) {
            return Err(StateSystemError::InvalidArgument(format!(
                "state system {} already registered",
                id
            )));
        }
        debug!(ssid = %id, "state system registered");
        systems.insert(id, ss);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<StateSystem>> {
        self.systems.read().get(id).cloned()
    }

    /// Remove and dispose a state system. Returns whether it was present.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.systems.write().remove(id);
        match removed {
            Some(ss) => {
                ss.dispose();
                true
            }
            None => false,
        }
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.systems.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.systems.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.systems.read().is_empty()
    }

    /// Dispose and forget every registered state system.
    pub fn dispose_all(&self) {
        let systems: Vec<_> = self.systems.write().drain().map(|(_, ss)| ss).collect();
        for ss in systems {
            ss.dispose();
        }
    }
}
