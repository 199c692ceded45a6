use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use trellis_core::error::{DefinitionError, Result, TrellisError};

use super::definition::PlaybookDefinition;

/// Name → definition map. Built once at startup, then shared read-only.
#[derive(Debug, Default, Clone)]
pub struct PlaybookRegistry {
    playbooks: BTreeMap<String, Arc<PlaybookDefinition>>,
}

impl PlaybookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one definition. Names are unique.
    pub fn insert(&mut self, def: PlaybookDefinition) -> std::result::Result<(), DefinitionError> {
        if self.playbooks.contains_key(&def.name) {
            return Err(DefinitionError::DuplicatePlaybook(def.name));
        }
        self.playbooks.insert(def.name.clone(), Arc::new(def));
        Ok(())
    }

    /// Build a registry and check every cross-playbook link.
    pub fn from_definitions(
        defs: impl IntoIterator<Item = PlaybookDefinition>,
    ) -> std::result::Result<Self, DefinitionError> {
        let mut registry = Self::new();
        for def in defs {
            registry.insert(def)?;
        }
        registry.validate_links()?;
        Ok(registry)
    }

    /// Load every `.json` and `.toml` file in a directory, in name order.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && matches!(p.extension().and_then(|e| e.to_str()), Some("json" | "toml"))
            })
            .collect();
        paths.sort();

        let mut defs = Vec::with_capacity(paths.len());
        for path in &paths {
            match PlaybookDefinition::from_path(path) {
                Ok(def) => defs.push(def),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Rejected playbook");
                    return Err(e.into());
                }
            }
        }
        let registry = Self::from_definitions(defs)?;
        info!(dir = %dir.display(), count = registry.len(), "Loaded playbooks");
        Ok(registry)
    }

    /// Every `invoke` must name a registered playbook and bind exactly its
    /// declared parameters.
    pub fn validate_links(&self) -> std::result::Result<(), DefinitionError> {
        for def in self.playbooks.values() {
            for (node, invoke) in def.invocations() {
                let callee = self.playbooks.get(&invoke.playbook).ok_or_else(|| {
                    DefinitionError::UnknownCallee {
                        playbook: def.name.clone(),
                        node: node.id.clone(),
                        callee: invoke.playbook.clone(),
                    }
                })?;
                if let Err(reason) = check_arguments(callee, invoke.args.keys().map(String::as_str)) {
                    return Err(DefinitionError::ArgumentMismatch {
                        playbook: def.name.clone(),
                        node: node.id.clone(),
                        callee: callee.name.clone(),
                        reason,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<PlaybookDefinition>> {
        self.playbooks.get(name).cloned()
    }

    pub fn require(&self, name: &str) -> Result<Arc<PlaybookDefinition>> {
        self.get(name)
            .ok_or_else(|| TrellisError::PlaybookNotFound(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.playbooks.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.playbooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.playbooks.is_empty()
    }
}

/// Compare supplied argument names against a callee's declared parameters.
/// All declared parameters are required; nothing else is accepted.
pub fn check_arguments<'a>(
    callee: &PlaybookDefinition,
    supplied: impl IntoIterator<Item = &'a str>,
) -> std::result::Result<(), String> {
    let supplied: BTreeSet<&str> = supplied.into_iter().collect();
    let declared: BTreeSet<&str> = callee.param_names().collect();

    let unknown: Vec<&str> = supplied.difference(&declared).copied().collect();
    if !unknown.is_empty() {
        return Err(format!("unknown argument(s): {}", unknown.join(", ")));
    }
    let missing: Vec<&str> = declared.difference(&supplied).copied().collect();
    if !missing.is_empty() {
        return Err(format!("missing argument(s): {}", missing.join(", ")));
    }
    Ok(())
}
