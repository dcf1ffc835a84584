use super::codex::{Codex, CodexStatus};
use super::manifest::{CodexSource, HookBinding, HookManifest};
use super::validate_hook_name;
use crate::codex::{CodexHost, DEFAULT_MAX_NESTING};
use crate::core::{Entity, KernelError, Result, Value};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{Level, event, info_span};

/// Built-in behavior for a hook point that has no codex bound.
pub type DefaultHookHandler =
    Arc<dyn Fn(&mut dyn CodexHost, Option<&Entity>, &Value) -> Result<Value> + Send + Sync>;

type HookKey = (String, String);

#[derive(Debug, Clone, PartialEq, Eq)]
struct BindingEntry {
    codex_id: String,
    mandatory: bool,
}

#[derive(Debug, Clone)]
pub struct CodexRef {
    pub codex: Arc<Codex>,
    pub mandatory: bool,
}

/// Result of a hook lookup.
#[derive(Clone)]
pub enum HookResolution {
    /// Built-in logic, if any was registered for the hook point.
    Default(Option<DefaultHookHandler>),
    Codex(CodexRef),
}

impl HookResolution {
    pub fn is_default(&self) -> bool {
        matches!(self, Self::Default(_))
    }

    pub fn codex(&self) -> Option<&CodexRef> {
        match self {
            Self::Codex(codex_ref) => Some(codex_ref),
            Self::Default(_) => None,
        }
    }
}

impl fmt::Debug for HookResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default(handler) => f
                .debug_tuple("Default")
                .field(&handler.as_ref().map(|_| "<handler>"))
                .finish(),
            Self::Codex(codex_ref) => f.debug_tuple("Codex").field(&codex_ref.codex.id).finish(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallReport {
    pub codexes_installed: usize,
    pub codexes_replaced: usize,
    pub bindings_installed: usize,
    pub bindings_replaced: usize,
}

/// Index of hook points to codexes and built-in handlers.
///
/// At most one codex is bound per `(entity_kind, hook_name)`, and a codex is
/// bound to at most one hook point.
pub struct HookRegistry {
    codexes: HashMap<String, Arc<Codex>>,
    bindings: BTreeMap<HookKey, BindingEntry>,
    defaults: HashMap<HookKey, DefaultHookHandler>,
    max_nesting: usize,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            codexes: HashMap::new(),
            bindings: BTreeMap::new(),
            defaults: HashMap::new(),
            max_nesting: DEFAULT_MAX_NESTING,
        }
    }

    pub fn with_max_nesting(mut self, max_nesting: usize) -> Self {
        self.max_nesting = max_nesting;
        self
    }

    /// Validates the whole manifest, then applies it. Nothing changes when
    /// any entry is rejected.
    pub fn install(&mut self, manifest: HookManifest) -> Result<InstallReport> {
        let span = info_span!(
            "hook_install",
            codexes = manifest.codexes.len(),
            bindings = manifest.bindings.len()
        );
        let _enter = span.enter();

        let mut staged: HashMap<String, Codex> = HashMap::new();
        for source in &manifest.codexes {
            if staged.contains_key(&source.id) {
                return Err(KernelError::InvalidArgument(format!(
                    "codex '{}' appears twice in the manifest",
                    source.id
                )));
            }
            let codex = Codex::compile_with_limit(
                source.id.clone(),
                source.source.clone(),
                source.permissions.clone(),
                self.max_nesting,
            )?
            .with_status(source.status);
            staged.insert(source.id.clone(), codex);
        }

        let mut table = self.bindings.clone();
        let mut manifest_keys = HashSet::new();
        let mut report = InstallReport::default();
        for binding in &manifest.bindings {
            validate_hook_name(&binding.entity_kind, &binding.hook_name)?;
            if !staged.contains_key(&binding.codex_id) && !self.codexes.contains_key(&binding.codex_id) {
                return Err(KernelError::NotFound(format!("codex '{}'", binding.codex_id)));
            }
            let key = (binding.entity_kind.clone(), binding.hook_name.clone());
            if !manifest_keys.insert(key.clone()) {
                return Err(KernelError::InvalidArgument(format!(
                    "hook '{}' on kind '{}' is bound twice in the manifest",
                    binding.hook_name, binding.entity_kind
                )));
            }
            let entry = BindingEntry {
                codex_id: binding.codex_id.clone(),
                mandatory: binding.mandatory,
            };
            if table.insert(key, entry).is_some() {
                report.bindings_replaced += 1;
            } else {
                report.bindings_installed += 1;
            }
        }

        let mut bound: HashMap<&str, &HookKey> = HashMap::new();
        for (key, entry) in &table {
            if let Some(previous) = bound.insert(entry.codex_id.as_str(), key) {
                return Err(KernelError::InvalidArgument(format!(
                    "codex '{}' would be bound to both '{}' and '{}'",
                    entry.codex_id, previous.1, key.1
                )));
            }
        }

        for (id, codex) in staged {
            if self.codexes.insert(id, Arc::new(codex)).is_some() {
                report.codexes_replaced += 1;
            } else {
                report.codexes_installed += 1;
            }
        }
        self.bindings = table;
        self.sync_codex_bindings();

        event!(
            Level::INFO,
            codexes_installed = report.codexes_installed,
            codexes_replaced = report.codexes_replaced,
            bindings_installed = report.bindings_installed,
            bindings_replaced = report.bindings_replaced,
            "hook manifest installed"
        );
        Ok(report)
    }

    pub fn install_codex(&mut self, source: CodexSource) -> Result<InstallReport> {
        self.install(HookManifest::new().with_codex(source))
    }

    pub fn bind(&mut self, binding: HookBinding) -> Result<InstallReport> {
        self.install(HookManifest::new().with_binding(binding))
    }

    /// Removes a binding; the hook point falls back to its default.
    pub fn unbind(&mut self, entity_kind: &str, hook_name: &str) -> Option<HookBinding> {
        let key = (entity_kind.to_string(), hook_name.to_string());
        let entry = self.bindings.remove(&key)?;
        self.sync_codex_bindings();
        Some(HookBinding {
            entity_kind: key.0,
            hook_name: key.1,
            codex_id: entry.codex_id,
            mandatory: entry.mandatory,
        })
    }

    pub fn set_status(&mut self, codex_id: &str, status: CodexStatus) -> Result<()> {
        let codex = self
            .codexes
            .get_mut(codex_id)
            .ok_or_else(|| KernelError::NotFound(format!("codex '{}'", codex_id)))?;
        if codex.status != status {
            *codex = Arc::new((**codex).clone().with_status(status));
            event!(Level::INFO, codex_id = %codex_id, status = ?status, "codex status changed");
        }
        Ok(())
    }

    pub fn codex(&self, codex_id: &str) -> Result<Arc<Codex>> {
        self.codexes
            .get(codex_id)
            .cloned()
            .ok_or_else(|| KernelError::NotFound(format!("codex '{}'", codex_id)))
    }

    pub fn codexes(&self) -> Vec<Arc<Codex>> {
        let mut codexes: Vec<Arc<Codex>> = self.codexes.values().cloned().collect();
        codexes.sort_by(|a, b| a.id.cmp(&b.id));
        codexes
    }

    pub fn bindings(&self) -> Vec<HookBinding> {
        self.bindings
            .iter()
            .map(|((kind, hook), entry)| HookBinding {
                entity_kind: kind.clone(),
                hook_name: hook.clone(),
                codex_id: entry.codex_id.clone(),
                mandatory: entry.mandatory,
            })
            .collect()
    }

    pub fn register_default(
        &mut self,
        entity_kind: &str,
        hook_name: &str,
        handler: DefaultHookHandler,
    ) -> Result<()> {
        validate_hook_name(entity_kind, hook_name)?;
        self.defaults
            .insert((entity_kind.to_string(), hook_name.to_string()), handler);
        Ok(())
    }

    /// Pure lookup. A disabled codex resolves to the default behavior.
    pub fn resolve(&self, entity_kind: &str, hook_name: &str) -> HookResolution {
        let key = (entity_kind.to_string(), hook_name.to_string());
        if let Some(entry) = self.bindings.get(&key)
            && let Some(codex) = self.codexes.get(&entry.codex_id)
            && codex.is_active()
        {
            return HookResolution::Codex(CodexRef {
                codex: Arc::clone(codex),
                mandatory: entry.mandatory,
            });
        }
        HookResolution::Default(self.defaults.get(&key).cloned())
    }

    /// Keeps each codex's `entity_kind`/`hook_name` in step with the table.
    fn sync_codex_bindings(&mut self) {
        let bound: HashMap<&str, &HookKey> = self
            .bindings
            .iter()
            .map(|(key, entry)| (entry.codex_id.as_str(), key))
            .collect();

        for (id, codex) in self.codexes.iter_mut() {
            let wanted = bound.get(id.as_str()).map(|(kind, hook)| (kind.clone(), hook.clone()));
            let current = codex.entity_kind.clone().zip(codex.hook_name.clone());
            if wanted != current {
                *codex = Arc::new((**codex).clone().with_binding(wanted));
            }
        }
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("codexes", &self.codexes.len())
            .field("bindings", &self.bindings.len())
            .field("defaults", &self.defaults.len())
            .finish()
    }
}
