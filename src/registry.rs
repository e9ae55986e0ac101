//! Command registry - the process-wide set of voice commands
//!
//! Screens register their commands when they gain focus and drop them when
//! they lose it. The registry is a cheap cloneable handle; every clone sees
//! the same mapping. Iteration follows registration order, and overwriting
//! an id keeps its original position.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tracing::debug;

use crate::fuzzy::normalize;

type ActionFn = dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// Zero-argument callback run when a command fires
///
/// Synchronous and asynchronous handlers are both stored as a boxed future
/// factory, so the dispatcher treats them the same way.
#[derive(Clone)]
pub struct CommandAction(Arc<ActionFn>);

impl CommandAction {
    /// Wrap a synchronous handler
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self(Arc::new(move || {
            let f = Arc::clone(&f);
            async move { f() }.boxed()
        }))
    }

    /// Wrap an asynchronous handler
    pub fn future<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self(Arc::new(move || f().boxed()))
    }

    /// Build the future for one invocation; nothing runs until it is polled
    pub fn invoke(&self) -> BoxFuture<'static, anyhow::Result<()>> {
        (self.0)()
    }
}

impl fmt::Debug for CommandAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CommandAction(..)")
    }
}

/// Trigger phrases, handler and optional spoken acknowledgment
#[derive(Clone, Debug)]
pub struct CommandDefinition {
    patterns: Vec<String>,
    normalized: Vec<String>,
    action: CommandAction,
    acknowledgment: Option<String>,
}

impl CommandDefinition {
    pub fn new<I, S>(patterns: I, action: CommandAction) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
        let normalized = patterns.iter().map(|p| normalize(p)).collect();
        Self {
            patterns,
            normalized,
            action,
            acknowledgment: None,
        }
    }

    /// Text spoken back when the command fires
    pub fn with_acknowledgment(mut self, text: impl Into<String>) -> Self {
        self.acknowledgment = Some(text.into());
        self
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Patterns in canonical form, index-aligned with [`Self::patterns`]
    pub fn normalized_patterns(&self) -> &[String] {
        &self.normalized
    }

    pub fn action(&self) -> &CommandAction {
        &self.action
    }

    /// Acknowledgment to speak, `None` when absent or empty
    pub fn acknowledgment(&self) -> Option<&str> {
        self.acknowledgment.as_deref().filter(|a| !a.trim().is_empty())
    }
}

pub(crate) struct Entry {
    pub(crate) id: String,
    pub(crate) definition: Arc<CommandDefinition>,
    token: u64,
}

#[derive(Default)]
struct Inner {
    entries: Vec<Entry>,
    next_token: u64,
}

/// Shared mapping from command id to definition
#[derive(Clone, Default)]
pub struct CommandRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a command, replacing any existing one with the same id
    pub fn register(&self, id: impl Into<String>, definition: CommandDefinition) {
        self.insert(id.into(), definition);
    }

    /// Insert and return the registration token
    fn insert(&self, id: String, definition: CommandDefinition) -> u64 {
        let mut inner = self.lock();
        inner.next_token += 1;
        let token = inner.next_token;
        let definition = Arc::new(definition);

        if let Some(entry) = inner.entries.iter_mut().find(|e| e.id == id) {
            debug!("Replacing voice command {}", id);
            entry.definition = definition;
            entry.token = token;
        } else {
            debug!("Registering voice command {}", id);
            inner.entries.push(Entry {
                id,
                definition,
                token,
            });
        }
        token
    }

    /// Remove a command; unknown ids are ignored
    pub fn unregister(&self, id: &str) {
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|e| e.id != id);
        if inner.entries.len() != before {
            debug!("Unregistered voice command {}", id);
        }
    }

    /// Remove a command only if it still holds the given registration
    fn unregister_token(&self, id: &str, token: u64) {
        let mut inner = self.lock();
        inner.entries.retain(|e| !(e.id == id && e.token == token));
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().entries.iter().any(|e| e.id == id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<CommandDefinition>> {
        self.lock()
            .entries
            .iter()
            .find(|e| e.id == id)
            .map(|e| Arc::clone(&e.definition))
    }

    /// Registered ids in scan order
    pub fn ids(&self) -> Vec<String> {
        self.lock().entries.iter().map(|e| e.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// Run `f` over the current entries while holding the lock, so no
    /// registration can interleave with a scan
    pub(crate) fn with_entries<R>(&self, f: impl FnOnce(&[Entry]) -> R) -> R {
        let inner = self.lock();
        f(&inner.entries)
    }

    /// Open a scope whose registrations are removed when it is dropped
    pub fn scope(&self, namespace: impl Into<String>) -> CommandScope {
        CommandScope {
            registry: self.clone(),
            namespace: namespace.into(),
            owned: Vec::new(),
        }
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("ids", &self.ids())
            .finish()
    }
}

/// Registrations owned by one screen, namespaced as `"{namespace}.{id}"`
///
/// Dropping the scope unregisters everything it registered, on every exit
/// path. A registration that another owner has since overwritten is left
/// alone.
pub struct CommandScope {
    registry: CommandRegistry,
    namespace: String,
    owned: Vec<(String, u64)>,
}

impl CommandScope {
    /// Register a command under this scope's namespace, returning the full id
    pub fn register(&mut self, id: &str, definition: CommandDefinition) -> String {
        let full_id = format!("{}.{}", self.namespace, id);
        let token = self.registry.insert(full_id.clone(), definition);
        match self.owned.iter_mut().find(|(owned, _)| *owned == full_id) {
            Some(slot) => slot.1 = token,
            None => self.owned.push((full_id.clone(), token)),
        }
        full_id
    }

    /// Drop one command early
    pub fn unregister(&mut self, id: &str) {
        let full_id = format!("{}.{}", self.namespace, id);
        if let Some(pos) = self.owned.iter().position(|(owned, _)| *owned == full_id) {
            let (full_id, token) = self.owned.remove(pos);
            self.registry.unregister_token(&full_id, token);
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Full ids currently owned by this scope
    pub fn ids(&self) -> Vec<String> {
        self.owned.iter().map(|(id, _)| id.clone()).collect()
    }
}

impl Drop for CommandScope {
    fn drop(&mut self) {
        for (id, token) in self.owned.drain(..) {
            self.registry.unregister_token(&id, token);
        }
        debug!("Released voice command scope {}", self.namespace);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> CommandAction {
        CommandAction::sync(|| Ok(()))
    }

    #[test]
    fn test_register_overwrites() {
        let registry = CommandRegistry::new();
        registry.register("x", CommandDefinition::new(["uno"], noop()));
        registry.register("x", CommandDefinition::new(["dos"], noop()));

        assert_eq!(registry.len(), 1);
        let def = registry.get("x").unwrap();
        assert_eq!(def.patterns(), &["dos".to_string()]);
    }

    #[test]
    fn test_overwrite_keeps_position() {
        let registry = CommandRegistry::new();
        registry.register("a", CommandDefinition::new(["uno"], noop()));
        registry.register("b", CommandDefinition::new(["dos"], noop()));
        registry.register("a", CommandDefinition::new(["tres"], noop()));
        assert_eq!(registry.ids(), vec!["a", "b"]);
    }

    #[test]
    fn test_unregister_unknown_is_noop() {
        let registry = CommandRegistry::new();
        registry.register("a", CommandDefinition::new(["uno"], noop()));
        registry.unregister("missing");
        assert_eq!(registry.ids(), vec!["a"]);
        registry.unregister("a");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_patterns_normalized_once() {
        let def = CommandDefinition::new(["Ver Camisetas!", "  Añadir  "], noop());
        assert_eq!(def.normalized_patterns(), &["ver camisetas", "anadir"]);
        assert_eq!(def.patterns()[0], "Ver Camisetas!");
    }

    #[test]
    fn test_empty_acknowledgment_is_silent() {
        let def = CommandDefinition::new(["uno"], noop()).with_acknowledgment("  ");
        assert_eq!(def.acknowledgment(), None);
        let def = CommandDefinition::new(["uno"], noop()).with_acknowledgment("Listo");
        assert_eq!(def.acknowledgment(), Some("Listo"));
    }

    #[test]
    fn test_scope_releases_on_drop() {
        let registry = CommandRegistry::new();
        {
            let mut scope = registry.scope("catalog");
            let id = scope.register("shirts", CommandDefinition::new(["camisetas"], noop()));
            assert_eq!(id, "catalog.shirts");
            assert!(registry.contains("catalog.shirts"));
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_scope_releases_on_error_path() {
        fn mount(registry: &CommandRegistry) -> anyhow::Result<()> {
            let mut scope = registry.scope("camera");
            scope.register("capture", CommandDefinition::new(["tomar foto"], noop()));
            anyhow::bail!("camera unavailable");
        }
        let registry = CommandRegistry::new();
        assert!(mount(&registry).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stale_scope_keeps_newer_registration() {
        let registry = CommandRegistry::new();
        let mut old = registry.scope("home");
        old.register("help", CommandDefinition::new(["ayuda"], noop()));

        // fast navigation: the new screen mounts before the old one tears down
        let mut new = registry.scope("home");
        new.register("help", CommandDefinition::new(["ayuda por favor"], noop()));

        drop(old);
        let def = registry.get("home.help").unwrap();
        assert_eq!(def.patterns(), &["ayuda por favor".to_string()]);

        drop(new);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_scope_unregister_single() {
        let registry = CommandRegistry::new();
        let mut scope = registry.scope("fav");
        scope.register("add", CommandDefinition::new(["guardar"], noop()));
        scope.register("list", CommandDefinition::new(["favoritos"], noop()));
        scope.unregister("add");
        assert_eq!(registry.ids(), vec!["fav.list"]);
        assert_eq!(scope.ids(), vec!["fav.list"]);
    }
}
