//! Agent type and instance registry
//!
//! The registry maps agent type names to factories and agent ids to live
//! instances. Instances are created on first use and then reused for every
//! message addressed to the same id.

use agent_core::{Agent, AgentId, AgentInstance, AgentType, Error, Result, bind};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};
use tracing::{debug, info};

type Factory = Arc<dyn Fn(&AgentId) -> Arc<dyn AgentInstance> + Send + Sync>;

// One cell per id. The map lock is only held to find the cell; the factory
// runs inside `OnceLock::get_or_init`, which blocks other initializers of the
// same id and leaves other ids alone.
type InstanceCell = Arc<OnceLock<Arc<dyn AgentInstance>>>;

/// Registry for agent factories and the instances they produce
pub struct Registry {
    factories: RwLock<HashMap<String, Factory>>,
    instances: Mutex<HashMap<AgentId, InstanceCell>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
        }
    }
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for an agent type
    ///
    /// # Errors
    ///
    /// Returns `InvalidIdentifier` if the name is not a valid agent type and
    /// `DuplicateRegistration` if it is already registered.
    pub fn register<A, F>(&self, agent_type: impl Into<String>, factory: F) -> Result<AgentType>
    where
        A: Agent,
        F: Fn(&AgentId) -> A + Send + Sync + 'static,
    {
        let agent_type = AgentType::new(agent_type)?;
        let mut factories = self.factories.write().unwrap_or_else(PoisonError::into_inner);
        if factories.contains_key(agent_type.as_str()) {
            return Err(Error::DuplicateRegistration(agent_type.to_string()));
        }

        let factory: Factory = Arc::new(move |id: &AgentId| bind(id.clone(), factory(id)));
        factories.insert(agent_type.to_string(), factory);
        info!("Registered agent type '{}'", agent_type);
        Ok(agent_type)
    }

    /// Remove an agent type and evict all of its instances
    ///
    /// Returns the number of evicted instances.
    ///
    /// # Errors
    ///
    /// Returns `UnknownAgentType` if the type is not registered.
    pub fn unregister(&self, agent_type: &str) -> Result<usize> {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(agent_type)
            .ok_or_else(|| Error::UnknownAgentType(agent_type.to_string()))?;

        let mut instances = self.lock_instances();
        let before = instances.len();
        instances.retain(|id, _| id.agent_type() != agent_type);
        let evicted = before - instances.len();
        info!(
            "Unregistered agent type '{}' ({} instances evicted)",
            agent_type, evicted
        );
        Ok(evicted)
    }

    /// Check whether a factory is registered for the type
    pub fn is_registered(&self, agent_type: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(agent_type)
    }

    /// Names of all registered agent types, sorted
    pub fn agent_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Get the instance for an id, creating it on first use
    ///
    /// Concurrent first calls for the same id construct exactly one instance.
    ///
    /// # Errors
    ///
    /// Returns `UnknownAgentType` if no factory is registered for the id's
    /// type. Nothing is cached in that case.
    pub fn get_or_create(&self, id: &AgentId) -> Result<Arc<dyn AgentInstance>> {
        let factory = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id.agent_type())
            .cloned()
            .ok_or_else(|| Error::UnknownAgentType(id.agent_type().to_string()))?;

        let cell = self.lock_instances().entry(id.clone()).or_default().clone();

        let mut created = false;
        let instance = cell.get_or_init(|| {
            created = true;
            factory(id)
        });
        if created {
            debug!("Created agent instance {}", id);
        }
        Ok(instance.clone())
    }

    /// Get the instance for an id if it has been created
    pub fn get(&self, id: &AgentId) -> Option<Arc<dyn AgentInstance>> {
        self.lock_instances()
            .get(id)
            .and_then(|cell| cell.get())
            .cloned()
    }

    /// Evict one instance; the next message to its id creates a new one
    pub fn remove(&self, id: &AgentId) -> bool {
        let removed = self.lock_instances().remove(id).is_some();
        if removed {
            debug!("Evicted agent instance {}", id);
        }
        removed
    }

    /// Ids of all live instances, sorted
    pub fn agent_ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self
            .lock_instances()
            .iter()
            .filter(|(_, cell)| cell.get().is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Number of live instances
    pub fn len(&self) -> usize {
        self.lock_instances()
            .values()
            .filter(|cell| cell.get().is_some())
            .count()
    }

    /// Check if no instance is live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_instances(&self) -> MutexGuard<'_, HashMap<AgentId, InstanceCell>> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::Handlers;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    struct Echo;

    impl Agent for Echo {
        fn handlers(&self) -> Handlers<Self> {
            Handlers::new().on(|_agent, message: String, _ctx| async move { Ok(message) })
        }
    }

    fn id(ty: &str, key: &str) -> AgentId {
        AgentId::new(ty, key).unwrap()
    }

    fn counting_registry() -> (Registry, Arc<AtomicUsize>) {
        let registry = Registry::new();
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        registry
            .register("echo", move |_id: &AgentId| {
                counter.fetch_add(1, Ordering::SeqCst);
                Echo
            })
            .unwrap();
        (registry, created)
    }

    #[test]
    fn test_duplicate_registration() {
        let (registry, _) = counting_registry();
        let result = registry.register("echo", |_id: &AgentId| Echo);
        assert!(matches!(result, Err(Error::DuplicateRegistration(name)) if name == "echo"));
        assert_eq!(registry.agent_types(), vec!["echo".to_string()]);
    }

    #[test]
    fn test_invalid_type_name() {
        let registry = Registry::new();
        assert!(matches!(
            registry.register("a/b", |_id: &AgentId| Echo),
            Err(Error::InvalidIdentifier { .. })
        ));
        assert!(!registry.is_registered("a/b"));
    }

    #[test]
    fn test_identity_is_stable() {
        let (registry, created) = counting_registry();
        let first = registry.get_or_create(&id("echo", "a")).unwrap();
        let second = registry.get_or_create(&id("echo", "a")).unwrap();
        let other = registry.get_or_create(&id("echo", "b")).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(first.id(), &id("echo", "a"));
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(registry.agent_ids(), vec![id("echo", "a"), id("echo", "b")]);
    }

    #[test]
    fn test_unknown_type_creates_nothing() {
        let (registry, created) = counting_registry();
        let result = registry.get_or_create(&id("missing", "a"));

        assert!(matches!(result, Err(Error::UnknownAgentType(name)) if name == "missing"));
        assert!(registry.get(&id("missing", "a")).is_none());
        assert!(registry.is_empty());
        assert_eq!(created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_concurrent_first_access_constructs_once() {
        let (registry, created) = counting_registry();
        let barrier = Barrier::new(8);
        let target = id("echo", "shared");

        let instances: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        registry.get_or_create(&target).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(instances.iter().all(|i| Arc::ptr_eq(i, &instances[0])));
    }

    #[test]
    fn test_unregister_evicts_instances() {
        let (registry, created) = counting_registry();
        registry.get_or_create(&id("echo", "a")).unwrap();
        registry.get_or_create(&id("echo", "b")).unwrap();

        assert_eq!(registry.unregister("echo").unwrap(), 2);
        assert!(registry.is_empty());
        assert!(!registry.is_registered("echo"));
        assert!(matches!(
            registry.unregister("echo"),
            Err(Error::UnknownAgentType(_))
        ));
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_remove_recreates_on_next_use() {
        let (registry, created) = counting_registry();
        let first = registry.get_or_create(&id("echo", "a")).unwrap();

        assert!(registry.remove(&id("echo", "a")));
        assert!(!registry.remove(&id("echo", "a")));

        let second = registry.get_or_create(&id("echo", "a")).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }
}
