//! Creates [`Context`]s bound to schemas resolved through a [`SchemaRegistry`].
//!
//! `create_context` hands out an owned, freshly constructed `Context` every
//! time. `get_thread_local_context` instead keeps one `Context` per
//! `(factory instance, thread, provider)` triple alive for reuse — handy for
//! request handlers that want a warm per-thread conversation slot without
//! wiring one through explicitly.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::context::{Context, ContextConfig};
use crate::error::Error;
use crate::registry::SchemaRegistry;

static NEXT_FACTORY_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_CONTEXTS: RefCell<HashMap<(u64, String), Rc<RefCell<Context>>>> =
        RefCell::new(HashMap::new());
}

/// Builds [`Context`]s for a fixed [`SchemaRegistry`] and [`ContextConfig`].
#[derive(Debug)]
pub struct ContextFactory {
    id: u64,
    registry: Arc<SchemaRegistry>,
    config: ContextConfig,
    alive: Arc<AtomicBool>,
}

impl ContextFactory {
    /// Create a factory that resolves providers through `registry`, applying
    /// `config` to every `Context` it hands out.
    pub fn new(registry: Arc<SchemaRegistry>, config: ContextConfig) -> Self {
        Self {
            id: NEXT_FACTORY_ID.fetch_add(1, Ordering::Relaxed),
            registry,
            config,
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Load `provider`'s schema and construct a fresh, independently owned
    /// `Context` bound to it.
    pub fn create_context(&self, provider: &str) -> Result<Context, Error> {
        let schema = self.registry.load(provider)?;
        Ok(Context::new(schema, self.config.clone())?)
    }

    /// Return this thread's cached `Context` for `provider`, creating one on
    /// first access. The same `Rc<RefCell<Context>>` is returned to every
    /// caller on this thread using this factory instance for this provider.
    pub fn get_thread_local_context(&self, provider: &str) -> Result<Rc<RefCell<Context>>, Error> {
        let key = (self.id, provider.to_string());
        if let Some(existing) = THREAD_CONTEXTS.with(|cell| cell.borrow().get(&key).cloned()) {
            return Ok(existing);
        }

        let context = self.create_context(provider)?;
        let rc = Rc::new(RefCell::new(context));
        THREAD_CONTEXTS.with(|cell| {
            cell.borrow_mut().insert(key, Rc::clone(&rc));
        });
        Ok(rc)
    }

    /// Whether this factory is still alive (not yet dropped). Exposed mainly
    /// for diagnostics; a dropped factory can't be called anyway.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }
}

impl Drop for ContextFactory {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Relaxed);
        // Reap this factory's entries from the calling thread's cache. Entries
        // left behind in other threads are bounded and harmless: each thread's
        // map is torn down by the standard thread_local Drop glue at thread exit.
        THREAD_CONTEXTS.with(|cell| {
            cell.borrow_mut().retain(|(factory_id, _), _| *factory_id != self.id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaDoc;
    use std::path::Path;

    fn write_schema(dir: &Path, name: &str) {
        let contents = format!(
            r#"{{
                "provider": {{ "name": "{name}" }},
                "api": {{ "endpoint": "https://example.com", "method": "POST" }},
                "authentication": {{ "type": "header", "key_name": "Authorization", "key_prefix": "Bearer " }},
                "request_template": {{ "model": "m", "messages": [] }},
                "message_roles": ["user", "assistant"],
                "message_format": {{
                    "structure": {{ "role": "<ROLE>", "content": "<TEXT_CONTENT>" }},
                    "content_types": {{ "text": "<TEXT_CONTENT>" }}
                }},
                "response_format": {{ "success": {{ "text_path": ["text"] }} }}
            }}"#
        );
        std::fs::write(dir.join(format!("{name}.json")), contents).unwrap();
    }

    struct TempDir(std::path::PathBuf);
    impl TempDir {
        fn new() -> Self {
            let mut path = std::env::temp_dir();
            path.push(format!(
                "context-factory-test-{}-{}",
                std::process::id(),
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap()
                    .as_nanos()
            ));
            std::fs::create_dir_all(&path).unwrap();
            TempDir(path)
        }
        fn path(&self) -> &Path {
            &self.0
        }
    }
    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    fn registry_with(name: &str) -> (Arc<SchemaRegistry>, TempDir) {
        let dir = TempDir::new();
        write_schema(dir.path(), name);
        let registry = SchemaRegistry::new();
        registry.set_directory(dir.path());
        (Arc::new(registry), dir)
    }

    #[test]
    fn create_context_returns_independent_instances() {
        let (registry, _dir) = registry_with("prov");
        let factory = ContextFactory::new(registry, ContextConfig::default());
        let a = factory.create_context("prov").unwrap();
        let mut b = factory.create_context("prov").unwrap();
        b.set_model("other").unwrap();
        assert_ne!(a.model(), b.model());
    }

    #[test]
    fn thread_local_context_is_reused_within_same_factory() {
        let (registry, _dir) = registry_with("prov");
        let factory = ContextFactory::new(registry, ContextConfig::default());
        let a = factory.get_thread_local_context("prov").unwrap();
        let b = factory.get_thread_local_context("prov").unwrap();
        assert!(Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn different_factories_get_different_thread_local_contexts() {
        let (registry, _dir) = registry_with("prov");
        let factory_one = ContextFactory::new(Arc::clone(&registry), ContextConfig::default());
        let factory_two = ContextFactory::new(registry, ContextConfig::default());

        let a = factory_one.get_thread_local_context("prov").unwrap();
        let b = factory_two.get_thread_local_context("prov").unwrap();
        assert!(!Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn dropping_a_factory_does_not_disturb_another_factorys_cache() {
        let (registry, _dir) = registry_with("prov");
        let factory_one = ContextFactory::new(Arc::clone(&registry), ContextConfig::default());
        let factory_two = ContextFactory::new(registry, ContextConfig::default());

        let _a = factory_one.get_thread_local_context("prov").unwrap();
        let b_first = factory_two.get_thread_local_context("prov").unwrap();

        drop(factory_one);

        let b_second = factory_two.get_thread_local_context("prov").unwrap();
        assert!(Rc::ptr_eq(&b_first, &b_second));
    }
}
