//! Loads, validates, and caches [`SchemaDoc`]s by provider name.
//!
//! Publication is the only mutation the registry ever performs: once a
//! schema is cached it is handed out as an immutable `Arc` and never
//! touched again, so concurrent readers need no locking once a load has
//! completed.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, instrument, warn};

use crate::error::SchemaError;
use crate::schema::SchemaDoc;

/// Provider name -> `SchemaDoc` registry with lazy loading and an explicit
/// registration override.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    directory: RwLock<Option<PathBuf>>,
    registrations: RwLock<HashMap<String, PathBuf>>,
    cache: RwLock<HashMap<String, Arc<SchemaDoc>>>,
}

impl SchemaRegistry {
    /// Create an empty registry with no directory or registrations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the fallback lookup directory; a trailing separator is appended
    /// if absent so `resolve_path` can join file names directly.
    pub fn set_directory(&self, path: impl AsRef<Path>) {
        let mut dir = path.as_ref().to_string_lossy().into_owned();
        if !dir.is_empty() && !dir.ends_with(std::path::MAIN_SEPARATOR) {
            dir.push(std::path::MAIN_SEPARATOR);
        }
        *self.directory.write() = Some(PathBuf::from(dir));
    }

    /// Associate an explicit schema file path with a provider name. This
    /// takes priority over directory lookup for that name.
    pub fn register(&self, name: impl Into<String>, path: impl AsRef<Path>) {
        self.registrations
            .write()
            .insert(name.into(), path.as_ref().to_path_buf());
    }

    /// Resolve the path that would be read for `name`: the explicit
    /// registration first, otherwise `<directory>/<name>.json`.
    fn resolve_path(&self, name: &str) -> Option<PathBuf> {
        if let Some(path) = self.registrations.read().get(name) {
            return Some(path.clone());
        }
        self.directory
            .read()
            .as_ref()
            .map(|dir| dir.join(format!("{name}.json")))
    }

    /// Union of registered provider names (whose file exists) and `.json`
    /// files in the configured directory, each name appearing once.
    pub fn list_providers(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();

        for (name, path) in self.registrations.read().iter() {
            if path.exists() {
                names.push(name.clone());
            }
        }

        if let Some(dir) = self.directory.read().as_ref() {
            if let Ok(entries) = fs::read_dir(dir) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) == Some("json") {
                        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                            if !names.iter().any(|n| n == stem) {
                                names.push(stem.to_string());
                            }
                        }
                    }
                }
            }
        }

        names.sort();
        names
    }

    /// Whether a schema file for `name` can currently be resolved and read.
    pub fn is_available(&self, name: &str) -> bool {
        self.resolve_path(name)
            .map(|p| p.exists())
            .unwrap_or(false)
    }

    /// Resolve, read, parse, validate, and cache the schema for `name`,
    /// returning the cached immutable handle. Subsequent calls for the same
    /// name return the same `Arc` without touching the filesystem again.
    #[instrument(skip(self))]
    pub fn load(&self, name: &str) -> Result<Arc<SchemaDoc>, SchemaError> {
        if let Some(doc) = self.cache.read().get(name) {
            debug!("schema cache hit for provider {name}");
            return Ok(Arc::clone(doc));
        }

        // Short critical section keyed by provider name: hold the cache's
        // write lock only across the actual publish, and re-check after
        // acquiring it in case a concurrent loader won the race.
        let path = self
            .resolve_path(name)
            .ok_or_else(|| SchemaError::NotFound(name.to_string()))?;

        if !path.exists() {
            return Err(SchemaError::NotFound(name.to_string()));
        }

        let text = fs::read_to_string(&path).map_err(|source| SchemaError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let doc = SchemaDoc::parse(name, &text)?;
        let doc = Arc::new(doc);

        let mut cache = self.cache.write();
        // Another thread may have published this provider while we were
        // reading and parsing; keep whichever was published first so every
        // caller observes the same Arc identity.
        let published = cache.entry(name.to_string()).or_insert_with(|| Arc::clone(&doc));
        let result = Arc::clone(published);
        drop(cache);

        if doc.provider.name != name {
            warn!(
                "schema file for provider key {name} declares provider.name {}",
                doc.provider.name
            );
        }

        debug!("loaded and cached schema for provider {name}");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_schema(dir: &Path, name: &str, endpoint: &str) {
        let contents = format!(
            r#"{{
                "provider": {{ "name": "{name}" }},
                "api": {{ "endpoint": "{endpoint}", "method": "POST" }},
                "authentication": {{ "type": "header", "key_name": "Authorization", "key_prefix": "Bearer " }},
                "request_template": {{ "model": "m", "messages": [] }},
                "message_roles": ["user", "assistant"],
                "message_format": {{
                    "structure": {{ "role": "<ROLE>", "content": "<TEXT_CONTENT>" }},
                    "content_types": {{ "text": "<TEXT_CONTENT>" }}
                }},
                "response_format": {{
                    "success": {{ "text_path": ["text"] }}
                }}
            }}"#
        );
        let mut f = fs::File::create(dir.join(format!("{name}.json"))).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn loads_from_directory_and_caches() {
        let dir = tempdir();
        write_schema(dir.path(), "testprov", "https://example.com/chat");

        let registry = SchemaRegistry::new();
        registry.set_directory(dir.path());

        assert!(registry.is_available("testprov"));
        assert!(!registry.is_available("missing"));

        let first = registry.load("testprov").unwrap();
        let second = registry.load("testprov").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn explicit_registration_overrides_directory() {
        let dir = tempdir();
        write_schema(dir.path(), "testprov", "https://from-directory.example.com");

        let override_dir = tempdir();
        write_schema(override_dir.path(), "testprov", "https://from-override.example.com");

        let registry = SchemaRegistry::new();
        registry.set_directory(dir.path());
        registry.register("testprov", override_dir.path().join("testprov.json"));

        let doc = registry.load("testprov").unwrap();
        assert_eq!(doc.api.endpoint, "https://from-override.example.com");
    }

    #[test]
    fn list_providers_unions_directory_and_registrations() {
        let dir = tempdir();
        write_schema(dir.path(), "alpha", "https://a.example.com");
        write_schema(dir.path(), "beta", "https://b.example.com");

        let other_dir = tempdir();
        write_schema(other_dir.path(), "gamma", "https://c.example.com");

        let registry = SchemaRegistry::new();
        registry.set_directory(dir.path());
        registry.register("gamma", other_dir.path().join("gamma.json"));

        let mut names = registry.list_providers();
        names.sort();
        assert_eq!(names, vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn missing_provider_is_not_found() {
        let registry = SchemaRegistry::new();
        let err = registry.load("nope").unwrap_err();
        assert!(matches!(err, SchemaError::NotFound(_)));
    }

    // Minimal self-contained temp-dir helper: the crate avoids a `tempfile`
    // dependency for this one test-only need by using std::env + a unique suffix.
    fn tempdir() -> TempDir {
        TempDir::new()
    }

    struct TempDir(PathBuf);

    impl TempDir {
        fn new() -> Self {
            let mut path = std::env::temp_dir();
            let unique = format!(
                "schema-registry-test-{}-{}",
                std::process::id(),
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap()
                    .as_nanos()
            );
            path.push(unique);
            fs::create_dir_all(&path).unwrap();
            TempDir(path)
        }

        fn path(&self) -> &Path {
            &self.0
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.0);
        }
    }
}
