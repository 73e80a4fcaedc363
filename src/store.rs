//! Template persistence
//!
//! Stores own the id assignment and turn embedded background bytes into a
//! stable reference before any geometry is written.

use semver::Version;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

use crate::hashing::background_key;
use crate::templates::{BackgroundImage, Template, TemplateId};
use crate::SCHEMA_VERSION;

const TEMPLATES_DIR: &str = "templates";
const BACKGROUNDS_DIR: &str = "backgrounds";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Persistence failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("Persistence failure: malformed record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Template not found: {0}")]
    NotFound(String),

    #[error("Template {id} uses schema {found}, this build supports up to {supported}")]
    Incompatible {
        id: String,
        found: String,
        supported: String,
    },

    #[error("Invalid template id: {0}")]
    InvalidId(String),

    #[error("Invalid background reference: {0}")]
    InvalidReference(String),
}

pub trait TemplateStore {
    fn load_all(&self) -> Result<Vec<Template>, StoreError>;

    fn get(&self, id: &str) -> Result<Template, StoreError> {
        self.load_all()?
            .into_iter()
            .find(|t| t.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Create when `id` is empty, update otherwise. Returns the stored form.
    fn save(&mut self, template: &Template) -> Result<Template, StoreError>;

    fn delete(&mut self, id: &str) -> Result<(), StoreError>;

    /// Bytes behind a background reference produced by `save`.
    fn fetch_background(&self, reference: &str) -> Result<Vec<u8>, StoreError>;
}

/// Refuse records written by a newer schema than this build understands.
pub fn check_schema(template: &Template) -> Result<(), StoreError> {
    let incompatible = || StoreError::Incompatible {
        id: template.id.clone(),
        found: template.schema_version.clone(),
        supported: SCHEMA_VERSION.to_string(),
    };
    let supported = Version::parse(SCHEMA_VERSION).map_err(|_| incompatible())?;
    let found = Version::parse(&template.schema_version).map_err(|_| incompatible())?;
    if found > supported {
        return Err(incompatible());
    }
    Ok(())
}

fn background_extension(data: &[u8]) -> &'static str {
    image::guess_format(data)
        .ok()
        .and_then(|f| f.extensions_str().first().copied())
        .unwrap_or("jpg")
}

fn valid_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// JSON records on disk, backgrounds content-addressed next to them.
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(root.join(TEMPLATES_DIR))?;
        fs::create_dir_all(root.join(BACKGROUNDS_DIR))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        if !valid_id(id) {
            return Err(StoreError::InvalidId(id.to_string()));
        }
        Ok(self.root.join(TEMPLATES_DIR).join(format!("{}.json", id)))
    }

    fn store_background(&self, data: &[u8]) -> Result<String, StoreError> {
        let reference = format!(
            "{}/{}.{}",
            BACKGROUNDS_DIR,
            background_key(data),
            background_extension(data)
        );
        let path = self.root.join(&reference);
        if !path.exists() {
            fs::write(&path, data)?;
            log::info!("stored background {} ({} bytes)", reference, data.len());
        }
        Ok(reference)
    }
}

impl TemplateStore for DirectoryStore {
    fn load_all(&self) -> Result<Vec<Template>, StoreError> {
        let mut templates = vec![];
        for entry in fs::read_dir(self.root.join(TEMPLATES_DIR))? {
            let path = entry?.path();
            if path.extension().map_or(true, |e| e != "json") {
                continue;
            }
            let parsed = fs::read_to_string(&path)
                .map_err(StoreError::from)
                .and_then(|content| Ok(serde_json::from_str::<Template>(&content)?));
            match parsed.and_then(|t| check_schema(&t).map(|_| t)) {
                Ok(template) => templates.push(template),
                Err(e) => log::warn!("skipping {}: {}", path.display(), e),
            }
        }
        templates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(templates)
    }

    fn get(&self, id: &str) -> Result<Template, StoreError> {
        let path = self.record_path(id)?;
        if !path.exists() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        let template: Template = serde_json::from_str(&fs::read_to_string(path)?)?;
        check_schema(&template)?;
        Ok(template)
    }

    fn save(&mut self, template: &Template) -> Result<Template, StoreError> {
        let mut stored = template.clone();
        if stored.is_persisted() {
            if !self.record_path(&stored.id)?.exists() {
                return Err(StoreError::NotFound(stored.id));
            }
        } else {
            stored.id = Uuid::new_v4().to_string();
        }

        if let BackgroundImage::Embedded { data, .. } = &stored.background {
            stored.background = BackgroundImage::Url(self.store_background(data)?);
        }

        let path = self.record_path(&stored.id)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&stored)?)?;
        fs::rename(&tmp, &path)?;
        log::info!(
            "saved template '{}' ({}) with {} slots",
            stored.name,
            stored.id,
            stored.slots.len()
        );
        Ok(stored)
    }

    fn delete(&mut self, id: &str) -> Result<(), StoreError> {
        let path = self.record_path(id)?;
        if !path.exists() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        // Backgrounds may be shared between templates and are left in place.
        fs::remove_file(path)?;
        log::info!("deleted template {}", id);
        Ok(())
    }

    fn fetch_background(&self, reference: &str) -> Result<Vec<u8>, StoreError> {
        let name = reference
            .strip_prefix(BACKGROUNDS_DIR)
            .and_then(|r| r.strip_prefix('/'))
            .filter(|n| !n.is_empty() && !n.contains('/') && !n.contains(".."))
            .ok_or_else(|| StoreError::InvalidReference(reference.to_string()))?;
        Ok(fs::read(self.root.join(BACKGROUNDS_DIR).join(name))?)
    }
}

/// In-process store; backgrounds resolve to `memory://<sha256>`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    templates: HashMap<TemplateId, Template>,
    backgrounds: HashMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl TemplateStore for MemoryStore {
    fn load_all(&self) -> Result<Vec<Template>, StoreError> {
        let mut all: Vec<_> = self.templates.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(all)
    }

    fn get(&self, id: &str) -> Result<Template, StoreError> {
        self.templates
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn save(&mut self, template: &Template) -> Result<Template, StoreError> {
        let mut stored = template.clone();
        if stored.is_persisted() {
            if !self.templates.contains_key(&stored.id) {
                return Err(StoreError::NotFound(stored.id));
            }
        } else {
            stored.id = Uuid::new_v4().to_string();
        }
        if let BackgroundImage::Embedded { data, .. } = &stored.background {
            let reference = format!("memory://{}", background_key(data));
            self.backgrounds.insert(reference.clone(), data.clone());
            stored.background = BackgroundImage::Url(reference);
        }
        self.templates.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    fn delete(&mut self, id: &str) -> Result<(), StoreError> {
        self.templates
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn fetch_background(&self, reference: &str) -> Result<Vec<u8>, StoreError> {
        self.backgrounds
            .get(reference)
            .cloned()
            .ok_or_else(|| StoreError::InvalidReference(reference.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::PhotoSlot;

    fn template(bg: BackgroundImage) -> Template {
        Template {
            id: String::new(),
            name: "Strip".into(),
            created_at: chrono::Utc::now(),
            schema_version: SCHEMA_VERSION.into(),
            width: 576,
            height: 800,
            background: bg,
            slots: vec![PhotoSlot {
                id: "s1".into(),
                sequence: 1,
                x: 10,
                y: 20,
                width: 100,
                height: 50,
                rotation: 0,
            }],
        }
    }

    #[test]
    fn test_directory_store_create_resolves_background() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DirectoryStore::open(dir.path()).unwrap();
        let saved = store.save(&template(BackgroundImage::embedded(b"raw-bytes".to_vec()))).unwrap();

        assert!(saved.is_persisted());
        let BackgroundImage::Url(reference) = &saved.background else {
            panic!("background was not resolved");
        };
        assert!(reference.starts_with("backgrounds/"));
        assert_eq!(store.fetch_background(reference).unwrap(), b"raw-bytes");
        assert_eq!(store.load_all().unwrap(), vec![saved.clone()]);
        assert_eq!(store.get(&saved.id).unwrap(), saved);
    }

    #[test]
    fn test_update_keeps_id_and_unknown_update_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DirectoryStore::open(dir.path()).unwrap();
        let mut saved = store.save(&template(BackgroundImage::Url("backgrounds/x.jpg".into()))).unwrap();
        saved.name = "Renamed".into();
        let updated = store.save(&saved).unwrap();
        assert_eq!(updated.id, saved.id);
        assert_eq!(store.load_all().unwrap().len(), 1);

        let mut ghost = saved.clone();
        ghost.id = "does-not-exist".into();
        assert!(matches!(store.save(&ghost), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_delete_and_missing_delete() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DirectoryStore::open(dir.path()).unwrap();
        let saved = store.save(&template(BackgroundImage::Url("backgrounds/x.jpg".into()))).unwrap();
        store.delete(&saved.id).unwrap();
        assert!(store.load_all().unwrap().is_empty());
        assert!(matches!(store.delete(&saved.id), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_newer_schema_and_garbage_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DirectoryStore::open(dir.path()).unwrap();
        let mut future = store.save(&template(BackgroundImage::Url("backgrounds/x.jpg".into()))).unwrap();
        future.schema_version = "9.0.0".into();
        let path = dir.path().join("templates").join(format!("{}.json", future.id));
        fs::write(&path, serde_json::to_string(&future).unwrap()).unwrap();
        fs::write(dir.path().join("templates").join("broken.json"), "{").unwrap();

        assert!(store.load_all().unwrap().is_empty());
        assert!(matches!(store.get(&future.id), Err(StoreError::Incompatible { .. })));
    }

    #[test]
    fn test_path_traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DirectoryStore::open(dir.path()).unwrap();
        assert!(matches!(store.delete("../etc"), Err(StoreError::InvalidId(_))));
        assert!(matches!(
            store.fetch_background("backgrounds/../templates/a.json"),
            Err(StoreError::InvalidReference(_))
        ));
    }

    #[test]
    fn test_memory_store_round_trip() {
        let mut store = MemoryStore::new();
        let saved = store.save(&template(BackgroundImage::embedded(vec![9, 9]))).unwrap();
        let BackgroundImage::Url(reference) = &saved.background else {
            panic!("background was not resolved");
        };
        assert_eq!(store.fetch_background(reference).unwrap(), vec![9, 9]);
        assert_eq!(store.get(&saved.id).unwrap(), saved);
        store.delete(&saved.id).unwrap();
        assert!(store.is_empty());
    }
}
