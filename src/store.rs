use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::config::Config;
use crate::error::{Result, WreckitError};
use crate::item::{id_ordinal, id_section, is_valid_id, slugify, Item, ItemState, Phase, Prd};
use crate::lock::{self, LockGuard};

pub const STORE_DIR: &str = ".wreckit";

// Artifact file names, owned by the item directory that contains them.
pub const RESEARCH_MD: &str = "research.md";
pub const PLAN_MD: &str = "plan.md";
pub const PRD_JSON: &str = "prd.json";
pub const PROGRESS_LOG: &str = "progress.log";
pub const CRITIQUE_MD: &str = "critique.md";
pub const ITEM_JSON: &str = "item.json";

const ITEM_LOCK: &str = ".lock";
const INDEX_LOCK: &str = ".index.lock";
const HEALING_LOG: &str = "healing-log.jsonl";

// --- Index ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct IndexEntry {
    pub state: ItemState,
    pub section: String,
    pub title: String,
}

/// Repository-wide item registry: an authoritative cache for enumerating
/// items without scanning every directory. May lag slightly behind the item
/// records (doctor reconciles drift); must never be internally corrupt.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct Index {
    #[serde(default)]
    pub items: BTreeMap<String, IndexEntry>,
}

// --- Store ---

/// All persistent state lives under `<root>/.wreckit/`.
#[derive(Debug)]
pub struct Store {
    root: PathBuf,
    lock_timeout: Duration,
}

impl Store {
    /// Open an existing repository. Fails with `RepoNotFound` when the
    /// store directory is absent.
    pub fn open(root: &Path, lock_timeout: Duration) -> Result<Store> {
        let store_dir = root.join(STORE_DIR);
        if !store_dir.is_dir() {
            return Err(WreckitError::RepoNotFound(store_dir));
        }
        Ok(Store {
            root: root.to_path_buf(),
            lock_timeout,
        })
    }

    /// Initialize a new repository: directory layout, default config,
    /// empty index, and the editable default prompt templates.
    pub fn init(root: &Path, config: &Config) -> Result<Store> {
        let store_dir = root.join(STORE_DIR);
        fs::create_dir_all(store_dir.join("items"))
            .map_err(|e| WreckitError::io(&store_dir, e))?;

        let prompts_dir = store_dir.join("prompts");
        fs::create_dir_all(&prompts_dir).map_err(|e| WreckitError::io(&prompts_dir, e))?;

        let store = Store {
            root: root.to_path_buf(),
            lock_timeout: config.lock_timeout(),
        };

        let config_path = store_dir.join("config.json");
        if !config_path.exists() {
            atomic_write_json(&config_path, config)?;
        }

        let index_path = store.index_path();
        if !index_path.exists() {
            atomic_write_json(&index_path, &Index::default())?;
        }

        for phase in Phase::ALL {
            let path = prompts_dir.join(format!("{}.md", phase.as_str()));
            if !path.exists() {
                atomic_write(&path, crate::prompt::default_template(phase).as_bytes())?;
            }
        }

        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store_dir(&self) -> PathBuf {
        self.root.join(STORE_DIR)
    }

    pub fn items_dir(&self) -> PathBuf {
        self.store_dir().join("items")
    }

    pub fn prompts_dir(&self) -> PathBuf {
        self.store_dir().join("prompts")
    }

    pub fn index_path(&self) -> PathBuf {
        self.store_dir().join("index.json")
    }

    pub fn healing_log_path(&self) -> PathBuf {
        self.store_dir().join(HEALING_LOG)
    }

    /// Item directory for an id. The directory name always matches the id.
    pub fn item_dir(&self, id: &str) -> PathBuf {
        self.items_dir().join(id)
    }

    pub fn item_lock_path(&self, id: &str) -> PathBuf {
        self.item_dir(id).join(ITEM_LOCK)
    }

    pub fn index_lock_path(&self) -> PathBuf {
        self.store_dir().join(INDEX_LOCK)
    }

    // --- Items ---

    pub fn load_item(&self, id: &str) -> Result<Item> {
        if !is_valid_id(id) {
            return Err(WreckitError::InvalidState(format!(
                "Malformed item id '{}'",
                id
            )));
        }
        let path = self.item_dir(id).join(ITEM_JSON);
        let item: Item = read_json(&path)?;
        if item.id != id {
            return Err(WreckitError::SchemaValidation(format!(
                "Item record at {} claims id '{}' but directory is '{}'",
                path.display(),
                item.id,
                id
            )));
        }
        Ok(item)
    }

    /// Persist an item record atomically and refresh its index entry.
    ///
    /// The caller is expected to hold the item lock; the index update takes
    /// the index lock internally.
    pub fn save_item(&self, item: &Item) -> Result<()> {
        let dir = self.item_dir(&item.id);
        fs::create_dir_all(&dir).map_err(|e| WreckitError::io(&dir, e))?;
        atomic_write_json(&dir.join(ITEM_JSON), item)?;
        self.update_index_entry(item)
    }

    /// All item ids known to the index, in id order.
    pub fn list_ids(&self) -> Result<Vec<String>> {
        Ok(self.load_index()?.items.keys().cloned().collect())
    }

    /// Load every item named by the index. An index entry whose record is
    /// missing or unreadable is skipped here (the doctor reports it).
    pub fn list_items(&self) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        for id in self.list_ids()? {
            match self.load_item(&id) {
                Ok(item) => items.push(item),
                Err(e) => {
                    crate::log_warn!("[store] Skipping unreadable item {}: {}", id, e);
                }
            }
        }
        Ok(items)
    }

    /// Scan item directories on disk, ignoring the index entirely.
    /// Used by the doctor for index reconciliation.
    pub fn scan_item_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let items_dir = self.items_dir();
        let sections = match fs::read_dir(&items_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(WreckitError::io(&items_dir, e)),
        };
        for section in sections {
            let section = section.map_err(|e| WreckitError::io(&items_dir, e))?;
            if !section.path().is_dir() {
                continue;
            }
            let section_name = section.file_name().to_string_lossy().to_string();
            let entries =
                fs::read_dir(section.path()).map_err(|e| WreckitError::io(section.path(), e))?;
            for entry in entries {
                let entry = entry.map_err(|e| WreckitError::io(section.path(), e))?;
                if entry.path().is_dir() {
                    ids.push(format!(
                        "{}/{}",
                        section_name,
                        entry.file_name().to_string_lossy()
                    ));
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    // --- Id allocation ---

    /// Allocate the next id in a section: `<section>/<NNN>-<slug>`.
    ///
    /// Holds the index lock for the whole operation. The ordinal is
    /// max+1 over both existing directories and index entries, so numbers
    /// are never reused even after an item directory is deleted. A
    /// placeholder index entry is written before the lock is released.
    pub fn allocate_id(&self, section: &str, title: &str) -> Result<String> {
        if section.is_empty()
            || !section
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(WreckitError::InvalidState(format!(
                "Invalid section name '{}'",
                section
            )));
        }

        let _lock = self.acquire_index_lock()?;

        let mut index = self.load_index()?;

        let dir_max = self
            .scan_item_ids()?
            .iter()
            .filter(|id| id_section(id) == Some(section))
            .filter_map(|id| id_ordinal(id))
            .max()
            .unwrap_or(0);
        let index_max = index
            .items
            .keys()
            .filter(|id| id_section(id) == Some(section))
            .filter_map(|id| id_ordinal(id))
            .max()
            .unwrap_or(0);

        let ordinal = dir_max.max(index_max) + 1;
        let slug = slugify(title);
        let slug = if slug.is_empty() { "item" } else { &slug };
        let id = format!("{}/{:03}-{}", section, ordinal, slug);

        index.items.insert(
            id.clone(),
            IndexEntry {
                state: ItemState::Idea,
                section: section.to_string(),
                title: title.to_string(),
            },
        );
        self.save_index(&index)?;

        Ok(id)
    }

    // --- Index ---

    pub fn load_index(&self) -> Result<Index> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(Index::default());
        }
        read_json(&path)
    }

    pub fn save_index(&self, index: &Index) -> Result<()> {
        atomic_write_json(&self.index_path(), index)
    }

    /// Refresh one index entry under the index lock.
    pub fn update_index_entry(&self, item: &Item) -> Result<()> {
        let _lock = self.acquire_index_lock()?;
        let mut index = self.load_index()?;
        index.items.insert(
            item.id.clone(),
            IndexEntry {
                state: item.state,
                section: item.section.clone(),
                title: item.title.clone(),
            },
        );
        self.save_index(&index)
    }

    // --- Artifacts ---

    pub fn artifact_path(&self, id: &str, name: &str) -> PathBuf {
        self.item_dir(id).join(name)
    }

    pub fn artifact_exists(&self, id: &str, name: &str) -> bool {
        self.artifact_path(id, name).is_file()
    }

    pub fn read_artifact(&self, id: &str, name: &str) -> Result<String> {
        let path = self.artifact_path(id, name);
        fs::read_to_string(&path).map_err(|e| WreckitError::io(&path, e))
    }

    pub fn write_artifact(&self, id: &str, name: &str, contents: &str) -> Result<()> {
        let dir = self.item_dir(id);
        fs::create_dir_all(&dir).map_err(|e| WreckitError::io(&dir, e))?;
        atomic_write(&dir.join(name), contents.as_bytes())
    }

    pub fn load_prd(&self, id: &str) -> Result<Prd> {
        read_json(&self.artifact_path(id, PRD_JSON))
    }

    pub fn save_prd(&self, id: &str, prd: &Prd) -> Result<()> {
        atomic_write_json(&self.artifact_path(id, PRD_JSON), prd)
    }

    /// Append one sanitized line to the item's progress log.
    pub fn append_progress(&self, id: &str, line: &str) -> Result<()> {
        let dir = self.item_dir(id);
        fs::create_dir_all(&dir).map_err(|e| WreckitError::io(&dir, e))?;
        let path = dir.join(PROGRESS_LOG);
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| WreckitError::io(&path, e))?;
        // Flatten embedded newlines so the log stays line-oriented
        let sanitized = line.replace(['\r', '\n'], " ");
        writeln!(file, "{}", sanitized).map_err(|e| WreckitError::io(&path, e))?;
        Ok(())
    }

    /// Append one structured record to the healing log (JSON per line).
    pub fn append_healing_record<T: Serialize>(&self, record: &T) -> Result<()> {
        let path = self.healing_log_path();
        let json = serde_json::to_string(record).map_err(|e| WreckitError::Io {
            path: path.clone(),
            detail: e.to_string(),
        })?;
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| WreckitError::io(&path, e))?;
        writeln!(file, "{}", json).map_err(|e| WreckitError::io(&path, e))?;
        Ok(())
    }

    // --- Locks ---

    pub fn acquire_item_lock(&self, id: &str) -> Result<LockGuard> {
        let dir = self.item_dir(id);
        fs::create_dir_all(&dir).map_err(|e| WreckitError::io(&dir, e))?;
        lock::acquire(&self.item_lock_path(id), self.lock_timeout)
    }

    pub fn acquire_index_lock(&self) -> Result<LockGuard> {
        lock::acquire(&self.index_lock_path(), self.lock_timeout)
    }
}

// --- Atomic writes ---

/// Write bytes via temp-file-then-rename in the target directory, so a
/// reader never observes a partial file and a crash leaves either the old
/// or the new content.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| WreckitError::InvalidState(format!("No parent for {}", path.display())))?;

    fs::create_dir_all(parent).map_err(|e| WreckitError::io(parent, e))?;

    let temp = NamedTempFile::new_in(parent).map_err(|e| WreckitError::io(parent, e))?;
    fs::write(temp.path(), bytes).map_err(|e| WreckitError::io(temp.path(), e))?;

    // sync to disk before the rename makes it visible
    let file = fs::File::open(temp.path()).map_err(|e| WreckitError::io(temp.path(), e))?;
    file.sync_all().map_err(|e| WreckitError::io(temp.path(), e))?;

    temp.persist(path).map_err(|e| WreckitError::Io {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;

    Ok(())
}

pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(|e| WreckitError::Io {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    atomic_write(path, json.as_bytes())
}

pub fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path).map_err(|e| WreckitError::io(path, e))?;
    serde_json::from_str(&contents).map_err(|e| WreckitError::InvalidJson {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}
