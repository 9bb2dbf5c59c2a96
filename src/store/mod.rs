//! The file-backed context store.
//!
//! A single JSON document (`{ version, entries, groups }`) holds every
//! context entry and bubble. Operations are load-modify-save under one
//! in-process mutex, and every rewrite goes through a temp-file rename so a
//! concurrent reader sees either the old file or the new file, never a
//! truncated one. Read and write operations report events to the
//! [`Observer`](crate::observer::Observer); the store never reads it back.

pub mod types;

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::observer::{Event, EventKind, Observer};
use crate::schema::{self, SchemaCatalog};
use types::{Bubble, ContextEntry, StoreFile, StructuredData, STORE_VERSION};

/// Serialize a value as pretty JSON and atomically replace `path` with it.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json)
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

/// Result of a typed save: the persisted entry plus any validation errors.
/// Validation failure never blocks persistence.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedSaveResult {
    pub entry: ContextEntry,
    pub validation_errors: Vec<String>,
    pub valid: bool,
}

/// Fields that can change on an existing entry. `None` leaves a field alone;
/// `bubble_id` uses a double Option so the reference can be cleared.
#[derive(Debug, Clone, Default)]
pub struct EntryPatch {
    pub content: Option<String>,
    pub tags: Option<Vec<String>>,
    pub source: Option<String>,
    pub bubble_id: Option<Option<String>>,
}

/// Store-level statistics for health reporting.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub total_entries: usize,
    pub active_entries: usize,
    pub archived_entries: usize,
    pub by_type: BTreeMap<String, usize>,
    pub bubbles: usize,
    pub file_size_bytes: u64,
}

/// The context store. Cheap to clone via `Arc` at call sites; internally a
/// path plus one mutex that serializes all file access.
#[derive(Debug)]
pub struct ContextStore {
    path: PathBuf,
    observer: Option<Arc<Observer>>,
    lock: Mutex<()>,
}

impl ContextStore {
    /// Open the store at `path`, creating parent directories. A missing file
    /// yields an empty store; a malformed file fails loudly here rather than
    /// on first use.
    pub fn open(path: impl Into<PathBuf>, observer: Option<Arc<Observer>>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        let store = Self {
            path,
            observer,
            lock: Mutex::new(()),
        };
        let file = store.load()?;
        tracing::info!(
            path = %store.path.display(),
            entries = file.entries.len(),
            bubbles = file.groups.len(),
            "context store ready"
        );
        Ok(store)
    }

    fn load(&self) -> Result<StoreFile> {
        if !self.path.exists() {
            return Ok(StoreFile {
                version: STORE_VERSION,
                ..Default::default()
            });
        }
        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read store file {}", self.path.display()))?;
        let file: StoreFile = serde_json::from_str(&contents).with_context(|| {
            format!(
                "store file {} is corrupt; restore it from a backup or move it aside to start fresh",
                self.path.display()
            )
        })?;
        Ok(file)
    }

    fn save(&self, file: &mut StoreFile) -> Result<()> {
        file.version = STORE_VERSION;
        write_json_atomic(&self.path, file)
    }

    fn record(&self, event: Event) {
        if let Some(observer) = &self.observer {
            if let Err(err) = observer.record(event) {
                tracing::warn!(%err, "failed to record store event");
            }
        }
    }

    /// Run `f` against the loaded file under the lock, saving iff it returns
    /// `Ok(Some(_))`. The single entry point for every mutation.
    fn with_file<T>(&self, f: impl FnOnce(&mut StoreFile) -> Result<Option<T>>) -> Result<Option<T>> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = self.load()?;
        let out = f(&mut file)?;
        if out.is_some() {
            self.save(&mut file)?;
        }
        Ok(out)
    }

    /// Read-only view under the lock.
    fn read_file<T>(&self, f: impl FnOnce(&StoreFile) -> T) -> Result<T> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let file = self.load()?;
        Ok(f(&file))
    }

    // ── Entry CRUD ───────────────────────────────────────────────────────────

    /// Persist a new untyped entry.
    pub fn save_entry(
        &self,
        content: &str,
        tags: Vec<String>,
        source: &str,
        bubble_id: Option<String>,
    ) -> Result<ContextEntry> {
        let entry = self
            .with_file(|file| {
                let entry = new_entry(file, content, tags, source, bubble_id, None, None);
                file.entries.push(entry.clone());
                Ok(Some(entry))
            })?
            .expect("insert always saves");
        self.record(Event::write("save_context", entry.type_name.clone(), vec![entry.id.clone()]));
        Ok(entry)
    }

    /// Persist a typed entry, validating against the catalog. The entry is
    /// stored even when validation fails; the errors ride along in the
    /// result. Without a catalog (or with an unknown type) the save degrades
    /// to untyped: structured data is kept but no type name is recorded.
    pub fn save_typed(
        &self,
        catalog: Option<&SchemaCatalog>,
        type_name: &str,
        data: StructuredData,
        tags: Vec<String>,
        source: &str,
    ) -> Result<TypedSaveResult> {
        let (type_known, errors) = match catalog {
            Some(catalog) => {
                let (_, errors) = schema::validate(catalog, type_name, &data);
                (catalog.get_type(type_name).is_some(), errors)
            }
            None => (false, Vec::new()),
        };

        let content = schema::render_content(type_name, &data);
        let stored_type = type_known.then(|| type_name.to_string());

        let entry = self
            .with_file(|file| {
                let entry = new_entry(
                    file,
                    &content,
                    tags,
                    source,
                    None,
                    stored_type.clone(),
                    Some(data),
                );
                file.entries.push(entry.clone());
                Ok(Some(entry))
            })?
            .expect("insert always saves");

        self.record(Event::write(
            "save_typed_context",
            stored_type,
            vec![entry.id.clone()],
        ));

        Ok(TypedSaveResult {
            valid: errors.is_empty() && entry.type_name.is_some(),
            entry,
            validation_errors: errors,
        })
    }

    /// Direct ID lookup. Archived entries are visible here.
    pub fn get(&self, id: &str) -> Result<Option<ContextEntry>> {
        let found = self.read_file(|file| file.entries.iter().find(|e| e.id == id).cloned())?;
        if let Some(entry) = &found {
            self.record(Event::read("get_context", entry.type_name.clone(), vec![entry.id.clone()]));
        }
        Ok(found)
    }

    /// Apply a patch to an existing entry. `updatedAt` only ever advances.
    pub fn update(&self, id: &str, patch: EntryPatch) -> Result<Option<ContextEntry>> {
        let updated = self.with_file(|file| {
            let Some(entry) = file.entries.iter_mut().find(|e| e.id == id) else {
                return Ok(None);
            };
            if let Some(content) = patch.content {
                entry.content = content;
            }
            if let Some(tags) = patch.tags {
                entry.tags = tags;
            }
            if let Some(source) = patch.source {
                entry.source = source;
            }
            if let Some(bubble_id) = patch.bubble_id {
                entry.bubble_id = bubble_id;
            }
            touch(entry);
            Ok(Some(entry.clone()))
        })?;
        if let Some(entry) = &updated {
            self.record(Event::write("update_context", entry.type_name.clone(), vec![entry.id.clone()]));
        }
        Ok(updated)
    }

    /// Permanently remove an entry. Only explicit user/REST calls reach this;
    /// autonomous actions archive instead.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let removed = self.with_file(|file| {
            let before = file.entries.len();
            file.entries.retain(|e| e.id != id);
            Ok((file.entries.len() < before).then_some(()))
        })?;
        if removed.is_some() {
            self.record(Event {
                kind: EventKind::Delete,
                tool: "delete_context".into(),
                query: None,
                type_name: None,
                entry_ids: vec![id.to_string()],
                at: now_iso(),
            });
        }
        Ok(removed.is_some())
    }

    /// Union the given tags into an entry's tag set.
    pub fn add_tags(&self, id: &str, tags: &[String]) -> Result<Option<ContextEntry>> {
        let updated = self.with_file(|file| {
            let Some(entry) = file.entries.iter_mut().find(|e| e.id == id) else {
                return Ok(None);
            };
            for tag in tags {
                if !entry.has_tag(tag) {
                    entry.tags.push(tag.clone());
                }
            }
            touch(entry);
            Ok(Some(entry.clone()))
        })?;
        if let Some(entry) = &updated {
            self.record(Event::write("tag_context", entry.type_name.clone(), vec![entry.id.clone()]));
        }
        Ok(updated)
    }

    /// Set or clear an entry's type name.
    pub fn set_type(&self, id: &str, type_name: Option<&str>) -> Result<Option<ContextEntry>> {
        let updated = self.with_file(|file| {
            let Some(entry) = file.entries.iter_mut().find(|e| e.id == id) else {
                return Ok(None);
            };
            entry.type_name = type_name.map(str::to_string);
            touch(entry);
            Ok(Some(entry.clone()))
        })?;
        if let Some(entry) = &updated {
            self.record(Event::write("set_context_type", entry.type_name.clone(), vec![entry.id.clone()]));
        }
        Ok(updated)
    }

    /// Flip the soft-archive flag. Content is untouched.
    pub fn set_archived(&self, id: &str, archived: bool) -> Result<Option<ContextEntry>> {
        let updated = self.with_file(|file| {
            let Some(entry) = file.entries.iter_mut().find(|e| e.id == id) else {
                return Ok(None);
            };
            entry.archived = archived;
            touch(entry);
            Ok(Some(entry.clone()))
        })?;
        if let Some(entry) = &updated {
            self.record(Event::write("archive_context", entry.type_name.clone(), vec![entry.id.clone()]));
        }
        Ok(updated)
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    /// All active entries, optionally filtered by tag.
    pub fn list(&self, tag: Option<&str>) -> Result<Vec<ContextEntry>> {
        let entries = self.read_file(|file| {
            file.entries
                .iter()
                .filter(|e| !e.archived)
                .filter(|e| tag.map_or(true, |t| e.has_tag(t)))
                .cloned()
                .collect::<Vec<_>>()
        })?;
        self.record(Event::read("list_contexts", None, ids_of(&entries)));
        Ok(entries)
    }

    /// Archived entries only.
    pub fn list_archived(&self) -> Result<Vec<ContextEntry>> {
        let entries = self.read_file(|file| {
            file.entries.iter().filter(|e| e.archived).cloned().collect::<Vec<_>>()
        })?;
        self.record(Event::read("list_archive", None, ids_of(&entries)));
        Ok(entries)
    }

    /// Case-insensitive substring recall over content and tags. An empty
    /// result is recorded as a miss carrying the query.
    pub fn recall(&self, query: &str) -> Result<Vec<ContextEntry>> {
        let needle = query.to_lowercase();
        let entries = self.read_file(|file| {
            file.entries
                .iter()
                .filter(|e| !e.archived)
                .filter(|e| {
                    e.content.to_lowercase().contains(&needle)
                        || e.tags.iter().any(|t| t.to_lowercase().contains(&needle))
                })
                .cloned()
                .collect::<Vec<_>>()
        })?;
        self.record(Event::query("recall_context", query, &entries));
        Ok(entries)
    }

    /// Multi-term conjunctive search over content, tags, and source: every
    /// whitespace-separated term must match somewhere.
    pub fn search(&self, query: &str) -> Result<Vec<ContextEntry>> {
        let terms: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
        let entries = self.read_file(|file| {
            file.entries
                .iter()
                .filter(|e| !e.archived)
                .filter(|e| {
                    let haystack = format!(
                        "{} {} {}",
                        e.content.to_lowercase(),
                        e.tags.join(" ").to_lowercase(),
                        e.source.to_lowercase()
                    );
                    terms.iter().all(|t| haystack.contains(t))
                })
                .cloned()
                .collect::<Vec<_>>()
        })?;
        self.record(Event::query("search_context", query, &entries));
        Ok(entries)
    }

    /// Active entries of the given type whose structured data matches every
    /// filter field. A set filter field fails entries without structured data.
    pub fn query_by_type(
        &self,
        type_name: &str,
        filter: &StructuredData,
    ) -> Result<Vec<ContextEntry>> {
        let entries = self.read_file(|file| {
            file.entries
                .iter()
                .filter(|e| !e.archived)
                .filter(|e| e.type_name.as_deref() == Some(type_name))
                .filter(|e| {
                    filter.iter().all(|(k, want)| {
                        e.structured_data
                            .as_ref()
                            .and_then(|data| data.get(k))
                            .is_some_and(|have| have == want)
                    })
                })
                .cloned()
                .collect::<Vec<_>>()
        })?;
        let mut event = Event::query("query_by_type", &format!("type:{type_name}"), &entries);
        event.type_name = Some(type_name.to_string());
        self.record(event);
        Ok(entries)
    }

    /// Untouched copy of all entries and bubbles, for the self-model builder
    /// and the improver. Internal — records no event.
    pub fn snapshot(&self) -> Result<(Vec<ContextEntry>, Vec<Bubble>)> {
        self.read_file(|file| (file.entries.clone(), file.groups.clone()))
    }

    /// Counts for health reporting. Internal — records no event.
    pub fn stats(&self) -> Result<StoreStats> {
        let (total, active, by_type, bubbles) = self.read_file(|file| {
            let mut by_type = BTreeMap::new();
            for entry in file.entries.iter().filter(|e| !e.archived) {
                if let Some(t) = &entry.type_name {
                    *by_type.entry(t.clone()).or_insert(0) += 1;
                }
            }
            let active = file.entries.iter().filter(|e| !e.archived).count();
            (file.entries.len(), active, by_type, file.groups.len())
        })?;
        let file_size_bytes = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        Ok(StoreStats {
            total_entries: total,
            active_entries: active,
            archived_entries: total - active,
            by_type,
            bubbles,
            file_size_bytes,
        })
    }

    // ── Bubbles ──────────────────────────────────────────────────────────────

    pub fn create_bubble(&self, name: &str, description: Option<String>) -> Result<Bubble> {
        let bubble = self
            .with_file(|file| {
                let now = now_iso();
                let id = fresh_id("bub", name, &now, |id| {
                    file.groups.iter().any(|b| b.id == id)
                });
                let bubble = Bubble {
                    id,
                    name: name.to_string(),
                    description,
                    created_at: now.clone(),
                    updated_at: now,
                };
                file.groups.push(bubble.clone());
                Ok(Some(bubble))
            })?
            .expect("insert always saves");
        self.record(Event::write("create_bubble", None, vec![bubble.id.clone()]));
        Ok(bubble)
    }

    pub fn list_bubbles(&self) -> Result<Vec<Bubble>> {
        let bubbles = self.read_file(|file| file.groups.clone())?;
        self.record(Event::read("list_bubbles", None, vec![]));
        Ok(bubbles)
    }

    pub fn get_bubble(&self, id: &str) -> Result<Option<Bubble>> {
        self.read_file(|file| file.groups.iter().find(|b| b.id == id).cloned())
    }

    pub fn update_bubble(
        &self,
        id: &str,
        name: Option<String>,
        description: Option<String>,
    ) -> Result<Option<Bubble>> {
        let updated = self.with_file(|file| {
            let Some(bubble) = file.groups.iter_mut().find(|b| b.id == id) else {
                return Ok(None);
            };
            if let Some(name) = name {
                bubble.name = name;
            }
            if let Some(description) = description {
                bubble.description = Some(description);
            }
            bubble.updated_at = later_of(&bubble.updated_at, now_iso());
            Ok(Some(bubble.clone()))
        })?;
        if updated.is_some() {
            self.record(Event::write("update_bubble", None, vec![id.to_string()]));
        }
        Ok(updated)
    }

    /// Delete a bubble. With `cascade` its entries go too; otherwise they are
    /// orphaned (back-reference cleared).
    pub fn delete_bubble(&self, id: &str, cascade: bool) -> Result<bool> {
        let removed = self.with_file(|file| {
            let before = file.groups.len();
            file.groups.retain(|b| b.id != id);
            if file.groups.len() == before {
                return Ok(None);
            }
            if cascade {
                file.entries.retain(|e| e.bubble_id.as_deref() != Some(id));
            } else {
                for entry in file.entries.iter_mut() {
                    if entry.bubble_id.as_deref() == Some(id) {
                        entry.bubble_id = None;
                        touch(entry);
                    }
                }
            }
            Ok(Some(()))
        })?;
        if removed.is_some() {
            self.record(Event {
                kind: EventKind::Delete,
                tool: "delete_bubble".into(),
                query: None,
                type_name: None,
                entry_ids: vec![id.to_string()],
                at: now_iso(),
            });
        }
        Ok(removed.is_some())
    }

    /// Active entries belonging to a bubble.
    pub fn entries_in_bubble(&self, bubble_id: &str) -> Result<Vec<ContextEntry>> {
        let entries = self.read_file(|file| {
            file.entries
                .iter()
                .filter(|e| !e.archived && e.bubble_id.as_deref() == Some(bubble_id))
                .cloned()
                .collect::<Vec<_>>()
        })?;
        self.record(Event::read("bubble_contexts", None, ids_of(&entries)));
        Ok(entries)
    }
}

// ── Internal helpers ─────────────────────────────────────────────────────────

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Advance an entry's `updatedAt`, never moving it backwards even if the
/// wall clock does.
fn touch(entry: &mut ContextEntry) {
    entry.updated_at = later_of(&entry.updated_at, now_iso());
}

fn later_of(previous: &str, candidate: String) -> String {
    if candidate.as_str() >= previous {
        candidate
    } else {
        previous.to_string()
    }
}

fn ids_of(entries: &[ContextEntry]) -> Vec<String> {
    entries.iter().map(|e| e.id.clone()).collect()
}

/// Content-addressed ID: `<prefix>-` plus the first 12 hex chars of
/// SHA-256 over the seed text and creation timestamp. `taken` guards the
/// (vanishingly unlikely) collision by salting with a counter.
fn fresh_id(prefix: &str, seed: &str, created_at: &str, taken: impl Fn(&str) -> bool) -> String {
    let mut salt = 0u32;
    loop {
        let mut hasher = Sha256::new();
        hasher.update(seed.as_bytes());
        hasher.update(created_at.as_bytes());
        if salt > 0 {
            hasher.update(salt.to_le_bytes());
        }
        let digest = hasher.finalize();
        let hex: String = digest.iter().take(6).map(|b| format!("{b:02x}")).collect();
        let id = format!("{prefix}-{hex}");
        if !taken(&id) {
            return id;
        }
        salt += 1;
    }
}

fn new_entry(
    file: &StoreFile,
    content: &str,
    tags: Vec<String>,
    source: &str,
    bubble_id: Option<String>,
    type_name: Option<String>,
    structured_data: Option<StructuredData>,
) -> ContextEntry {
    let now = now_iso();
    let id = fresh_id("ctx", content, &now, |id| {
        file.entries.iter().any(|e| e.id == id)
    });
    ContextEntry {
        id,
        content: content.to_string(),
        tags,
        source: source.to_string(),
        bubble_id,
        type_name,
        structured_data,
        created_at: now.clone(),
        updated_at: now,
        archived: false,
    }
}
