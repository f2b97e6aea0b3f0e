//! Persistent plan cache.
//!
//! One JSON document at `<state_dir>/cache.json` holds successful plans keyed
//! by the fingerprint of the normalized raw input, plus a bounded log of
//! recovery lessons. Entries are created on a task's first success and
//! refreshed on repeat hits; nothing is evicted automatically.
//!
//! Writers hold the in-process write lock, merge the file's current contents,
//! apply their change and replace the file atomically. Readers only ever see
//! whole documents. A file or entry that fails to parse is discarded with a
//! warning and behaves like a miss.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::fingerprint::{actions_compatible, normalize_intent, similarity};
use crate::core::plan::{Plan, validate_plan};
use crate::core::types::{IntentAnalysis, Lesson};
use crate::io::config::write_atomic;

pub const CACHE_VERSION: u32 = 1;
/// Lessons kept in the store; older ones are dropped first.
pub const MAX_LESSONS: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub normalized_input: String,
    pub normalized_intent: String,
    pub intent: IntentAnalysis,
    pub plan: Plan,
    pub success: bool,
    pub created_at: String,
    pub last_used: String,
    #[serde(default)]
    pub hits: u64,
}

/// An approximate match and its similarity score.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarHit {
    pub entry: CacheEntry,
    pub score: f64,
}

#[derive(Debug, Default, Deserialize)]
struct RawCacheFile {
    version: u32,
    #[serde(default)]
    entries: BTreeMap<String, Value>,
    #[serde(default)]
    lessons: Vec<Value>,
}

#[derive(Serialize)]
struct CacheFileRef<'a> {
    version: u32,
    entries: &'a BTreeMap<String, CacheEntry>,
    lessons: &'a [Lesson],
}

#[derive(Debug, Default, Clone)]
struct CacheState {
    entries: BTreeMap<String, CacheEntry>,
    lessons: Vec<Lesson>,
}

/// Result of reading the store file.
enum Loaded {
    Missing,
    Ok { state: CacheState, discarded: usize },
    Corrupt(String),
}

/// Timestamp format used for `created_at`/`last_used`; sorts chronologically.
pub fn now_stamp() -> String {
    chrono::Utc::now()
        .format("%Y-%m-%dT%H:%M:%S%.6fZ")
        .to_string()
}

pub struct PlanCache {
    path: PathBuf,
    state: RwLock<CacheState>,
    discarded: usize,
}

impl PlanCache {
    /// Open the store at `path`. Missing or unreadable files start empty.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn open(path: &Path) -> Self {
        let (state, discarded) = match load(path) {
            Loaded::Missing => {
                debug!("no cache file yet");
                (CacheState::default(), 0)
            }
            Loaded::Ok { state, discarded } => {
                info!(
                    entries = state.entries.len(),
                    lessons = state.lessons.len(),
                    "cache loaded"
                );
                (state, discarded)
            }
            Loaded::Corrupt(reason) => {
                warn!(%reason, "cache file corrupt, starting empty");
                (CacheState::default(), 1)
            }
        };
        Self {
            path: path.to_path_buf(),
            state: RwLock::new(state),
            discarded,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Corrupt documents or entries dropped while loading.
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn entries(&self) -> Vec<CacheEntry> {
        self.read().entries.values().cloned().collect()
    }

    pub fn lookup_exact(&self, fingerprint: &str) -> Option<CacheEntry> {
        let hit = self
            .read()
            .entries
            .get(fingerprint)
            .filter(|e| e.success)
            .cloned();
        debug!(fingerprint, hit = hit.is_some(), "exact cache lookup");
        hit
    }

    /// Best successful entry whose normalized intent scores at least
    /// `threshold` against `normalized_intent` and whose action tags are
    /// compatible. Ties go to the higher score, then the most recently used
    /// entry, then the smallest fingerprint.
    pub fn lookup_similar(&self, normalized_intent: &str, threshold: f64) -> Option<SimilarHit> {
        let state = self.read();
        let best = state
            .entries
            .values()
            .filter(|e| e.success)
            .filter(|e| actions_compatible(normalized_intent, &e.normalized_intent))
            .map(|e| (e, similarity(normalized_intent, &e.normalized_intent)))
            .filter(|(_, score)| *score >= threshold)
            .max_by(|(a, sa), (b, sb)| {
                sa.partial_cmp(sb)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.last_used.cmp(&b.last_used))
                    .then_with(|| b.fingerprint.cmp(&a.fingerprint))
            })
            .map(|(e, score)| SimilarHit {
                entry: e.clone(),
                score,
            });
        debug!(
            hit = best.as_ref().map(|h| h.entry.fingerprint.as_str()),
            score = best.as_ref().map(|h| h.score),
            "similar cache lookup"
        );
        best
    }

    pub fn recent_lessons(&self, limit: usize) -> Vec<Lesson> {
        let state = self.read();
        let skip = state.lessons.len().saturating_sub(limit);
        state.lessons[skip..].to_vec()
    }

    /// Store (or refresh) the successful plan for `fingerprint`.
    pub fn record_success(
        &self,
        fingerprint: &str,
        normalized_input: &str,
        intent: &IntentAnalysis,
        plan: &Plan,
    ) -> Result<()> {
        let plan = plan.replayable();
        let normalized_intent = normalize_intent(&intent.intent);
        self.mutate(|state| {
            let now = now_stamp();
            let (created_at, hits) = state
                .entries
                .get(fingerprint)
                .map(|e| (e.created_at.clone(), e.hits))
                .unwrap_or_else(|| (now.clone(), 0));
            state.entries.insert(
                fingerprint.to_string(),
                CacheEntry {
                    fingerprint: fingerprint.to_string(),
                    normalized_input: normalized_input.to_string(),
                    normalized_intent,
                    intent: intent.clone(),
                    plan,
                    success: true,
                    created_at,
                    last_used: now,
                    hits,
                },
            );
        })?;
        info!(fingerprint, "cached successful plan");
        Ok(())
    }

    /// Count a hit and refresh `last_used`. Returns false if the entry is gone.
    pub fn touch(&self, fingerprint: &str) -> Result<bool> {
        let mut found = false;
        self.mutate(|state| {
            if let Some(entry) = state.entries.get_mut(fingerprint) {
                entry.hits += 1;
                entry.last_used = now_stamp();
                found = true;
            }
        })?;
        Ok(found)
    }

    /// Remove an entry. Returns false if there was none.
    pub fn invalidate(&self, fingerprint: &str) -> Result<bool> {
        let mut removed = false;
        self.mutate(|state| {
            removed = state.entries.remove(fingerprint).is_some();
        })?;
        if removed {
            info!(fingerprint, "cache entry invalidated");
        }
        Ok(removed)
    }

    pub fn append_lesson(&self, lesson: Lesson) -> Result<()> {
        self.mutate(|state| {
            state.lessons.push(lesson);
            let excess = state.lessons.len().saturating_sub(MAX_LESSONS);
            state.lessons.drain(..excess);
        })
    }

    /// Merge the file's current contents, apply `change`, write atomically.
    /// Memory only takes the new state once it is on disk.
    fn mutate(&self, change: impl FnOnce(&mut CacheState)) -> Result<()> {
        let mut state = self.write();
        let mut next = match load(&self.path) {
            Loaded::Ok { state: disk, .. } => disk,
            Loaded::Missing => state.clone(),
            Loaded::Corrupt(reason) => {
                warn!(%reason, "cache file corrupt, overwriting with in-memory state");
                state.clone()
            }
        };
        change(&mut next);
        persist(&self.path, &next)?;
        *state = next;
        Ok(())
    }
}

fn load(path: &Path) -> Loaded {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Loaded::Missing,
        Err(e) => return Loaded::Corrupt(format!("read {}: {e}", path.display())),
    };
    let raw: RawCacheFile = match serde_json::from_str(&contents) {
        Ok(raw) => raw,
        Err(e) => return Loaded::Corrupt(format!("parse {}: {e}", path.display())),
    };
    if raw.version != CACHE_VERSION {
        return Loaded::Corrupt(format!(
            "unsupported cache version {} (expected {CACHE_VERSION})",
            raw.version
        ));
    }

    let mut discarded = 0;
    let mut state = CacheState::default();
    for (key, value) in raw.entries {
        match entry_from_value(&key, value) {
            Ok(entry) => {
                state.entries.insert(key, entry);
            }
            Err(reason) => {
                warn!(fingerprint = %key, %reason, "discarding corrupt cache entry");
                discarded += 1;
            }
        }
    }
    for value in raw.lessons {
        match serde_json::from_value::<Lesson>(value) {
            Ok(lesson) => state.lessons.push(lesson),
            Err(e) => {
                warn!(err = %e, "discarding corrupt lesson");
                discarded += 1;
            }
        }
    }
    Loaded::Ok { state, discarded }
}

fn entry_from_value(key: &str, value: Value) -> Result<CacheEntry, String> {
    let entry: CacheEntry = serde_json::from_value(value).map_err(|e| e.to_string())?;
    if entry.fingerprint != key {
        return Err(format!("entry fingerprint {} under key {key}", entry.fingerprint));
    }
    let errors = validate_plan(&entry.plan);
    if !errors.is_empty() {
        return Err(format!("invalid plan: {}", errors.join("; ")));
    }
    Ok(entry)
}

fn persist(path: &Path, state: &CacheState) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create cache dir {}", parent.display()))?;
    }
    let doc = CacheFileRef {
        version: CACHE_VERSION,
        entries: &state.entries,
        lessons: &state.lessons,
    };
    let mut buf = serde_json::to_string_pretty(&doc).context("serialize cache")?;
    buf.push('\n');
    write_atomic(path, &buf).with_context(|| format!("write cache {}", path.display()))
}
