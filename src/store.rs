//! # Stage: Record Store
//!
//! ## Responsibility
//! Key-value persistence for every entity the service writes: one JSON
//! document per key, plus append-only text logs.  Keys look like
//! `"<area>/<name>"` (e.g. `telemetry/t_01700000000_000000000_s1`); the
//! area maps to a directory under the data root and the name to a file.
//!
//! Two backings share the [`KvStore`] interface: [`FsStore`] for production
//! and [`MemoryStore`] for tests and ephemeral runs.
//!
//! ## Guarantees
//! - Atomic `put`: a reader sees either the old document or the new one
//!   (temp file + rename on the filesystem backing)
//! - Ordered `scan`: results are sorted by key, so zero-padded timestamp keys
//!   come back in arrival order
//! - Unique keys: [`KeyClock`] never hands out the same `(ts, seq)` twice
//!
//! ## NOT Responsible For
//! - Retention or compaction (records accumulate until removed externally)
//! - Cross-entity transactions (callers lock per entity where they need to)

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, TunerError};

// ---------------------------------------------------------------------------
// Time helpers
// ---------------------------------------------------------------------------

/// Current Unix epoch in whole seconds.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Replace every character outside `[A-Za-z0-9_.-]` with `_`.
///
/// Caller-supplied identifiers (session ids, labels, experiment names) become
/// part of file names, so they must never carry path separators.
pub fn sanitize_segment(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        cleaned
    }
}

// ---------------------------------------------------------------------------
// KeyClock: unique, ordered key stamps
// ---------------------------------------------------------------------------

/// A `(ts, seq)` pair used to build storage keys.
///
/// `ts` is whole seconds; `seq` disambiguates stamps within the same second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stamp {
    pub ts: u64,
    pub seq: u64,
}

impl Stamp {
    /// Zero-padded `"{ts}_{seq}"` so lexicographic order equals stamp order.
    pub fn key_part(&self) -> String {
        format!("{:011}_{:09}", self.ts, self.seq)
    }

    /// Parse the stamp embedded in a key name such as `t_01700000000_000000003_s1`.
    ///
    /// `prefix` is the name prefix before the stamp (`"t_"`, `"tune_"`, ...).
    pub fn parse_from_name(name: &str, prefix: &str) -> Option<Stamp> {
        let rest = name.strip_prefix(prefix)?;
        let mut parts = rest.splitn(3, '_');
        let ts = parts.next()?.parse().ok()?;
        let seq = parts.next()?.parse().ok()?;
        Some(Stamp { ts, seq })
    }
}

type TimeSource = Box<dyn Fn() -> u64 + Send + Sync>;

/// Hands out strictly increasing [`Stamp`]s.
///
/// `ts` never goes backwards even if the wall clock does, which keeps
/// telemetry timestamps monotonic non-decreasing in arrival order.
pub struct KeyClock {
    last: Mutex<Option<Stamp>>,
    source: TimeSource,
}

impl std::fmt::Debug for KeyClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyClock").field("last", &self.last).finish()
    }
}

impl Default for KeyClock {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyClock {
    /// Clock backed by the system wall clock.
    pub fn new() -> Self {
        Self::with_source(now_secs)
    }

    /// Clock backed by an arbitrary seconds source (tests pin time with this).
    pub fn with_source(source: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        Self { last: Mutex::new(None), source: Box::new(source) }
    }

    /// Allocate the next stamp.
    pub fn next(&self) -> Stamp {
        let now = (self.source)();
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        let stamp = match *last {
            Some(prev) if now <= prev.ts => Stamp { ts: prev.ts, seq: prev.seq + 1 },
            _ => Stamp { ts: now, seq: 0 },
        };
        *last = Some(stamp);
        stamp
    }

    /// Make sure future stamps sort after `seen` (used when reopening a store).
    pub fn observe(&self, seen: Stamp) {
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        if last.map_or(true, |prev| seen > prev) {
            *last = Some(seen);
        }
    }
}

// ---------------------------------------------------------------------------
// KvStore trait
// ---------------------------------------------------------------------------

/// Raw key-value interface over JSON text documents and append-only logs.
pub trait KvStore: Send + Sync {
    /// Atomically write `value` under `key`, replacing any previous document.
    fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Read the document stored under `key`.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// All `(key, document)` pairs whose key starts with `prefix`, sorted by key.
    fn scan(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    /// Keys starting with `prefix`, sorted, without reading the documents.
    fn keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Append one line (a trailing newline is added) to the log named `log`.
    fn append_line(&self, log: &str, line: &str) -> Result<()>;

    /// Full contents of the log named `log` (empty when it does not exist).
    fn read_log(&self, log: &str) -> Result<String>;

    /// Human-readable location of `key` (a file path on disk).
    fn location(&self, key: &str) -> String;
}

/// Typed helpers layered over any [`KvStore`].
pub trait JsonStore: KvStore {
    fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let text = serde_json::to_string_pretty(value)?;
        self.put(key, &text)
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    fn scan_json<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<(String, T)>> {
        self.scan(prefix)?
            .into_iter()
            .map(|(k, text)| Ok((k, serde_json::from_str(&text)?)))
            .collect()
    }
}

impl<S: KvStore + ?Sized> JsonStore for S {}

fn split_key(key: &str) -> Result<(&str, &str)> {
    let (area, name) = key
        .split_once('/')
        .ok_or_else(|| TunerError::bad_request(format!("malformed storage key '{key}'")))?;
    if area.is_empty() || name.is_empty() || name.contains('/') || area.contains("..") {
        return Err(TunerError::bad_request(format!("malformed storage key '{key}'")));
    }
    Ok((area, name))
}

// ---------------------------------------------------------------------------
// FsStore: one file per key
// ---------------------------------------------------------------------------

/// Filesystem backing: `<root>/<area>/<name>.json` per document.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Open (and create) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn doc_path(&self, key: &str) -> Result<PathBuf> {
        let (area, name) = split_key(key)?;
        Ok(self.root.join(area).join(format!("{name}.json")))
    }

    fn log_path(&self, log: &str) -> Result<PathBuf> {
        let (area, name) = split_key(log)?;
        Ok(self.root.join(area).join(name))
    }
}

impl KvStore for FsStore {
    fn put(&self, key: &str, value: &str) -> Result<()> {
        let path = self.doc_path(key)?;
        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir)?;
        let tmp = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(value.as_bytes())?;
            f.sync_all()?;
        }
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.doc_path(key)?;
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn scan(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        self.keys(prefix)?
            .into_iter()
            .filter_map(|k| match self.get(&k) {
                Ok(Some(text)) => Some(Ok((k, text))),
                Ok(None) => None,
                Err(e) => Some(Err(e)),
            })
            .collect()
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let (area, name_prefix) = prefix.split_once('/').unwrap_or((prefix, ""));
        let dir = self.root.join(area);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if let Some(stem) = file_name.strip_suffix(".json") {
                if stem.starts_with(name_prefix) && !stem.starts_with('.') {
                    keys.push(format!("{area}/{stem}"));
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn append_line(&self, log: &str, line: &str) -> Result<()> {
        let path = self.log_path(log)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut f = OpenOptions::new().create(true).append(true).open(&path)?;
        f.write_all(format!("{line}\n").as_bytes())?;
        Ok(())
    }

    fn read_log(&self, log: &str) -> Result<String> {
        let path = self.log_path(log)?;
        match fs::read_to_string(&path) {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn location(&self, key: &str) -> String {
        self.doc_path(key)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| key.to_string())
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// In-memory backing with the same interface as [`FsStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: Mutex<BTreeMap<String, String>>,
    logs: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.lock().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryStore {
    fn put(&self, key: &str, value: &str) -> Result<()> {
        split_key(key)?;
        let mut docs = self.docs.lock().unwrap_or_else(|p| p.into_inner());
        docs.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let docs = self.docs.lock().unwrap_or_else(|p| p.into_inner());
        Ok(docs.get(key).cloned())
    }

    fn scan(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let docs = self.docs.lock().unwrap_or_else(|p| p.into_inner());
        Ok(docs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self.scan(prefix)?.into_iter().map(|(k, _)| k).collect())
    }

    fn append_line(&self, log: &str, line: &str) -> Result<()> {
        split_key(log)?;
        let mut logs = self.logs.lock().unwrap_or_else(|p| p.into_inner());
        let entry = logs.entry(log.to_string()).or_default();
        entry.push_str(line);
        entry.push('\n');
        Ok(())
    }

    fn read_log(&self, log: &str) -> Result<String> {
        let logs = self.logs.lock().unwrap_or_else(|p| p.into_inner());
        Ok(logs.get(log).cloned().unwrap_or_default())
    }

    fn location(&self, key: &str) -> String {
        format!("memory://{key}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        n: u32,
    }

    // -------------------------------------------------------------------
    // sanitize_segment
    // -------------------------------------------------------------------

    #[test]
    fn test_sanitize_keeps_safe_chars() {
        assert_eq!(sanitize_segment("squat-v2.1_final"), "squat-v2.1_final");
    }

    #[test]
    fn test_sanitize_replaces_path_separators() {
        assert_eq!(sanitize_segment("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_segment("a b/c"), "a_b_c");
    }

    #[test]
    fn test_sanitize_empty_and_dots() {
        assert_eq!(sanitize_segment(""), "_");
        assert_eq!(sanitize_segment(".."), "_");
    }

    // -------------------------------------------------------------------
    // Stamp / KeyClock
    // -------------------------------------------------------------------

    #[test]
    fn test_stamp_key_part_is_zero_padded() {
        let s = Stamp { ts: 42, seq: 7 };
        assert_eq!(s.key_part(), "00000000042_000000007");
    }

    #[test]
    fn test_stamp_documented_key_shape() {
        let s = Stamp { ts: 1_700_000_000, seq: 3 };
        assert_eq!(format!("t_{}_s1", s.key_part()), "t_01700000000_000000003_s1");
        assert_eq!(Stamp::parse_from_name("t_01700000000_000000003_s1", "t_"), Some(s));
    }

    #[test]
    fn test_stamp_key_part_sorts_like_stamp() {
        let a = Stamp { ts: 9, seq: 10 };
        let b = Stamp { ts: 10, seq: 0 };
        assert!(a < b);
        assert!(a.key_part() < b.key_part());
    }

    #[test]
    fn test_stamp_parse_round_trip() {
        let s = Stamp { ts: 1_700_000_000, seq: 3 };
        let name = format!("t_{}_session-1", s.key_part());
        assert_eq!(Stamp::parse_from_name(&name, "t_"), Some(s));
        assert_eq!(Stamp::parse_from_name(&name, "tune_"), None);
    }

    #[test]
    fn test_clock_same_second_increments_seq() {
        let clock = KeyClock::with_source(|| 100);
        assert_eq!(clock.next(), Stamp { ts: 100, seq: 0 });
        assert_eq!(clock.next(), Stamp { ts: 100, seq: 1 });
        assert_eq!(clock.next(), Stamp { ts: 100, seq: 2 });
    }

    #[test]
    fn test_clock_never_goes_backwards() {
        use std::sync::atomic::{AtomicU64, Ordering};
        use std::sync::Arc;
        let t = Arc::new(AtomicU64::new(200));
        let src = Arc::clone(&t);
        let clock = KeyClock::with_source(move || src.load(Ordering::SeqCst));
        let a = clock.next();
        t.store(150, Ordering::SeqCst);
        let b = clock.next();
        assert!(b > a);
        assert_eq!(b.ts, 200);
    }

    #[test]
    fn test_clock_observe_bumps_future_stamps() {
        let clock = KeyClock::with_source(|| 10);
        clock.observe(Stamp { ts: 10, seq: 5 });
        assert_eq!(clock.next(), Stamp { ts: 10, seq: 6 });
    }

    #[test]
    fn test_clock_observe_ignores_older_stamp() {
        let clock = KeyClock::with_source(|| 10);
        clock.next();
        clock.next();
        clock.observe(Stamp { ts: 1, seq: 0 });
        assert_eq!(clock.next(), Stamp { ts: 10, seq: 2 });
    }

    // -------------------------------------------------------------------
    // MemoryStore
    // -------------------------------------------------------------------

    #[test]
    fn test_memory_put_get() {
        let s = MemoryStore::new();
        s.put_json("rules/tune_1", &Doc { n: 1 }).unwrap();
        assert_eq!(s.get_json::<Doc>("rules/tune_1").unwrap(), Some(Doc { n: 1 }));
        assert_eq!(s.get_json::<Doc>("rules/tune_2").unwrap(), None);
    }

    #[test]
    fn test_memory_scan_prefix_sorted() {
        let s = MemoryStore::new();
        s.put("rules/tune_2", "2").unwrap();
        s.put("rules/version_1", "v").unwrap();
        s.put("rules/tune_1", "1").unwrap();
        s.put("tests/tune_0", "x").unwrap();
        let keys = s.keys("rules/tune_").unwrap();
        assert_eq!(keys, vec!["rules/tune_1", "rules/tune_2"]);
    }

    #[test]
    fn test_memory_rejects_key_without_area() {
        let s = MemoryStore::new();
        assert!(s.put("noarea", "{}").is_err());
    }

    #[test]
    fn test_memory_log_appends_lines() {
        let s = MemoryStore::new();
        s.append_line("rules/rollback.log", "a").unwrap();
        s.append_line("rules/rollback.log", "b").unwrap();
        assert_eq!(s.read_log("rules/rollback.log").unwrap(), "a\nb\n");
        assert_eq!(s.read_log("rules/other.log").unwrap(), "");
    }

    // -------------------------------------------------------------------
    // FsStore
    // -------------------------------------------------------------------

    #[test]
    fn test_fs_put_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let s = FsStore::open(dir.path()).unwrap();
        s.put_json("experiments/exp_1_a", &Doc { n: 9 }).unwrap();
        assert!(dir.path().join("experiments/exp_1_a.json").exists());
        assert_eq!(s.get_json::<Doc>("experiments/exp_1_a").unwrap(), Some(Doc { n: 9 }));
    }

    #[test]
    fn test_fs_get_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let s = FsStore::open(dir.path()).unwrap();
        assert_eq!(s.get("rules/none").unwrap(), None);
    }

    #[test]
    fn test_fs_put_overwrites_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let s = FsStore::open(dir.path()).unwrap();
        s.put("rules/tune_1", "{\"n\":1}").unwrap();
        s.put("rules/tune_1", "{\"n\":2}").unwrap();
        assert_eq!(s.get("rules/tune_1").unwrap().as_deref(), Some("{\"n\":2}"));
        let count = fs::read_dir(dir.path().join("rules")).unwrap().count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_fs_keys_ignores_non_json_and_other_prefixes() {
        let dir = tempfile::tempdir().unwrap();
        let s = FsStore::open(dir.path()).unwrap();
        s.put("telemetry/t_2", "{}").unwrap();
        s.put("telemetry/t_1", "{}").unwrap();
        s.append_line("telemetry/rolling.jsonl", "{}").unwrap();
        s.put("telemetry/x_1", "{}").unwrap();
        assert_eq!(s.keys("telemetry/t_").unwrap(), vec!["telemetry/t_1", "telemetry/t_2"]);
    }

    #[test]
    fn test_fs_keys_missing_area_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let s = FsStore::open(dir.path()).unwrap();
        assert!(s.keys("rules/tune_").unwrap().is_empty());
    }

    #[test]
    fn test_fs_append_line_creates_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let s = FsStore::open(dir.path()).unwrap();
        s.append_line("rules/rollback.log", "1\tROLLBACK\tv1").unwrap();
        s.append_line("rules/rollback.log", "2\tROLLBACK\tv2").unwrap();
        let text = fs::read_to_string(dir.path().join("rules/rollback.log")).unwrap();
        assert_eq!(text, "1\tROLLBACK\tv1\n2\tROLLBACK\tv2\n");
    }

    #[test]
    fn test_fs_location_is_file_path() {
        let dir = tempfile::tempdir().unwrap();
        let s = FsStore::open(dir.path()).unwrap();
        let loc = s.location("rules/version_1_x");
        assert!(loc.ends_with("version_1_x.json"));
    }
}
