// SPDX-License-Identifier: Apache-2.0

//! Audit Log
//!
//! Every admission decision and execution failure is reported through
//! [`AuditSink`]. Sinks are fire-and-forget: nothing they do can fail the
//! pipeline. [`AuditStore`] keeps recent events in memory and can append
//! them to a rotating JSONL file. Appends reuse one open handle and a
//! running line count; the file is only read back when it is rotated.

use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::types::{AuditEvent, AuditEventKind, QueryCategory};

/// Maximum entries to keep in memory for fast access
const MEMORY_CACHE_SIZE: usize = 1000;

/// Receiver of audit events
pub trait AuditSink: Send + Sync {
    fn record_event(&self, event: &AuditEvent);
}

/// Writes audit events as structured log lines under the `audit` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record_event(&self, event: &AuditEvent) {
        let category = event.category.map(|c| c.as_str()).unwrap_or("-");
        let reason = event.reason.as_deref().unwrap_or("");
        match event.kind {
            AuditEventKind::QueryAllowed => info!(
                target: "audit",
                kind = event.kind.as_str(),
                identity = %event.identity,
                category,
                query = %event.query_preview,
                rows = event.row_count,
                "Query executed"
            ),
            AuditEventKind::QueryBlocked | AuditEventKind::QueryFailed => warn!(
                target: "audit",
                kind = event.kind.as_str(),
                identity = %event.identity,
                category,
                query = %event.query_preview,
                error_kind = event.error_kind.as_deref().unwrap_or(""),
                reason,
                "Query rejected"
            ),
        }
    }
}

/// Filter for [`AuditStore::get_entries`]
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuditQuery {
    pub limit: Option<usize>,
    pub offset: usize,
    pub kind: Option<AuditEventKind>,
    pub category: Option<QueryCategory>,
    pub identity: Option<String>,
    /// Case-insensitive substring of query text or reason
    pub search: Option<String>,
    pub from_date: Option<DateTime<Utc>>,
    pub to_date: Option<DateTime<Utc>>,
}

impl AuditQuery {
    fn matches(&self, event: &AuditEvent) -> bool {
        if self.kind.map_or(false, |kind| event.kind != kind) {
            return false;
        }
        if self.category.is_some() && event.category != self.category {
            return false;
        }
        if let Some(identity) = &self.identity {
            if &event.identity != identity {
                return false;
            }
        }
        if let Some(search) = &self.search {
            let needle = search.to_lowercase();
            let in_query = event.query.to_lowercase().contains(&needle);
            let in_reason = event
                .reason
                .as_ref()
                .map_or(false, |r| r.to_lowercase().contains(&needle));
            if !in_query && !in_reason {
                return false;
            }
        }
        if self.from_date.map_or(false, |from| event.timestamp < from) {
            return false;
        }
        if self.to_date.map_or(false, |to| event.timestamp > to) {
            return false;
        }
        true
    }
}

/// Audit log statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditStats {
    pub total: u64,
    pub allowed: u64,
    pub blocked: u64,
    pub failed: u64,
    pub last_hour: u64,
    pub last_day: u64,
    pub by_kind: HashMap<String, u64>,
    pub by_category: HashMap<String, u64>,
}

struct AuditFile {
    path: PathBuf,
    max_entries: usize,
    /// Serializes append and rotate
    state: Mutex<FileState>,
}

#[derive(Default)]
struct FileState {
    /// Lines currently in the file
    lines: usize,
    handle: Option<File>,
}

impl FileState {
    fn write_line(&mut self, path: &Path, event: &AuditEvent) -> std::io::Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let handle = match self.handle.take() {
            Some(handle) => handle,
            None => OpenOptions::new().create(true).append(true).open(path)?,
        };
        let handle = self.handle.insert(handle);
        handle.write_all(line.as_bytes())?;
        self.lines += 1;
        Ok(())
    }
}

impl AuditFile {
    fn append(&self, event: &AuditEvent) {
        let mut state = self.state.lock();
        if let Err(e) = state.write_line(&self.path, event) {
            error!("Failed to write audit log entry: {}", e);
            state.handle = None;
            return;
        }
        if state.lines <= self.max_entries {
            return;
        }

        // The rename below replaces the file under any open handle
        state.handle = None;
        let keep = self.max_entries * 3 / 4;
        match rotate_file(&self.path, keep) {
            Ok(removed) => {
                state.lines = state.lines.saturating_sub(removed);
                info!("Rotated audit log, removed {} old entries", removed);
            }
            Err(e) => error!("Failed to rotate audit log: {}", e),
        }
    }
}

/// Audit log store with optional file persistence
pub struct AuditStore {
    /// In-memory cache of recent entries
    entries: RwLock<VecDeque<AuditEvent>>,
    capacity: usize,
    file: Option<AuditFile>,
}

impl AuditStore {
    /// Memory-only store keeping the most recent `capacity` events.
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(MEMORY_CACHE_SIZE))),
            capacity: capacity.max(1),
            file: None,
        }
    }

    /// Store backed by `path`, rotated once it holds more than `max_entries`.
    pub fn with_file(path: impl Into<PathBuf>, max_entries: usize) -> Self {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                error!("Failed to create audit log directory: {}", e);
            }
        }

        let store = Self {
            entries: RwLock::new(VecDeque::with_capacity(MEMORY_CACHE_SIZE)),
            capacity: MEMORY_CACHE_SIZE,
            file: Some(AuditFile {
                path,
                max_entries: max_entries.max(1),
                state: Mutex::new(FileState::default()),
            }),
        };
        store.load_recent_entries();
        store
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.file.as_ref().map(|f| f.path.as_path())
    }

    /// Load recent entries from file into memory
    fn load_recent_entries(&self) {
        let Some(file) = &self.file else { return };
        if !file.path.exists() {
            return;
        }

        match File::open(&file.path) {
            Ok(handle) => {
                let mut entries = self.entries.write();
                let mut state = file.state.lock();
                for line in BufReader::new(handle).lines().map_while(Result::ok) {
                    state.lines += 1;
                    if let Ok(event) = serde_json::from_str::<AuditEvent>(&line) {
                        if entries.len() >= self.capacity {
                            entries.pop_front();
                        }
                        entries.push_back(event);
                    }
                }
                debug!("Loaded {} audit entries from file", entries.len());
            }
            Err(e) => warn!("Failed to load audit log file: {}", e),
        }
    }

    pub fn log(&self, event: AuditEvent) {
        if let Some(file) = &self.file {
            file.append(&event);
        }

        let mut entries = self.entries.write();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(event);
    }

    /// Recent entries, most recent first
    pub fn get_entries(&self, query: &AuditQuery) -> Vec<AuditEvent> {
        let entries = self.entries.read();
        entries
            .iter()
            .rev()
            .filter(|e| query.matches(e))
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub fn get_stats(&self) -> AuditStats {
        let entries = self.entries.read();
        let now = Utc::now();
        let last_hour = now - Duration::hours(1);
        let last_day = now - Duration::days(1);

        let mut stats = AuditStats::default();
        for entry in entries.iter() {
            stats.total += 1;
            match entry.kind {
                AuditEventKind::QueryAllowed => stats.allowed += 1,
                AuditEventKind::QueryBlocked => stats.blocked += 1,
                AuditEventKind::QueryFailed => stats.failed += 1,
            }
            if entry.timestamp >= last_hour {
                stats.last_hour += 1;
            }
            if entry.timestamp >= last_day {
                stats.last_day += 1;
            }

            *stats.by_kind.entry(entry.kind.as_str().to_string()).or_insert(0) += 1;
            let category = entry.category.map(|c| c.as_str()).unwrap_or("UNKNOWN");
            *stats.by_category.entry(category.to_string()).or_insert(0) += 1;
        }
        stats
    }

    /// Clear all audit log entries
    pub fn clear(&self) {
        self.entries.write().clear();
        if let Some(file) = &self.file {
            let mut state = file.state.lock();
            state.handle = None;
            match File::create(&file.path) {
                Ok(_) => state.lines = 0,
                Err(e) => error!("Failed to clear audit log file: {}", e),
            }
        }
        info!("Audit log cleared");
    }

    /// Export in-memory entries as a JSON array
    pub fn export(&self) -> String {
        let entries = self.entries.read();
        let entries: Vec<&AuditEvent> = entries.iter().collect();
        serde_json::to_string_pretty(&entries).unwrap_or_else(|_| "[]".to_string())
    }
}

impl AuditSink for AuditStore {
    fn record_event(&self, event: &AuditEvent) {
        self.log(event.clone());
    }
}

/// Forwards each event to several sinks in order
#[derive(Default)]
pub struct AuditFanout {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl AuditFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl AuditSink for AuditFanout {
    fn record_event(&self, event: &AuditEvent) {
        for sink in &self.sinks {
            sink.record_event(event);
        }
    }
}

/// Rewrites the file keeping only the last `keep_count` lines
fn rotate_file(path: &Path, keep_count: usize) -> std::io::Result<usize> {
    let lines: Vec<String> = BufReader::new(File::open(path)?)
        .lines()
        .map_while(Result::ok)
        .collect();

    let total = lines.len();
    if total <= keep_count {
        return Ok(0);
    }
    let skip = total - keep_count;

    let temp_path = path.with_extension("jsonl.tmp");
    {
        let mut writer = BufWriter::new(File::create(&temp_path)?);
        for line in lines.iter().skip(skip) {
            writeln!(writer, "{}", line)?;
        }
        writer.flush()?;
    }
    fs::rename(&temp_path, path)?;

    Ok(skip)
}
