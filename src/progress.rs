use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_PROGRESS_RETENTION: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_PROGRESS_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Starting,
    Downloading,
    Converting,
    Completed,
    Error,
    Unknown,
}

impl ProgressStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProgressStatus::Completed | ProgressStatus::Error)
    }

    pub fn can_transition_to(self, next: ProgressStatus) -> bool {
        use ProgressStatus::*;

        match (self, next) {
            (Starting | Downloading | Converting, Downloading | Converting) => true,
            (Starting | Downloading | Converting, Completed | Error) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProgressStatus::Starting => "starting",
            ProgressStatus::Downloading => "downloading",
            ProgressStatus::Converting => "converting",
            ProgressStatus::Completed => "completed",
            ProgressStatus::Error => "error",
            ProgressStatus::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub status: ProgressStatus,
    pub progress: u8,
    pub downloaded: u64,
    pub total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub start_time: DateTime<Utc>,
}

impl ProgressRecord {
    pub fn starting() -> Self {
        Self {
            status: ProgressStatus::Starting,
            progress: 0,
            downloaded: 0,
            total: 0,
            error: None,
            filename: None,
            start_time: Utc::now(),
        }
    }
}

/// `floor(received / total * 100)` capped at 100; 0 while the total is unknown.
pub fn download_percent(received: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }

    let percent = u128::from(received) * 100 / u128::from(total);
    percent.min(100) as u8
}

struct TableEntry {
    record: ProgressRecord,
    terminal_since: Option<Instant>,
    inserted_at: Instant,
}

/// Terminal records are evicted `retention` after they finished; past
/// `capacity` the oldest terminal records go first. Running jobs stay.
#[derive(Clone)]
pub struct ProgressTable {
    entries: Arc<RwLock<HashMap<Uuid, TableEntry>>>,
    retention: Duration,
    capacity: usize,
}

impl ProgressTable {
    pub fn new(retention: Duration, capacity: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            retention,
            capacity: capacity.max(1),
        }
    }

    pub fn register(&self, id: Uuid) -> ProgressWriter {
        self.insert(id, ProgressRecord::starting());
        ProgressWriter {
            table: self.clone(),
            id,
        }
    }

    /// Refuses ids that are already tracked.
    pub fn insert(&self, id: Uuid, record: ProgressRecord) -> bool {
        let now = Instant::now();
        let terminal_since = record.status.is_terminal().then_some(now);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

        if entries.contains_key(&id) {
            warn!(job_id = %id, "refusing to replace an existing progress record");
            return false;
        }

        entries.insert(
            id,
            TableEntry {
                record,
                terminal_since,
                inserted_at: now,
            },
        );
        evict_expired_entries(&mut entries, self.retention, now);
        trim_to_capacity(&mut entries, self.capacity);
        true
    }

    pub fn get(&self, id: &Uuid) -> Option<ProgressRecord> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|entry| entry.record.clone())
    }

    // Terminal records are frozen; progress never goes backwards.
    pub fn update<F>(&self, id: &Uuid, change: F) -> bool
    where
        F: FnOnce(&mut ProgressRecord),
    {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = entries.get_mut(id) else {
            return false;
        };

        let previous = &entry.record;
        if previous.status.is_terminal() {
            debug!(job_id = %id, status = %previous.status, "ignoring write to finished job");
            return false;
        }

        let mut next = previous.clone();
        change(&mut next);

        if next.status != previous.status && !previous.status.can_transition_to(next.status) {
            warn!(
                job_id = %id,
                from = %previous.status,
                to = %next.status,
                "rejected progress transition"
            );
            return false;
        }

        next.progress = next.progress.clamp(previous.progress, 100);
        if next.status == ProgressStatus::Completed {
            next.progress = 100;
        }
        if next.status.is_terminal() {
            entry.terminal_since = Some(Instant::now());
        }

        entry.record = next;
        true
    }

    pub fn evict_expired(&self) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        evict_expired_entries(&mut entries, self.retention, Instant::now())
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn evict_expired_entries(
    entries: &mut HashMap<Uuid, TableEntry>,
    retention: Duration,
    now: Instant,
) -> usize {
    let before = entries.len();
    entries.retain(|_, entry| match entry.terminal_since {
        Some(since) => now.saturating_duration_since(since) < retention,
        None => true,
    });
    before - entries.len()
}

fn trim_to_capacity(entries: &mut HashMap<Uuid, TableEntry>, capacity: usize) {
    if entries.len() <= capacity {
        return;
    }

    let overflow = entries.len() - capacity;
    let mut finished = entries
        .iter()
        .filter_map(|(id, entry)| entry.terminal_since.map(|_| (*id, entry.inserted_at)))
        .collect::<Vec<_>>();
    finished.sort_by_key(|(_, inserted_at)| *inserted_at);

    let evictable = finished.len().min(overflow);
    for (id, _) in finished.into_iter().take(overflow) {
        entries.remove(&id);
    }

    if evictable < overflow {
        warn!(
            active = entries.len(),
            capacity, "progress table over capacity with only running jobs"
        );
    }
}

// Clones share the job's one record: the byte counter and the transcoder
// callback each hold one.
#[derive(Clone)]
pub struct ProgressWriter {
    table: ProgressTable,
    id: Uuid,
}

impl ProgressWriter {
    pub fn id(&self) -> Uuid {
        self.id
    }

    // While converting only the counters move.
    pub fn bytes_received(&self, downloaded: u64, total: u64) -> bool {
        self.table.update(&self.id, |record| {
            record.downloaded = downloaded;
            record.total = total;
            if record.status != ProgressStatus::Converting {
                record.status = ProgressStatus::Downloading;
                record.progress = download_percent(downloaded, total);
            }
        })
    }

    pub fn converting(&self) -> bool {
        self.table.update(&self.id, |record| {
            record.status = ProgressStatus::Converting;
        })
    }

    pub fn convert_progress(&self, percent: f64) -> bool {
        self.table.update(&self.id, |record| {
            if record.status == ProgressStatus::Converting {
                record.progress = percent.floor().clamp(0.0, 100.0) as u8;
            }
        })
    }

    pub fn complete(&self, filename: impl Into<String>) -> bool {
        let filename = filename.into();
        self.table.update(&self.id, |record| {
            record.status = ProgressStatus::Completed;
            record.progress = 100;
            record.filename = Some(filename);
        })
    }

    pub fn fail(&self, message: impl Into<String>) -> bool {
        let message = message.into();
        self.table.update(&self.id, |record| {
            record.status = ProgressStatus::Error;
            record.error = Some(message);
        })
    }
}
