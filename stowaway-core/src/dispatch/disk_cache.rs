//! Disk-backed overflow store for records that could not be sent
//!
//! Each spill writes one container file under `<root>/<endpoint host>/`:
//!
//! ```text
//! events_1718000000123        line 1: version tag "1"
//! events_1718000000123_1      then:   "<unix_millis> <payload>" per record
//! ```
//!
//! Containers are named after their newest record, so ordering them by the
//! parsed timestamp (then collision suffix) yields oldest-batch-first.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use reqwest::Url;

use crate::config::CacheConfig;
use crate::error::Result;

use super::record::Record;

const VERSION: &str = "1";
const CONTAINER_PREFIX: &str = "events_";

/// How long cached records stay deliverable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAge {
    /// Offline caching is off; existing containers are deleted
    Disabled,
    /// Keep records regardless of age
    Unlimited,
    /// Discard records older than this
    Limit(Duration),
}

impl CacheAge {
    /// Interpret a configured age: negative disables, zero is unlimited
    pub fn from_millis(millis: i64) -> Self {
        match millis {
            m if m < 0 => CacheAge::Disabled,
            0 => CacheAge::Unlimited,
            m => CacheAge::Limit(Duration::from_millis(m.unsigned_abs())),
        }
    }

    /// Oldest still-valid timestamp in unix millis, if age is limited
    fn cutoff_millis(self) -> Option<i64> {
        match self {
            CacheAge::Limit(age) => {
                let age = i64::try_from(age.as_millis()).unwrap_or(i64::MAX);
                Some(Utc::now().timestamp_millis().saturating_sub(age))
            }
            _ => None,
        }
    }
}

/// One container file on disk
#[derive(Debug)]
struct Container {
    path: PathBuf,
    /// Timestamp of the newest record, from the file name
    newest: i64,
    /// Collision suffix for containers sharing `newest`
    seq: u32,
    size: u64,
}

#[derive(Debug, Default)]
struct DiskState {
    containers: VecDeque<Container>,
    current_size: u64,
    swept: bool,
}

/// Durable overflow store with age and size retention.
///
/// All operations serialize on one internal lock, so at most one container
/// read or write is in progress per instance.
#[derive(Debug)]
pub struct EventDiskCache {
    dir: PathBuf,
    max_age: CacheAge,
    max_size: u64,
    state: Mutex<DiskState>,
}

impl EventDiskCache {
    /// Open the cache in `dir`, adopting containers left by a previous process
    pub fn open(dir: impl Into<PathBuf>, max_age: CacheAge, max_size: u64) -> Self {
        let dir = dir.into();
        let containers = discover_containers(&dir);
        let current_size = containers.iter().map(|c| c.size).sum();

        if !containers.is_empty() {
            tracing::debug!(
                dir = %dir.display(),
                containers = containers.len(),
                bytes = current_size,
                "Adopted cache containers"
            );
        }

        Self {
            dir,
            max_age,
            max_size,
            state: Mutex::new(DiskState {
                containers,
                current_size,
                swept: false,
            }),
        }
    }

    /// Open the cache scoped to the endpoint's host under the configured root
    pub fn for_endpoint(config: &CacheConfig, endpoint: &Url) -> Self {
        let host = endpoint.host_str().unwrap_or("unknown");
        let dir = config.root_dir().join(urlencoding::encode(host).as_ref());
        Self::open(dir, config.max_age(), config.max_size_bytes)
    }

    /// Directory holding the containers
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_age(&self) -> CacheAge {
        self.max_age
    }

    pub fn is_enabled(&self) -> bool {
        self.max_age != CacheAge::Disabled
    }

    /// Persist `records` as one new container
    pub fn cache(&self, records: &[Record]) {
        if !self.is_enabled() || records.is_empty() {
            return;
        }

        let start = Instant::now();
        let mut state = self.state.lock().unwrap();
        self.enforce_limits(&mut state);

        match self.write_container(records) {
            Ok(Some(container)) => {
                tracing::debug!(
                    records = records.len(),
                    path = %container.path.display(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Cached records to disk"
                );
                state.current_size += container.size;
                state.containers.push_back(container);
            }
            Ok(None) => {
                tracing::debug!(records = records.len(), "No live records to cache");
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    records = records.len(),
                    "Failed to write cache container, records lost"
                );
            }
        }
    }

    /// Read and delete every container, returning live records oldest-first
    pub fn uncache(&self) -> Vec<Record> {
        let mut records = Vec::new();
        if !self.is_enabled() {
            return records;
        }

        let start = Instant::now();
        let mut state = self.state.lock().unwrap();
        while let Some(container) = state.containers.pop_front() {
            records.extend(self.read_container(&container));
            delete_container(&container);
        }
        state.current_size = 0;
        self.enforce_limits(&mut state);

        if !records.is_empty() {
            tracing::debug!(
                records = records.len(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Uncached records from disk"
            );
        }
        records
    }

    /// Whether no containers remain; the first call runs a retention sweep
    pub fn is_empty(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if !state.swept {
            self.enforce_limits(&mut state);
            state.swept = true;
        }
        state.containers.is_empty()
    }

    /// Delete every container without reading it
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        let count = state.containers.len();
        while let Some(container) = state.containers.pop_front() {
            delete_container(&container);
        }
        state.current_size = 0;
        if count > 0 {
            tracing::debug!(containers = count, "Cleared disk cache");
        }
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().unwrap().containers.len()
    }

    /// Total size of all containers in bytes
    pub fn size_bytes(&self) -> u64 {
        self.state.lock().unwrap().current_size
    }

    // Caller holds the state lock.
    fn enforce_limits(&self, state: &mut DiskState) {
        match self.max_age {
            CacheAge::Disabled => {
                if !state.containers.is_empty() {
                    tracing::debug!("Caching is disabled, deleting containers");
                }
                while let Some(container) = state.containers.pop_front() {
                    delete_container(&container);
                }
                state.current_size = 0;
            }
            CacheAge::Limit(_) => {
                let cutoff = self.max_age.cutoff_millis().unwrap_or(i64::MIN);
                // Sorted oldest-first: stop at the first live container.
                while state
                    .containers
                    .front()
                    .is_some_and(|c| c.newest < cutoff)
                {
                    if let Some(container) = state.containers.pop_front() {
                        state.current_size = state.current_size.saturating_sub(container.size);
                        tracing::debug!(path = %container.path.display(), "Container expired");
                        delete_container(&container);
                    }
                }
            }
            CacheAge::Unlimited => {}
        }

        if self.max_size > 0 {
            while state.current_size > self.max_size {
                let Some(container) = state.containers.pop_front() else {
                    state.current_size = 0;
                    break;
                };
                state.current_size = state.current_size.saturating_sub(container.size);
                tracing::debug!(
                    path = %container.path.display(),
                    max_size = self.max_size,
                    "Cache over size limit, deleting oldest container"
                );
                delete_container(&container);
            }
        }
    }

    fn write_container(&self, records: &[Record]) -> Result<Option<Container>> {
        let cutoff = self.max_age.cutoff_millis();
        let live: Vec<&Record> = records
            .iter()
            .filter(|r| cutoff.map_or(true, |c| r.timestamp_millis() >= c))
            .filter(|r| {
                let storable = !r.payload().contains('\n');
                if !storable {
                    tracing::warn!("Dropping record with a line break in its payload");
                }
                storable
            })
            .collect();

        let Some(newest) = live.last().map(|r| r.timestamp_millis()) else {
            return Ok(None);
        };

        fs::create_dir_all(&self.dir)?;
        let (path, seq) = self.free_container_path(newest);

        let written = write_lines(&path, &live);
        if let Err(e) = written {
            let _ = fs::remove_file(&path);
            return Err(e.into());
        }

        let size = fs::metadata(&path)?.len();
        Ok(Some(Container {
            path,
            newest,
            seq,
            size,
        }))
    }

    fn free_container_path(&self, newest: i64) -> (PathBuf, u32) {
        let mut seq = 0;
        loop {
            let path = self.dir.join(container_name(newest, seq));
            if !path.exists() {
                return (path, seq);
            }
            seq += 1;
        }
    }

    fn read_container(&self, container: &Container) -> Vec<Record> {
        let mut records = Vec::new();

        let file = match File::open(&container.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return records,
            Err(e) => {
                tracing::warn!(path = %container.path.display(), error = %e, "Cannot open container");
                return records;
            }
        };

        let mut lines = BufReader::new(file).lines();
        match lines.next() {
            Some(Ok(version)) if version == VERSION => {}
            _ => {
                tracing::warn!(path = %container.path.display(), "Unknown container version");
                return records;
            }
        }

        let cutoff = self.max_age.cutoff_millis();
        for line in lines {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!(path = %container.path.display(), error = %e, "Container read failed");
                    break;
                }
            };
            let Some((timestamp, payload)) = line.split_once(' ') else {
                continue;
            };
            let Ok(timestamp) = timestamp.parse::<i64>() else {
                tracing::warn!(line = %line, "Malformed container line");
                continue;
            };
            if cutoff.is_some_and(|c| timestamp < c) {
                continue;
            }
            if let Some(captured_at) = DateTime::from_timestamp_millis(timestamp) {
                records.push(Record::at(captured_at, payload));
            }
        }

        tracing::debug!(
            records = records.len(),
            path = %container.path.display(),
            "Restored records from container"
        );
        records
    }
}

fn container_name(newest: i64, seq: u32) -> String {
    if seq == 0 {
        format!("{}{}", CONTAINER_PREFIX, newest)
    } else {
        format!("{}{}_{}", CONTAINER_PREFIX, newest, seq)
    }
}

/// Parse `events_<millis>[_<seq>]`
fn parse_container_name(name: &str) -> Option<(i64, u32)> {
    let rest = name.strip_prefix(CONTAINER_PREFIX)?;
    match rest.split_once('_') {
        Some((newest, seq)) => Some((newest.parse().ok()?, seq.parse().ok()?)),
        None => Some((rest.parse().ok()?, 0)),
    }
}

fn write_lines(path: &Path, records: &[&Record]) -> std::io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "{}", VERSION)?;
    for record in records {
        writeln!(out, "{} {}", record.timestamp_millis(), record.payload())?;
    }
    out.flush()
}

fn delete_container(container: &Container) {
    match fs::remove_file(&container.path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(
                path = %container.path.display(),
                error = %e,
                "Failed to delete cache container"
            );
        }
    }
}

/// List existing containers, sorted oldest-first by parsed name
fn discover_containers(dir: &Path) -> VecDeque<Container> {
    let pattern = format!(
        "{}/{}*",
        glob::Pattern::escape(&dir.to_string_lossy()),
        CONTAINER_PREFIX
    );

    let entries = match glob::glob(&pattern) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(error = %e, "Invalid cache directory pattern");
            return VecDeque::new();
        }
    };

    let mut containers: Vec<Container> = entries
        .flatten()
        .filter_map(|path| {
            let name = path.file_name()?.to_str()?;
            let Some((newest, seq)) = parse_container_name(name) else {
                tracing::debug!(path = %path.display(), "Skipping file that is not a cache container");
                return None;
            };
            let size = fs::metadata(&path).ok()?.len();
            Some(Container {
                path,
                newest,
                seq,
                size,
            })
        })
        .collect();

    containers.sort_by_key(|c| (c.newest, c.seq));
    containers.into()
}
