//! Ordered, append-only stream of chaos events.
//!
//! Every appended event gets the next sequence number; numbers are never
//! reused, even after old records are pruned. Observers can page through
//! the retained log with [`EventStream::segment`] or follow it live with
//! [`EventStream::subscribe`].

use chaos_common::ChaosEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const DEFAULT_BROADCAST_BUFFER: usize = 256;

/// An event with its position in the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChaosEventRecord {
    pub sequence: u64,
    pub event: ChaosEvent,
}

/// Query for [`EventStream::segment`].
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub max_results: Option<usize>,
    /// Resume from this sequence number (inclusive).
    pub continuation_token: Option<u64>,
}

/// A page of events.
#[derive(Debug, Clone, PartialEq)]
pub struct EventSegment {
    pub events: Vec<ChaosEventRecord>,
    /// Pass back in [`EventFilter::continuation_token`] to fetch the next page.
    pub continuation_token: Option<u64>,
}

#[derive(Clone)]
pub struct EventStream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    max_events: usize,
    log: Mutex<EventLog>,
    sender: broadcast::Sender<ChaosEventRecord>,
    persistence_path: Option<PathBuf>,
}

struct EventLog {
    records: VecDeque<ChaosEventRecord>,
    next_sequence: u64,
}

impl EventStream {
    /// In-memory stream retaining at most `max_events` records.
    pub fn new(max_events: usize) -> Self {
        Self::from_parts(max_events, VecDeque::new(), 1, None)
    }

    /// Stream that appends every event to a JSONL file, reloading the
    /// retained tail of any existing file.
    pub fn with_persistence(max_events: usize, path: PathBuf) -> std::io::Result<Self> {
        let (records, next_sequence) = if path.exists() {
            Self::load_from_file(&path, max_events)?
        } else {
            (VecDeque::new(), 1)
        };
        info!(
            path = %path.display(),
            loaded = records.len(),
            "Event stream persistence enabled"
        );
        Ok(Self::from_parts(max_events, records, next_sequence, Some(path)))
    }

    fn from_parts(
        max_events: usize,
        records: VecDeque<ChaosEventRecord>,
        next_sequence: u64,
        persistence_path: Option<PathBuf>,
    ) -> Self {
        let (sender, _) = broadcast::channel(DEFAULT_BROADCAST_BUFFER);
        Self {
            inner: Arc::new(StreamInner {
                max_events: max_events.max(1),
                log: Mutex::new(EventLog {
                    records,
                    next_sequence,
                }),
                sender,
                persistence_path,
            }),
        }
    }

    fn load_from_file(
        path: &Path,
        max_events: usize,
    ) -> std::io::Result<(VecDeque<ChaosEventRecord>, u64)> {
        let reader = BufReader::new(File::open(path)?);
        let mut records = VecDeque::new();
        let mut max_sequence = 0u64;

        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ChaosEventRecord>(&line) {
                Ok(record) => {
                    max_sequence = max_sequence.max(record.sequence);
                    records.push_back(record);
                    if records.len() > max_events.max(1) {
                        records.pop_front();
                    }
                }
                Err(e) => warn!("Skipping invalid event line: {}", e),
            }
        }

        debug!("Loaded {} events from {:?}", records.len(), path);
        Ok((records, max_sequence + 1))
    }

    /// Append an event, returning its sequence number.
    pub fn append(&self, event: ChaosEvent) -> u64 {
        let mut log = self.inner.log.lock().unwrap_or_else(|e| e.into_inner());
        let record = ChaosEventRecord {
            sequence: log.next_sequence,
            event,
        };
        log.next_sequence += 1;

        debug!(
            sequence = record.sequence,
            kind = %record.event.kind(),
            "Appending chaos event"
        );

        if let Some(path) = &self.inner.persistence_path
            && let Err(e) = Self::persist(path, &record)
        {
            warn!("Failed to persist event {}: {}", record.sequence, e);
        }

        log.records.push_back(record.clone());
        while log.records.len() > self.inner.max_events {
            log.records.pop_front();
        }

        let sequence = record.sequence;
        let _ = self.inner.sender.send(record);
        sequence
    }

    fn persist(path: &Path, record: &ChaosEventRecord) -> std::io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let json = serde_json::to_string(record)?;
        writeln!(file, "{json}")
    }

    /// Rewrite the persistence file to contain only retained records.
    pub fn compact(&self) -> std::io::Result<()> {
        let Some(path) = &self.inner.persistence_path else {
            return Ok(());
        };
        let log = self.inner.log.lock().unwrap_or_else(|e| e.into_inner());
        let temp_path = path.with_extension("tmp");
        {
            let mut file = File::create(&temp_path)?;
            for record in &log.records {
                writeln!(file, "{}", serde_json::to_string(record)?)?;
            }
        }
        std::fs::rename(&temp_path, path)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChaosEventRecord> {
        self.inner.sender.subscribe()
    }

    /// All retained records, oldest first.
    pub fn records(&self) -> Vec<ChaosEventRecord> {
        let log = self.inner.log.lock().unwrap_or_else(|e| e.into_inner());
        log.records.iter().cloned().collect()
    }

    pub fn last(&self) -> Option<ChaosEventRecord> {
        let log = self.inner.log.lock().unwrap_or_else(|e| e.into_inner());
        log.records.back().cloned()
    }

    pub fn len(&self) -> usize {
        let log = self.inner.log.lock().unwrap_or_else(|e| e.into_inner());
        log.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Page through retained events matching `filter`.
    pub fn segment(&self, filter: &EventFilter) -> EventSegment {
        let log = self.inner.log.lock().unwrap_or_else(|e| e.into_inner());
        let limit = filter.max_results.unwrap_or(usize::MAX);
        let from = filter.continuation_token.unwrap_or(0);

        let mut matching = log.records.iter().filter(|r| {
            let ts = r.event.timestamp();
            r.sequence >= from
                && filter.start_time.is_none_or(|start| ts >= start)
                && filter.end_time.is_none_or(|end| ts <= end)
        });

        let events: Vec<ChaosEventRecord> = matching.by_ref().take(limit).cloned().collect();
        let continuation_token = matching.next().map(|r| r.sequence);

        EventSegment {
            events,
            continuation_token,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaos_common::{ChaosEventKind, StopReason};
    use tempfile::TempDir;

    #[test]
    fn test_sequence_numbers_increase_and_survive_pruning() {
        let stream = EventStream::new(3);
        for i in 0..5 {
            stream.append(ChaosEvent::waiting(&format!("w{i}")));
        }
        let records = stream.records();
        assert_eq!(records.len(), 3);
        assert_eq!(
            records.iter().map(|r| r.sequence).collect::<Vec<_>>(),
            vec![3, 4, 5]
        );
        assert_eq!(stream.append(ChaosEvent::stopped(StopReason::UserInitiated)), 6);
        assert!(stream.last().unwrap().event.is_stopped());
    }

    #[test]
    fn test_segment_paging() {
        let stream = EventStream::new(100);
        for i in 0..5 {
            stream.append(ChaosEvent::waiting(&format!("w{i}")));
        }

        let first = stream.segment(&EventFilter {
            max_results: Some(2),
            ..EventFilter::default()
        });
        assert_eq!(first.events.len(), 2);
        assert_eq!(first.continuation_token, Some(3));

        let second = stream.segment(&EventFilter {
            max_results: Some(10),
            continuation_token: first.continuation_token,
            ..EventFilter::default()
        });
        assert_eq!(second.events.len(), 3);
        assert_eq!(second.events[0].sequence, 3);
        assert_eq!(second.continuation_token, None);
    }

    #[test]
    fn test_segment_time_window() {
        let stream = EventStream::new(100);
        stream.append(ChaosEvent::waiting("early"));
        let cutoff = Utc::now() + chrono::Duration::hours(1);
        let segment = stream.segment(&EventFilter {
            start_time: Some(cutoff),
            ..EventFilter::default()
        });
        assert!(segment.events.is_empty());
    }

    #[tokio::test]
    async fn test_subscribers_see_appends_in_order() {
        let stream = EventStream::new(10);
        let mut rx = stream.subscribe();
        stream.append(ChaosEvent::waiting("a"));
        stream.append(ChaosEvent::test_error("b"));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(second.event.kind(), ChaosEventKind::TestError);
    }

    #[test]
    fn test_persistence_reload_continues_sequence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");

        let stream = EventStream::with_persistence(10, path.clone()).unwrap();
        stream.append(ChaosEvent::waiting("one"));
        stream.append(ChaosEvent::stopped(StopReason::UserInitiated));
        drop(stream);

        let reloaded = EventStream::with_persistence(10, path.clone()).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.last().unwrap().event.is_stopped());
        assert_eq!(reloaded.append(ChaosEvent::waiting("three")), 3);

        let small = EventStream::with_persistence(1, path).unwrap();
        assert_eq!(small.len(), 1);
        small.compact().unwrap();
    }
}
