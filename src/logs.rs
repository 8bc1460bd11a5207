//! Named log sources: a bounded line buffer plus a read cursor into the
//! backing file.
//!
//! All mutation of one source (append, reset, catching up on bytes written by
//! external programs) happens under that source's lock, and events are
//! published while the lock is held, so viewers observe lines in append order.

use crate::error::{ControllerError, Result};
use crate::events::EventBroadcaster;
use crate::model::{ControllerConfig, ControllerEvent, LogSourceId};
use parking_lot::Mutex as SyncMutex;
use std::collections::{HashMap, VecDeque};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

pub const DEFAULT_CAPACITY: usize = 500;

#[derive(Debug)]
struct LogSource {
    name: LogSourceId,
    path: PathBuf,
    cursor: u64,
    buffer: VecDeque<String>,
    capacity: usize,
}

impl LogSource {
    fn push(&mut self, line: String, events: &EventBroadcaster) {
        if self.buffer.len() == self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(line.clone());
        events.publish(ControllerEvent::Log {
            source: self.name,
            line,
        });
    }

    fn tail(&self, max_lines: usize) -> Vec<String> {
        let start = self.buffer.len().saturating_sub(max_lines);
        self.buffer.iter().skip(start).cloned().collect()
    }

    fn clear(&mut self, events: &EventBroadcaster) {
        self.buffer.clear();
        self.cursor = 0;
        events.publish(ControllerEvent::LogReset { source: self.name });
    }

    /// Pull in complete lines written to the file past the cursor.
    async fn catch_up(&mut self, events: &EventBroadcaster) -> Result<usize> {
        let len = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => {
                return Err(ControllerError::io(
                    format!("stat {}", self.path.display()),
                    e,
                ))
            }
        };
        if len < self.cursor {
            // Truncated or removed behind our back.
            tracing::debug!(source = %self.name, "log file shrank; treating as reset");
            self.clear(events);
        }
        if len == self.cursor {
            return Ok(0);
        }

        let mut file = tokio::fs::File::open(&self.path)
            .await
            .map_err(|e| ControllerError::io(format!("open {}", self.path.display()), e))?;
        file.seek(SeekFrom::Start(self.cursor))
            .await
            .map_err(|e| ControllerError::io(format!("seek {}", self.path.display()), e))?;
        let mut chunk = Vec::with_capacity((len - self.cursor) as usize);
        file.take(len - self.cursor)
            .read_to_end(&mut chunk)
            .await
            .map_err(|e| ControllerError::io(format!("read {}", self.path.display()), e))?;

        // Leave a trailing partial line for the next pass.
        let Some(last_newline) = chunk.iter().rposition(|b| *b == b'\n') else {
            return Ok(0);
        };
        let complete = &chunk[..=last_newline];
        self.cursor += complete.len() as u64;

        let mut added = 0;
        for line in String::from_utf8_lossy(complete).lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            self.push(line.to_string(), events);
            added += 1;
        }
        Ok(added)
    }

    /// Release a trailing line that has no newline yet (an operator edit or a
    /// writer that died mid-line) so our own append does not glue onto it.
    /// Returns whether such a line existed.
    async fn take_partial(&mut self, events: &EventBroadcaster) -> Result<bool> {
        let len = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(ControllerError::io(
                    format!("stat {}", self.path.display()),
                    e,
                ))
            }
        };
        if len <= self.cursor {
            return Ok(false);
        }
        let mut file = tokio::fs::File::open(&self.path)
            .await
            .map_err(|e| ControllerError::io(format!("open {}", self.path.display()), e))?;
        file.seek(SeekFrom::Start(self.cursor))
            .await
            .map_err(|e| ControllerError::io(format!("seek {}", self.path.display()), e))?;
        let mut partial = Vec::with_capacity((len - self.cursor) as usize);
        file.take(len - self.cursor)
            .read_to_end(&mut partial)
            .await
            .map_err(|e| ControllerError::io(format!("read {}", self.path.display()), e))?;
        self.cursor = len;

        let text = String::from_utf8_lossy(&partial);
        let text = text.trim_end_matches('\r');
        if !text.is_empty() {
            self.push(text.to_string(), events);
        }
        Ok(true)
    }
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ControllerError::io(format!("create {}", parent.display()), e))?;
    }
    Ok(())
}

pub struct LogRegistry {
    config: ControllerConfig,
    capacity: usize,
    events: EventBroadcaster,
    sources: SyncMutex<HashMap<LogSourceId, Arc<Mutex<LogSource>>>>,
}

impl LogRegistry {
    pub fn new(config: ControllerConfig, events: EventBroadcaster) -> Self {
        Self {
            capacity: config.log_capacity.max(1),
            config,
            events,
            sources: SyncMutex::new(HashMap::new()),
        }
    }

    pub fn path(&self, name: LogSourceId) -> PathBuf {
        self.config.log_path(name)
    }

    // Sources are created on first access and live as long as the registry.
    fn source(&self, name: LogSourceId) -> Arc<Mutex<LogSource>> {
        let mut sources = self.sources.lock();
        sources
            .entry(name)
            .or_insert_with(|| {
                Arc::new(Mutex::new(LogSource {
                    name,
                    path: self.config.log_path(name),
                    cursor: 0,
                    buffer: VecDeque::with_capacity(self.capacity),
                    capacity: self.capacity,
                }))
            })
            .clone()
    }

    /// The most recent `max_lines` buffered lines, oldest first.
    pub async fn tail(&self, name: LogSourceId, max_lines: usize) -> Result<Vec<String>> {
        let source = self.source(name);
        let mut guard = source.lock().await;
        if let Err(e) = guard.catch_up(&self.events).await {
            tracing::warn!(source = %name, error = %e, "log catch-up failed during tail");
        }
        Ok(guard.tail(max_lines))
    }

    /// Append one line (or several, if it contains newlines) to the file and buffer.
    pub async fn append(&self, name: LogSourceId, line: &str) -> Result<()> {
        let source = self.source(name);
        let mut guard = source.lock().await;
        guard.catch_up(&self.events).await?;

        let lines: Vec<&str> = line.lines().map(|l| l.trim_end_matches('\r')).collect();
        if lines.is_empty() {
            return Ok(());
        }
        let mut bytes = String::new();
        if guard.take_partial(&self.events).await? {
            bytes.push('\n');
        }
        for l in &lines {
            bytes.push_str(l);
            bytes.push('\n');
        }

        ensure_parent(&guard.path).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&guard.path)
            .await
            .map_err(|e| ControllerError::io(format!("open {}", guard.path.display()), e))?;
        file.write_all(bytes.as_bytes())
            .await
            .map_err(|e| ControllerError::io(format!("write {}", guard.path.display()), e))?;
        // tokio hands the write to the blocking pool; the cursor may only move
        // once the bytes are really in the file.
        file.flush()
            .await
            .map_err(|e| ControllerError::io(format!("flush {}", guard.path.display()), e))?;
        guard.cursor = file
            .metadata()
            .await
            .map_err(|e| ControllerError::io(format!("stat {}", guard.path.display()), e))?
            .len();

        for l in lines {
            if !l.is_empty() {
                guard.push(l.to_string(), &self.events);
            }
        }
        Ok(())
    }

    /// Truncate the backing file, empty the buffer and emit `log_reset`.
    pub async fn reset(&self, name: LogSourceId) -> Result<()> {
        let source = self.source(name);
        let mut guard = source.lock().await;
        ensure_parent(&guard.path).await?;
        tokio::fs::File::create(&guard.path)
            .await
            .map_err(|e| ControllerError::io(format!("truncate {}", guard.path.display()), e))?;
        guard.clear(&self.events);
        Ok(())
    }

    pub async fn reset_all(&self) -> Result<()> {
        for name in LogSourceId::ALL {
            self.reset(name).await?;
        }
        Ok(())
    }

    /// Catch up on externally written bytes for one source.
    pub async fn sync(&self, name: LogSourceId) -> Result<usize> {
        let source = self.source(name);
        let mut guard = source.lock().await;
        guard.catch_up(&self.events).await
    }

    /// Poll every known source forever.
    pub async fn watch(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for name in LogSourceId::ALL {
                if let Err(e) = self.sync(name).await {
                    tracing::warn!(source = %name, error = %e, "log watcher failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Subscription;

    fn registry(capacity: usize) -> (tempfile::TempDir, LogRegistry, EventBroadcaster) {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = ControllerConfig::rooted_at(dir.path());
        cfg.log_capacity = capacity;
        let events = EventBroadcaster::new(1024);
        let reg = LogRegistry::new(cfg, events.clone());
        (dir, reg, events)
    }

    fn lines_for(sub: &mut Subscription, source: LogSourceId) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(ev) = sub.try_recv() {
            if let ControllerEvent::Log { source: s, line } = ev {
                if s == source {
                    out.push(line);
                }
            }
        }
        out
    }

    #[tokio::test]
    async fn tail_returns_last_lines_in_append_order() {
        let (_dir, reg, _events) = registry(5);
        for i in 0..8 {
            reg.append(LogSourceId::Poisoning, &format!("line {i}")).await.unwrap();
        }
        let tail = reg.tail(LogSourceId::Poisoning, 3).await.unwrap();
        assert_eq!(tail, vec!["line 5", "line 6", "line 7"]);

        // Bounded by capacity even when more is requested.
        let all = reg.tail(LogSourceId::Poisoning, 100).await.unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all.first().map(String::as_str), Some("line 3"));
    }

    #[tokio::test]
    async fn missing_file_tails_empty() {
        let (_dir, reg, _events) = registry(10);
        assert!(reg.tail(LogSourceId::Redaction, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reset_empties_buffer_and_file() {
        let (_dir, reg, events) = registry(10);
        reg.append(LogSourceId::Redaction, "stale").await.unwrap();
        let mut sub = events.subscribe();
        reg.reset(LogSourceId::Redaction).await.unwrap();

        assert!(reg.tail(LogSourceId::Redaction, 10).await.unwrap().is_empty());
        let on_disk = std::fs::read_to_string(reg.path(LogSourceId::Redaction)).unwrap();
        assert!(on_disk.is_empty());
        let mut saw_reset = false;
        while let Some(ev) = sub.try_recv() {
            if matches!(ev, ControllerEvent::LogReset { source: LogSourceId::Redaction }) {
                saw_reset = true;
            }
        }
        assert!(saw_reset);
    }

    #[tokio::test]
    async fn external_writes_are_picked_up_once() {
        let (_dir, reg, events) = registry(10);
        let path = reg.path(LogSourceId::Requests);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "first\nsecond\npartial").unwrap();

        let mut sub = events.subscribe();
        assert_eq!(reg.sync(LogSourceId::Requests).await.unwrap(), 2);
        assert_eq!(reg.sync(LogSourceId::Requests).await.unwrap(), 0);
        assert_eq!(
            lines_for(&mut sub, LogSourceId::Requests),
            vec!["first", "second"]
        );

        // Completing the partial line releases it.
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        std::io::Write::write_all(&mut f, b" line\n").unwrap();
        assert_eq!(reg.sync(LogSourceId::Requests).await.unwrap(), 1);
        assert_eq!(
            reg.tail(LogSourceId::Requests, 10).await.unwrap(),
            vec!["first", "second", "partial line"]
        );
    }

    #[tokio::test]
    async fn appended_lines_are_not_duplicated_by_sync() {
        let (_dir, reg, events) = registry(10);
        let mut sub = events.subscribe();
        reg.append(LogSourceId::Metrics, "a").await.unwrap();
        reg.append(LogSourceId::Metrics, "b\nc").await.unwrap();
        assert_eq!(reg.sync(LogSourceId::Metrics).await.unwrap(), 0);
        assert_eq!(lines_for(&mut sub, LogSourceId::Metrics), vec!["a", "b", "c"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn burst_of_appends_never_resets_or_duplicates() {
        for _ in 0..20 {
            let (_dir, reg, events) = registry(500);
            let mut sub = events.subscribe();
            while sub.try_recv().is_some() {}

            for i in 0..200 {
                reg.append(LogSourceId::Poisoning, &format!("line {i}")).await.unwrap();
            }
            assert_eq!(reg.sync(LogSourceId::Poisoning).await.unwrap(), 0);

            let mut logged = Vec::new();
            let mut resets = 0;
            while let Some(ev) = sub.try_recv() {
                match ev {
                    ControllerEvent::Log { line, .. } => logged.push(line),
                    ControllerEvent::LogReset { .. } => resets += 1,
                    _ => {}
                }
            }
            assert_eq!(resets, 0);
            assert_eq!(logged.len(), 200);
            assert_eq!(logged.last().map(String::as_str), Some("line 199"));
            let tail = reg.tail(LogSourceId::Poisoning, 3).await.unwrap();
            assert_eq!(tail, vec!["line 197", "line 198", "line 199"]);
        }
    }

    #[tokio::test]
    async fn append_after_dangling_partial_keeps_file_and_buffer_aligned() {
        let (_dir, reg, _events) = registry(10);
        let path = reg.path(LogSourceId::Redaction);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "partial").unwrap();

        reg.append(LogSourceId::Redaction, "ours").await.unwrap();
        assert_eq!(reg.sync(LogSourceId::Redaction).await.unwrap(), 0);

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "partial\nours\n");
        assert_eq!(
            reg.tail(LogSourceId::Redaction, 10).await.unwrap(),
            vec!["partial", "ours"]
        );
    }

    #[tokio::test]
    async fn external_truncation_resets_source() {
        let (_dir, reg, _events) = registry(10);
        reg.append(LogSourceId::Models, "one").await.unwrap();
        std::fs::write(reg.path(LogSourceId::Models), "").unwrap();
        reg.sync(LogSourceId::Models).await.unwrap();
        assert!(reg.tail(LogSourceId::Models, 10).await.unwrap().is_empty());
    }
}
