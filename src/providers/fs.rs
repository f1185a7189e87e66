//! Filesystem provider: JSONL history logs plus file-backed queues.
//!
//! Layout under the root directory:
//!   instances/<instance>/<execution_id>.jsonl   one event per line
//!   orchestrator-queue.jsonl / worker-queue.jsonl / timer-queue.jsonl
//!   .locks/<queue>/<token>.json                 in-flight peek-locked items
//!   approvals/<token>.json                      correlation records
//!
//! Queue files are rewritten atomically (tmp file then rename). A lock file
//! holds the full item, so items locked by a crashed process are recovered
//! back into their queue on the next startup. All steady-state io goes
//! through `tokio::fs`; only startup recovery, which runs before any
//! dispatcher task exists, uses blocking io.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::providers::{
    completion_key, dedup_on_enqueue, CorrelationRecord, CorrelationStore, HistoryStore, QueueKind,
    WorkItem,
};
use crate::Event;

fn queue_file_name(kind: QueueKind) -> &'static str {
    match kind {
        QueueKind::Orchestrator => "orchestrator-queue.jsonl",
        QueueKind::Worker => "worker-queue.jsonl",
        QueueKind::Timer => "timer-queue.jsonl",
    }
}

fn lock_dir_name(kind: QueueKind) -> &'static str {
    match kind {
        QueueKind::Orchestrator => "orchestrator",
        QueueKind::Worker => "worker",
        QueueKind::Timer => "timer",
    }
}

pub struct FsHistoryStore {
    root: PathBuf,
    // One lock for all file mutation; contention is not a concern at the
    // scale this provider targets.
    io: Mutex<()>,
    token_counter: AtomicU64,
}

impl FsHistoryStore {
    /// Open (and if needed create) a store rooted at `root`. Items left
    /// locked by a previous process are returned to their queues here.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, String> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join("instances")).map_err(|e| format!("create store root: {e}"))?;
        for kind in [QueueKind::Orchestrator, QueueKind::Worker, QueueKind::Timer] {
            std::fs::create_dir_all(root.join(".locks").join(lock_dir_name(kind)))
                .map_err(|e| format!("create lock dir: {e}"))?;
        }
        let store = Self {
            root,
            io: Mutex::new(()),
            token_counter: AtomicU64::new(1),
        };
        store.recover_locked_items()?;
        Ok(store)
    }

    fn next_token(&self) -> String {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        format!("fs-{nanos:x}-{}", self.token_counter.fetch_add(1, Ordering::Relaxed))
    }

    fn instance_dir(&self, instance: &str) -> PathBuf {
        // Sub-orchestration instance ids contain "::"; keep paths flat.
        self.root.join("instances").join(instance.replace("::", "__"))
    }

    fn queue_path(&self, kind: QueueKind) -> PathBuf {
        self.root.join(queue_file_name(kind))
    }

    fn lock_path(&self, kind: QueueKind, token: &str) -> PathBuf {
        self.root.join(".locks").join(lock_dir_name(kind)).join(format!("{token}.json"))
    }

    // Startup-only: no dispatcher is running yet, so blocking io and direct
    // queue-file edits are safe here.
    fn recover_locked_items(&self) -> Result<(), String> {
        for kind in [QueueKind::Orchestrator, QueueKind::Worker, QueueKind::Timer] {
            let dir = self.root.join(".locks").join(lock_dir_name(kind));
            let entries = std::fs::read_dir(&dir).map_err(|e| format!("read lock dir: {e}"))?;
            let mut recovered = Vec::new();
            for entry in entries {
                let path = entry.map_err(|e| format!("read lock entry: {e}"))?.path();
                let text = std::fs::read_to_string(&path).map_err(|e| format!("read lock file: {e}"))?;
                let item: WorkItem =
                    serde_json::from_str(&text).map_err(|e| format!("parse lock file {path:?}: {e}"))?;
                recovered.push(item);
                std::fs::remove_file(&path).map_err(|e| format!("remove lock file: {e}"))?;
            }
            if !recovered.is_empty() {
                tracing::warn!(
                    target: "duraflow::providers",
                    queue = lock_dir_name(kind),
                    count = recovered.len(),
                    "recovering peek-locked items from previous process"
                );
                let path = self.queue_path(kind);
                let existing = match std::fs::read_to_string(&path) {
                    Ok(text) => text,
                    Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
                    Err(e) => return Err(format!("read queue: {e}")),
                };
                let mut out = String::new();
                for item in recovered {
                    let line = serde_json::to_string(&item).map_err(|e| format!("encode queue item: {e}"))?;
                    out.push_str(&line);
                    out.push('\n');
                }
                out.push_str(&existing);
                std::fs::write(&path, out).map_err(|e| format!("write queue: {e}"))?;
            }
        }
        Ok(())
    }

    async fn read_queue(&self, kind: QueueKind) -> Result<Vec<WorkItem>, String> {
        let text = match tokio::fs::read_to_string(self.queue_path(kind)).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(format!("read queue: {e}")),
        };
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(|e| format!("parse queue line: {e}")))
            .collect()
    }

    async fn write_queue(&self, kind: QueueKind, items: &[WorkItem]) -> Result<(), String> {
        let path = self.queue_path(kind);
        let tmp = path.with_extension("jsonl.tmp");
        let mut out = String::new();
        for item in items {
            let line = serde_json::to_string(item).map_err(|e| format!("encode queue item: {e}"))?;
            out.push_str(&line);
            out.push('\n');
        }
        let mut file = tokio::fs::File::create(&tmp).await.map_err(|e| format!("create queue tmp: {e}"))?;
        file.write_all(out.as_bytes()).await.map_err(|e| format!("write queue tmp: {e}"))?;
        file.sync_all().await.map_err(|e| format!("sync queue tmp: {e}"))?;
        tokio::fs::rename(&tmp, &path).await.map_err(|e| format!("commit queue: {e}"))?;
        Ok(())
    }

    async fn latest_execution_file(&self, instance: &str) -> Option<(u64, PathBuf)> {
        let mut dir = tokio::fs::read_dir(self.instance_dir(instance)).await.ok()?;
        let mut best: Option<(u64, PathBuf)> = None;
        loop {
            let entry = match dir.next_entry().await {
                Ok(Some(entry)) => entry,
                _ => break,
            };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            else {
                continue;
            };
            if best.as_ref().map_or(true, |(b, _)| id > *b) {
                best = Some((id, path));
            }
        }
        best
    }

    async fn read_history_file(path: &Path) -> Result<Vec<Event>, String> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| format!("read history: {e}"))?;
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(|e| format!("parse history line: {e}")))
            .collect()
    }
}

#[async_trait]
impl HistoryStore for FsHistoryStore {
    async fn read(&self, instance: &str) -> Vec<Event> {
        let _g = self.io.lock().await;
        match self.latest_execution_file(instance).await {
            Some((_, path)) => Self::read_history_file(&path).await.unwrap_or_default(),
            None => Vec::new(),
        }
    }

    async fn append(&self, instance: &str, events: Vec<Event>) -> Result<(), String> {
        let _g = self.io.lock().await;
        let (path, existing) = match self.latest_execution_file(instance).await {
            Some((_, path)) => {
                let existing = Self::read_history_file(&path).await?;
                (path, existing)
            }
            None => {
                let dir = self.instance_dir(instance);
                tokio::fs::create_dir_all(&dir)
                    .await
                    .map_err(|e| format!("create instance dir: {e}"))?;
                (dir.join(format!("{}.jsonl", crate::INITIAL_EXECUTION_ID)), Vec::new())
            }
        };
        let seen: HashSet<_> = existing.iter().filter_map(completion_key).collect();
        let mut out = String::new();
        for e in events {
            if completion_key(&e).is_some_and(|k| seen.contains(&k)) {
                continue;
            }
            let line = serde_json::to_string(&e).map_err(|e| format!("encode event: {e}"))?;
            out.push_str(&line);
            out.push('\n');
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| format!("open history: {e}"))?;
        file.write_all(out.as_bytes()).await.map_err(|e| format!("append history: {e}"))?;
        file.sync_all().await.map_err(|e| format!("sync history: {e}"))?;
        Ok(())
    }

    async fn create_instance(&self, instance: &str) -> Result<(), String> {
        let _g = self.io.lock().await;
        let dir = self.instance_dir(instance);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| format!("create instance dir: {e}"))?;
        if self.latest_execution_file(instance).await.is_none() {
            tokio::fs::File::create(dir.join(format!("{}.jsonl", crate::INITIAL_EXECUTION_ID)))
                .await
                .map_err(|e| format!("create history: {e}"))?;
        }
        Ok(())
    }

    async fn latest_execution_id(&self, instance: &str) -> Option<u64> {
        let _g = self.io.lock().await;
        self.latest_execution_file(instance).await.map(|(id, _)| id)
    }

    async fn reset_execution(
        &self,
        instance: &str,
        new_execution_id: u64,
        seed: Vec<Event>,
    ) -> Result<(), String> {
        let _g = self.io.lock().await;
        let dir = self.instance_dir(instance);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| format!("create instance dir: {e}"))?;
        // Remove superseded executions so storage stays flat no matter how
        // many times the instance continues as new.
        if let Ok(mut entries) = tokio::fs::read_dir(&dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
                    tokio::fs::remove_file(&path)
                        .await
                        .map_err(|e| format!("remove old execution: {e}"))?;
                }
            }
        }
        let path = dir.join(format!("{new_execution_id}.jsonl"));
        let mut out = String::new();
        for e in &seed {
            let line = serde_json::to_string(e).map_err(|e| format!("encode event: {e}"))?;
            out.push_str(&line);
            out.push('\n');
        }
        let mut file = tokio::fs::File::create(&path).await.map_err(|e| format!("create history: {e}"))?;
        file.write_all(out.as_bytes()).await.map_err(|e| format!("write history: {e}"))?;
        file.sync_all().await.map_err(|e| format!("sync history: {e}"))?;
        Ok(())
    }

    async fn list_instances(&self) -> Vec<String> {
        let _g = self.io.lock().await;
        let mut names = Vec::new();
        if let Ok(mut entries) = tokio::fs::read_dir(self.root.join("instances")).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.replace("__", "::"));
                }
            }
        }
        names.sort();
        names
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), String> {
        let _g = self.io.lock().await;
        let mut items = self.read_queue(kind).await?;
        if dedup_on_enqueue(&item) && items.contains(&item) {
            return Ok(());
        }
        items.push(item);
        self.write_queue(kind, &items).await
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let _g = self.io.lock().await;
        let mut items = self.read_queue(kind).await.ok()?;
        if items.is_empty() {
            return None;
        }
        let item = items.remove(0);
        let token = self.next_token();
        let lock = self.lock_path(kind, &token);
        let encoded = serde_json::to_string(&item).ok()?;
        tokio::fs::write(&lock, encoded).await.ok()?;
        self.write_queue(kind, &items).await.ok()?;
        Some((item, token))
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        let _g = self.io.lock().await;
        match tokio::fs::remove_file(self.lock_path(kind, token)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(format!("ack: unknown token {token}")),
            Err(e) => Err(format!("remove lock: {e}")),
        }
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        let _g = self.io.lock().await;
        let lock = self.lock_path(kind, token);
        let text = tokio::fs::read_to_string(&lock)
            .await
            .map_err(|_| format!("abandon: unknown token {token}"))?;
        let item: WorkItem = serde_json::from_str(&text).map_err(|e| format!("parse lock: {e}"))?;
        tokio::fs::remove_file(&lock).await.map_err(|e| format!("remove lock: {e}"))?;
        let mut items = self.read_queue(kind).await?;
        items.insert(0, item);
        self.write_queue(kind, &items).await
    }

    async fn reset(&self) {
        let _g = self.io.lock().await;
        let _ = tokio::fs::remove_dir_all(self.root.join("instances")).await;
        let _ = tokio::fs::create_dir_all(self.root.join("instances")).await;
        for kind in [QueueKind::Orchestrator, QueueKind::Worker, QueueKind::Timer] {
            let _ = tokio::fs::remove_file(self.queue_path(kind)).await;
            let dir = self.root.join(".locks").join(lock_dir_name(kind));
            let _ = tokio::fs::remove_dir_all(&dir).await;
            let _ = tokio::fs::create_dir_all(&dir).await;
        }
    }
}

/// One JSON file per outstanding token under `approvals/`. Resolution
/// deletes the file, which is what makes the token single-use.
pub struct FsCorrelationStore {
    dir: PathBuf,
    io: Mutex<()>,
}

impl FsCorrelationStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, String> {
        let dir = root.as_ref().join("approvals");
        std::fs::create_dir_all(&dir).map_err(|e| format!("create approvals dir: {e}"))?;
        Ok(Self {
            dir,
            io: Mutex::new(()),
        })
    }

    fn token_path(&self, token: &str) -> PathBuf {
        self.dir.join(format!("{token}.json"))
    }
}

#[async_trait]
impl CorrelationStore for FsCorrelationStore {
    async fn register(&self, token: &str, instance: &str) -> Result<(), String> {
        let _g = self.io.lock().await;
        let path = self.token_path(token);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => {
                let existing: CorrelationRecord =
                    serde_json::from_str(&text).map_err(|e| format!("parse record: {e}"))?;
                if existing.instance == instance {
                    // Redelivered activity attempt; the token is already in
                    // place for this instance.
                    return Ok(());
                }
                return Err(format!("correlation token already registered: {token}"));
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(format!("read record: {e}")),
        }
        let record = CorrelationRecord {
            token: token.to_string(),
            instance: instance.to_string(),
            created_at_ms: crate::wall_clock_ms(),
        };
        let encoded = serde_json::to_string(&record).map_err(|e| format!("encode record: {e}"))?;
        tokio::fs::write(&path, encoded).await.map_err(|e| format!("write record: {e}"))
    }

    async fn resolve(&self, token: &str) -> Option<String> {
        let _g = self.io.lock().await;
        let path = self.token_path(token);
        let text = tokio::fs::read_to_string(&path).await.ok()?;
        let record: CorrelationRecord = serde_json::from_str(&text).ok()?;
        tokio::fs::remove_file(&path).await.ok()?;
        Some(record.instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn locked_items_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let item = WorkItem::TimerFired {
            instance: "i1".into(),
            execution_id: 1,
            id: 3,
            fire_at_ms: 42,
        };
        {
            let store = FsHistoryStore::new(dir.path()).unwrap();
            store.enqueue_work(QueueKind::Timer, item.clone()).await.unwrap();
            let (_, _token) = store.dequeue_peek_lock(QueueKind::Timer).await.unwrap();
            // Dropped without ack, simulating a crash mid-dispatch.
        }
        let store = FsHistoryStore::new(dir.path()).unwrap();
        let (recovered, token) = store.dequeue_peek_lock(QueueKind::Timer).await.unwrap();
        assert_eq!(recovered, item);
        store.ack(QueueKind::Timer, &token).await.unwrap();
        assert!(store.dequeue_peek_lock(QueueKind::Timer).await.is_none());
    }

    #[tokio::test]
    async fn reset_execution_discards_prior_logs() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsHistoryStore::new(dir.path()).unwrap();
        store.create_instance("loop").await.unwrap();
        store
            .append(
                "loop",
                vec![Event::OrchestrationStarted {
                    event_id: 1,
                    name: "Periodic".into(),
                    input: "0".into(),
                    parent_instance: None,
                    parent_id: None,
                }],
            )
            .await
            .unwrap();
        store.reset_execution("loop", 2, Vec::new()).await.unwrap();
        assert_eq!(store.latest_execution_id("loop").await, Some(2));
        assert!(store.read("loop").await.is_empty());
    }

    #[tokio::test]
    async fn correlation_round_trip_is_single_use() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCorrelationStore::new(dir.path()).unwrap();
        store.register("tok", "i1").await.unwrap();
        store.register("tok", "i1").await.unwrap();
        assert!(store.register("tok", "i2").await.is_err());
        assert_eq!(store.resolve("tok").await.as_deref(), Some("i1"));
        assert_eq!(store.resolve("tok").await, None);
    }
}
