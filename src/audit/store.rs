//! Archive stores for finalized requests and audit entries.
//!
//! Terminal approval requests (with their proofs) and ledger entries form two
//! separate durable records. Stores only append; nothing archived is ever
//! rewritten.

use crate::approval::{ApprovalRequest, RequestId};
use crate::audit::entry::AuditEntry;
use crate::audit::filter::AuditFilter;
use crate::core::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

/// Store type identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreType {
    /// Process memory
    Memory,
    /// Append-only JSON lines files
    Jsonl,
}

impl std::fmt::Display for StoreType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreType::Memory => write!(f, "memory"),
            StoreType::Jsonl => write!(f, "jsonl"),
        }
    }
}

/// Durable record of governance outcomes.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Archive a request that reached a terminal state.
    async fn archive_request(&self, request: &ApprovalRequest) -> Result<()>;

    /// Archive a ledger entry.
    async fn archive_entry(&self, entry: &AuditEntry) -> Result<()>;

    /// Load an archived request.
    async fn load_request(&self, id: &RequestId) -> Result<Option<ApprovalRequest>>;

    /// Archived entries matching a filter, in append order.
    async fn entries(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>>;

    /// Get the store type.
    fn store_type(&self) -> StoreType;

    /// Health check for the store.
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

fn ensure_terminal(request: &ApprovalRequest) -> Result<()> {
    if request.status().is_terminal() {
        Ok(())
    } else {
        Err(Error::InvalidOperation(format!(
            "request {} is still pending",
            request.id
        )))
    }
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryStore {
    requests: RwLock<Vec<ApprovalRequest>>,
    entries: RwLock<Vec<AuditEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of archived requests.
    pub async fn request_count(&self) -> usize {
        self.requests.read().await.len()
    }
}

#[async_trait]
impl ArchiveStore for MemoryStore {
    async fn archive_request(&self, request: &ApprovalRequest) -> Result<()> {
        ensure_terminal(request)?;
        let mut requests = self.requests.write().await;
        if requests.iter().any(|r| r.id == request.id) {
            return Ok(());
        }
        requests.push(request.clone());
        Ok(())
    }

    async fn archive_entry(&self, entry: &AuditEntry) -> Result<()> {
        self.entries.write().await.push(entry.clone());
        Ok(())
    }

    async fn load_request(&self, id: &RequestId) -> Result<Option<ApprovalRequest>> {
        let requests = self.requests.read().await;
        Ok(requests.iter().find(|r| &r.id == id).cloned())
    }

    async fn entries(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        Ok(filter.apply(self.entries.read().await.iter()))
    }

    fn store_type(&self) -> StoreType {
        StoreType::Memory
    }
}

/// Append-only JSON lines store: `requests.jsonl` and `audit.jsonl` under a
/// directory.
pub struct JsonlStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlStore {
    const REQUESTS: &'static str = "requests.jsonl";
    const ENTRIES: &'static str = "audit.jsonl";

    /// Open a store, creating the directory if needed.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn append_line(&self, file: &str, line: String) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut handle = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(file))
            .await?;
        handle.write_all(line.as_bytes()).await?;
        handle.write_all(b"\n").await?;
        handle.flush().await?;
        Ok(())
    }

    async fn read_lines<T: serde::de::DeserializeOwned>(&self, file: &str) -> Result<Vec<T>> {
        let path = self.dir.join(file);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(Error::from))
            .collect()
    }
}

#[async_trait]
impl ArchiveStore for JsonlStore {
    async fn archive_request(&self, request: &ApprovalRequest) -> Result<()> {
        ensure_terminal(request)?;
        self.append_line(Self::REQUESTS, serde_json::to_string(request)?)
            .await
    }

    async fn archive_entry(&self, entry: &AuditEntry) -> Result<()> {
        self.append_line(Self::ENTRIES, entry.to_json()?).await
    }

    async fn load_request(&self, id: &RequestId) -> Result<Option<ApprovalRequest>> {
        let requests: Vec<ApprovalRequest> = self.read_lines(Self::REQUESTS).await?;
        Ok(requests.into_iter().find(|r| &r.id == id))
    }

    async fn entries(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        let entries: Vec<AuditEntry> = self.read_lines(Self::ENTRIES).await?;
        Ok(filter.apply(&entries))
    }

    fn store_type(&self) -> StoreType {
        StoreType::Jsonl
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(tokio::fs::metadata(&self.dir).await?.is_dir())
    }
}
