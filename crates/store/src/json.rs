//! JSON-file store
//!
//! Holds accounts, API keys and usage records in memory behind a tokio Mutex.
//! When opened with a path, state lives in two files:
//!
//! - the document (`store.json`), rewritten atomically with a temp-file +
//!   rename (0600, it holds upstream credentials):
//!
//!   ```json
//!   {"accounts": [...], "api_keys": [...]}
//!   ```
//!
//! - the usage log (`store.usage.jsonl`), one [`UsageRecord`] per line,
//!   only ever appended to.
//!
//! A mutation is staged on a copy, written, and only then applied to the live
//! state, so a failed write leaves memory matching disk. Per-request counter
//! patches skip the write and mark the document dirty; [`JsonStore::flush`]
//! (driven by [`spawn_flush_task`] and called on shutdown) writes them out.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use provider::Credential;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::models::{
    AccountPatch, ApiKeyPrincipal, HealthStatus, UpstreamAccount, UsageAggregate, UsageRecord,
};
use crate::{BoxFuture, Store};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    accounts: Vec<UpstreamAccount>,
    #[serde(default)]
    api_keys: Vec<ApiKeyPrincipal>,
}

impl Document {
    fn account_mut(&mut self, id: &str) -> Result<&mut UpstreamAccount> {
        self.accounts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| Error::NotFound(format!("account {id}")))
    }
}

struct State {
    doc: Document,
    usage: Vec<UsageRecord>,
    request_ids: HashSet<String>,
    /// Counter patches applied in memory but not yet written
    dirty: bool,
}

impl State {
    fn new(doc: Document, usage: Vec<UsageRecord>) -> Self {
        let request_ids = usage.iter().map(|r| r.request_id.clone()).collect();
        Self {
            doc,
            usage,
            request_ids,
            dirty: false,
        }
    }
}

struct StoreFiles {
    document: PathBuf,
    usage: PathBuf,
}

impl StoreFiles {
    fn new(document: PathBuf) -> Self {
        let usage = document.with_extension("usage.jsonl");
        Self { document, usage }
    }
}

pub struct JsonStore {
    files: Option<StoreFiles>,
    state: Mutex<State>,
    /// Held across file writes so snapshots land in the order they were taken.
    /// Never acquired while `state` is held.
    write_lock: Mutex<()>,
}

impl JsonStore {
    /// Store with no backing file; state is lost on drop.
    pub fn in_memory() -> Self {
        Self {
            files: None,
            state: Mutex::new(State::new(Document::default(), Vec::new())),
            write_lock: Mutex::new(()),
        }
    }

    /// Load from `path` and its usage log, creating an empty document when
    /// it does not exist.
    pub async fn open(path: PathBuf) -> Result<Self> {
        let files = StoreFiles::new(path);
        let doc = if files.document.exists() {
            let contents = tokio::fs::read_to_string(&files.document)
                .await
                .map_err(|e| Error::Io(format!("reading store file: {e}")))?;
            serde_json::from_str::<Document>(&contents)
                .map_err(|e| Error::Parse(format!("parsing store file: {e}")))?
        } else {
            info!(path = %files.document.display(), "store file not found, starting empty");
            let doc = Document::default();
            write_atomic(&files.document, &serialize(&doc)?).await?;
            doc
        };
        let usage = read_usage_log(&files.usage).await?;

        info!(
            path = %files.document.display(),
            accounts = doc.accounts.len(),
            api_keys = doc.api_keys.len(),
            usage_records = usage.len(),
            "loaded store"
        );

        Ok(Self {
            files: Some(files),
            state: Mutex::new(State::new(doc, usage)),
            write_lock: Mutex::new(()),
        })
    }

    /// Apply `mutation` to a copy of the document, write the copy, then apply
    /// it to the live state. On a failed write nothing in memory changes.
    ///
    /// `mutation` runs twice and must be deterministic. Durable mutations are
    /// serialized by `write_lock`; counter patches that slip in between the
    /// two runs commute with it.
    async fn mutate_document<T>(
        &self,
        mutation: impl Fn(&mut Document) -> Result<T>,
    ) -> Result<T> {
        let Some(files) = &self.files else {
            let mut state = self.state.lock().await;
            return mutation(&mut state.doc);
        };

        let _write = self.write_lock.lock().await;
        let (snapshot, was_dirty) = {
            let mut state = self.state.lock().await;
            let mut staged = state.doc.clone();
            mutation(&mut staged)?;
            let snapshot = serialize(&staged)?;
            (snapshot, std::mem::take(&mut state.dirty))
        };

        let written = write_atomic(&files.document, &snapshot).await;
        let mut state = self.state.lock().await;
        if let Err(e) = written {
            state.dirty |= was_dirty;
            return Err(e);
        }
        mutation(&mut state.doc)
    }

    /// Write counter updates made since the last document write. No-op when
    /// nothing is pending or the store has no backing file.
    pub async fn flush(&self) -> Result<()> {
        let Some(files) = &self.files else {
            return Ok(());
        };

        let _write = self.write_lock.lock().await;
        let snapshot = {
            let mut state = self.state.lock().await;
            if !state.dirty {
                return Ok(());
            }
            let snapshot = serialize(&state.doc)?;
            state.dirty = false;
            snapshot
        };

        if let Err(e) = write_atomic(&files.document, &snapshot).await {
            self.state.lock().await.dirty = true;
            return Err(e);
        }
        Ok(())
    }

    /// Add an account. Fails on a duplicate id.
    pub async fn insert_account(&self, account: UpstreamAccount) -> Result<()> {
        self.mutate_document(|doc| {
            if doc.accounts.iter().any(|a| a.id == account.id) {
                return Err(Error::Conflict(format!("account {} already exists", account.id)));
            }
            doc.accounts.push(account.clone());
            Ok(())
        })
        .await?;
        debug!(account_id = %account.id, "inserted account");
        Ok(())
    }

    /// Add an inbound API key. Fails on a duplicate id or hash.
    pub async fn insert_api_key(&self, key: ApiKeyPrincipal) -> Result<()> {
        self.mutate_document(|doc| {
            if doc
                .api_keys
                .iter()
                .any(|k| k.id == key.id || k.key_hash == key.key_hash)
            {
                return Err(Error::Conflict(format!("api key {} already exists", key.id)));
            }
            doc.api_keys.push(key.clone());
            Ok(())
        })
        .await?;
        debug!(key_id = %key.id, "inserted api key");
        Ok(())
    }

    /// Snapshot of stored usage records, oldest first.
    pub async fn usage_records(&self) -> Vec<UsageRecord> {
        self.state.lock().await.usage.clone()
    }
}

/// Periodically [`flush`](JsonStore::flush) pending counter updates.
pub fn spawn_flush_task(store: Arc<JsonStore>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = store.flush().await {
                warn!(error = %e, "failed to flush store counters");
            }
        }
    })
}

/// Counter patches are rebuilt from traffic anyway; they are flushed in
/// batches instead of rewriting the document per request.
fn is_counter_patch(patch: &AccountPatch) -> bool {
    matches!(patch, AccountPatch::RecordRequest { .. })
}

fn apply_patch(account: &mut UpstreamAccount, patch: AccountPatch) -> Result<()> {
    match patch {
        AccountPatch::RecordRequest { success, at_ms } => {
            account.request_count += 1;
            if success {
                account.success_count += 1;
            }
            account.last_used_at = Some(at_ms);
        }
        AccountPatch::MarkFailed => {
            account.error_count += 1;
            account.health_status = HealthStatus::Unhealthy;
        }
        AccountPatch::SetHealth(status) => {
            account.health_status = status;
        }
        AccountPatch::ReplaceOAuth {
            access_token,
            refresh_token,
            expires_at,
        } => match &mut account.credential {
            Credential::OAuth(oauth) => {
                oauth.access_token = access_token;
                oauth.refresh_token = refresh_token;
                oauth.expires_at = expires_at;
            }
            Credential::ApiKey(_) => {
                return Err(Error::InvalidPatch {
                    account_id: account.id.clone(),
                    reason: "cannot replace oauth tokens on an api-key account".into(),
                });
            }
        },
    }
    Ok(())
}

impl Store for JsonStore {
    fn find_account<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<UpstreamAccount>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.doc.accounts.iter().find(|a| a.id == id).cloned())
        })
    }

    fn list_accounts(&self) -> BoxFuture<'_, Result<Vec<UpstreamAccount>>> {
        Box::pin(async move { Ok(self.state.lock().await.doc.accounts.clone()) })
    }

    fn update_account<'a>(
        &'a self,
        id: &'a str,
        patch: AccountPatch,
    ) -> BoxFuture<'a, Result<UpstreamAccount>> {
        Box::pin(async move {
            if is_counter_patch(&patch) {
                let mut state = self.state.lock().await;
                let account = state.doc.account_mut(id)?;
                apply_patch(account, patch)?;
                let updated = account.clone();
                state.dirty = true;
                return Ok(updated);
            }

            self.mutate_document(|doc| {
                let account = doc.account_mut(id)?;
                apply_patch(account, patch.clone())?;
                Ok(account.clone())
            })
            .await
        })
    }

    fn find_api_key_by_hash<'a>(
        &'a self,
        key_hash: &'a str,
    ) -> BoxFuture<'a, Result<Option<ApiKeyPrincipal>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state
                .doc
                .api_keys
                .iter()
                .find(|k| k.key_hash == key_hash)
                .cloned())
        })
    }

    fn insert_usage(&self, records: Vec<UsageRecord>) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            let _write = self.write_lock.lock().await;
            let fresh: Vec<UsageRecord> = {
                let state = self.state.lock().await;
                let mut batch_ids = HashSet::new();
                records
                    .into_iter()
                    .filter(|record| {
                        let new = !state.request_ids.contains(&record.request_id)
                            && batch_ids.insert(record.request_id.clone());
                        if !new {
                            debug!(request_id = %record.request_id, "skipping duplicate usage record");
                        }
                        new
                    })
                    .collect()
            };
            if fresh.is_empty() {
                return Ok(0);
            }

            if let Some(files) = &self.files {
                append_usage(&files.usage, &fresh).await?;
            }

            let mut state = self.state.lock().await;
            for record in &fresh {
                state.request_ids.insert(record.request_id.clone());
            }
            let inserted = fresh.len();
            state.usage.extend(fresh);
            Ok(inserted)
        })
    }

    fn aggregate_usage<'a>(
        &'a self,
        owner_id: &'a str,
        from: u64,
        to: u64,
    ) -> BoxFuture<'a, Result<UsageAggregate>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(UsageAggregate::from_records(owner_id, from, to, &state.usage))
        })
    }

    fn usage_count(&self) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move { Ok(self.state.lock().await.usage.len()) })
    }
}

fn serialize(doc: &Document) -> Result<String> {
    serde_json::to_string_pretty(doc).map_err(|e| Error::Parse(format!("serializing store: {e}")))
}

/// Write the document atomically: temp file in the same directory, 0600, rename.
async fn write_atomic(path: &Path, json: &str) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let tmp_path = dir.join(format!(".store.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp store file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|e| Error::Io(format!("setting store file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp store file: {e}")))?;

    debug!(path = %path.display(), "persisted store");
    Ok(())
}

/// Append one JSON line per record in a single write.
async fn append_usage(path: &Path, records: &[UsageRecord]) -> Result<()> {
    let mut buf = Vec::new();
    for record in records {
        serde_json::to_writer(&mut buf, record)
            .map_err(|e| Error::Parse(format!("serializing usage record: {e}")))?;
        buf.push(b'\n');
    }

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| Error::Io(format!("opening usage log: {e}")))?;
    file.write_all(&buf)
        .await
        .map_err(|e| Error::Io(format!("appending usage log: {e}")))?;
    file.flush()
        .await
        .map_err(|e| Error::Io(format!("flushing usage log: {e}")))?;

    debug!(path = %path.display(), records = records.len(), "appended usage");
    Ok(())
}

/// Read the usage log. A torn last line from an interrupted append is
/// skipped, as are repeated request ids.
async fn read_usage_log(path: &Path) -> Result<Vec<UsageRecord>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::Io(format!("reading usage log: {e}"))),
    };

    let mut seen = HashSet::new();
    let mut records = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<UsageRecord>(line) {
            Ok(record) => {
                if seen.insert(record.request_id.clone()) {
                    records.push(record);
                }
            }
            Err(e) => warn!(line = index + 1, error = %e, "skipping unreadable usage log line"),
        }
    }
    Ok(records)
}
