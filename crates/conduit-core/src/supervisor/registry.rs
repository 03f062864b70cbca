//! Registry of live agent processes, used for cancellation and input.
//!
//! Entries are addressed by session identity. An identity can change while
//! the process runs (generated id -> reported id), so one entry may be
//! reachable under several keys. Rekeying adds the new key as an alias
//! under the same lock that lookups take, so a cancellation can never fall
//! between the two.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Registry-internal identifier of one spawned process.
pub type EntryId = u64;

/// Handle to one live child process.
///
/// The child itself is owned by the task pumping its output; the registry
/// only holds what cancellation and input need.
#[derive(Debug)]
pub struct ProcessEntry {
    pid: Option<u32>,
    cancel: CancellationToken,
    /// `None` unless the process was started in interactive mode.
    stdin: Mutex<Option<ChildStdin>>,
}

impl ProcessEntry {
    pub fn new(pid: Option<u32>, cancel: CancellationToken, stdin: Option<ChildStdin>) -> Self {
        Self {
            pid,
            cancel,
            stdin: Mutex::new(stdin),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the owning task to terminate the process. Does not wait.
    pub fn request_termination(&self) {
        self.cancel.cancel();
    }

    pub fn is_terminating(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Write raw bytes to the process's stdin.
    ///
    /// Returns `Ok(false)` when the process has no open stdin.
    pub async fn write_input(&self, bytes: &[u8]) -> std::io::Result<bool> {
        let mut stdin = self.stdin.lock().await;
        let Some(pipe) = stdin.as_mut() else {
            return Ok(false);
        };
        if let Err(e) = async {
            pipe.write_all(bytes).await?;
            pipe.flush().await
        }
        .await
        {
            // A broken pipe will not recover; drop it so later writes fail fast.
            stdin.take();
            return Err(e);
        }
        Ok(true)
    }

    /// Close stdin so the process sees end of input. Returns `false` if it
    /// was not open.
    pub async fn close_input(&self) -> bool {
        self.stdin.lock().await.take().is_some()
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    next_id: EntryId,
    keys: HashMap<String, EntryId>,
    entries: HashMap<EntryId, Arc<ProcessEntry>>,
}

/// Mutex-guarded map from session identity to live process.
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `entry` under `key` and return its id.
    ///
    /// Returns `None` and drops `entry` if `key` already belongs to a live
    /// process.
    pub async fn insert(&self, key: &str, entry: ProcessEntry) -> Option<EntryId> {
        let mut state = self.state.lock().await;
        if state.keys.contains_key(key) {
            return None;
        }
        state.next_id += 1;
        let id = state.next_id;
        state.keys.insert(key.to_string(), id);
        state.entries.insert(id, Arc::new(entry));
        Some(id)
    }

    /// Make the entry registered under `from` reachable as `to` as well.
    ///
    /// Returns `false` if `from` is not registered (e.g. already cancelled).
    /// A `to` already owned by another live process is left with its owner.
    pub async fn rekey(&self, from: &str, to: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(&id) = state.keys.get(from) else {
            return false;
        };
        match state.keys.get(to) {
            Some(&owner) if owner != id => {
                warn!(from, to, owner, "reported session is held by another process; keeping old key");
            }
            Some(_) => {}
            None => {
                state.keys.insert(to.to_string(), id);
            }
        }
        true
    }

    pub async fn get(&self, key: &str) -> Option<Arc<ProcessEntry>> {
        let state = self.state.lock().await;
        let id = state.keys.get(key)?;
        state.entries.get(id).cloned()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.state.lock().await.keys.contains_key(key)
    }

    /// Remove the entry reachable as `key`, along with all of its aliases.
    pub async fn remove(&self, key: &str) -> Option<Arc<ProcessEntry>> {
        let mut state = self.state.lock().await;
        let id = state.keys.remove(key)?;
        state.keys.retain(|_, entry| *entry != id);
        state.entries.remove(&id)
    }

    /// Remove an entry by id. Returns `false` if it was already gone.
    pub async fn release(&self, id: EntryId) -> bool {
        self.take(id).await.is_some()
    }

    /// Remove an entry by id along with all of its keys.
    pub async fn take(&self, id: EntryId) -> Option<Arc<ProcessEntry>> {
        let mut state = self.state.lock().await;
        state.keys.retain(|_, entry| *entry != id);
        state.entries.remove(&id)
    }

    pub async fn contains_entry(&self, id: EntryId) -> bool {
        self.state.lock().await.entries.contains_key(&id)
    }

    /// Number of live processes (not keys).
    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// All registered keys, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.lock().await.keys.keys().cloned().collect();
        keys.sort();
        keys
    }
}
