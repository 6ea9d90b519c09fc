// A persisted, newest-first list of notification entries
// Shared by the system notification feed and the chat notification feed.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;

use crate::error::{RealtimeError, Result};
use crate::models::{ChatNotification, Notification};
use crate::notifications::storage::StorageAdapter;
use crate::subject::Subject;

pub trait FeedEntry: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn id(&self) -> i64;
    fn set_id(&mut self, id: i64);
    fn created_at(&self) -> DateTime<Utc>;
    fn is_read(&self) -> bool;
    fn set_read(&mut self);

    /// Same logical entry by content, used when ids cannot be trusted
    fn same_content(&self, other: &Self) -> bool;
}

impl FeedEntry for Notification {
    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn is_read(&self) -> bool {
        self.is_read
    }

    fn set_read(&mut self) {
        self.is_read = true;
    }

    fn same_content(&self, other: &Self) -> bool {
        self.message == other.message && self.created_at == other.created_at
    }
}

impl FeedEntry for ChatNotification {
    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn is_read(&self) -> bool {
        self.is_read
    }

    fn set_read(&mut self) {
        self.is_read = true;
    }

    fn same_content(&self, other: &Self) -> bool {
        self.sender_id == other.sender_id
            && self.message == other.message
            && self.created_at == other.created_at
    }
}

pub struct Feed<T: FeedEntry> {
    key: &'static str,
    entries: Subject<Vec<T>>,
}

impl<T: FeedEntry> Feed<T> {
    pub fn new(key: &'static str) -> Self {
        Feed {
            key,
            entries: Subject::new(Vec::new()),
        }
    }

    pub fn key(&self) -> &'static str {
        self.key
    }

    pub fn entries(&self) -> Vec<T> {
        self.entries.value()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<T>> {
        self.entries.subscribe()
    }

    pub fn len(&self) -> usize {
        self.entries.with(Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn unread_count(&self) -> usize {
        self.entries
            .with(|entries| entries.iter().filter(|entry| !entry.is_read()).count())
    }

    /// Read the saved blob, drop entries created at or before `cutoff` and
    /// write the pruned list back. Returns the number of entries dropped.
    /// A blob that does not parse is reported as MalformedPayload and left untouched.
    pub fn restore(&self, storage: &dyn StorageAdapter, cutoff: DateTime<Utc>) -> Result<usize> {
        let Some(blob) = storage.get(self.key)? else {
            return Ok(0);
        };
        let saved: Vec<T> = serde_json::from_str(&blob)
            .map_err(|e| RealtimeError::MalformedPayload(format!("corrupt {} blob: {}", self.key, e)))?;

        let total = saved.len();
        let kept: Vec<T> = saved
            .into_iter()
            .filter(|entry| entry.created_at() > cutoff)
            .collect();
        let pruned = total - kept.len();
        debug!("Restored {} {} entries, pruned {}", kept.len(), self.key, pruned);

        self.entries.next(kept);
        self.persist(storage);
        Ok(pruned)
    }

    /// Prepend `entry` unless it duplicates a stored one. With
    /// `explicit_id` only the id is compared; otherwise the content is, and
    /// the entry receives a fresh id derived from `now` after the check.
    pub fn push(&self, mut entry: T, explicit_id: bool, now: DateTime<Utc>, storage: &dyn StorageAdapter) -> Option<T> {
        let mut accepted = None;
        self.entries.update_if(|entries| {
            let duplicate = entries.iter().any(|known| {
                if explicit_id {
                    known.id() == entry.id()
                } else {
                    known.same_content(&entry)
                }
            });
            if duplicate {
                return false;
            }
            if !explicit_id {
                entry.set_id(next_free_id(entries, now.timestamp_millis()));
            }
            entries.insert(0, entry.clone());
            accepted = Some(entry);
            true
        });

        match accepted {
            Some(entry) => {
                self.persist(storage);
                Some(entry)
            }
            None => {
                debug!("Dropping duplicate {} entry", self.key);
                None
            }
        }
    }

    /// Mark every entry matching `predicate` as read. Returns how many changed.
    pub fn mark_read_where(&self, storage: &dyn StorageAdapter, predicate: impl Fn(&T) -> bool) -> usize {
        let mut changed = 0;
        self.entries.update_if(|entries| {
            for entry in entries.iter_mut().filter(|entry| !entry.is_read() && predicate(entry)) {
                entry.set_read();
                changed += 1;
            }
            changed > 0
        });
        if changed > 0 {
            self.persist(storage);
        }
        changed
    }

    pub fn clear(&self, storage: &dyn StorageAdapter) {
        self.entries.next(Vec::new());
        if let Err(e) = storage.remove(self.key) {
            warn!("Failed to remove {} from storage: {}", self.key, e);
        }
    }

    /// Failures are logged; the in-memory feed stays authoritative for the session
    fn persist(&self, storage: &dyn StorageAdapter) {
        let result = self
            .entries
            .with(|entries| serde_json::to_string(entries))
            .map_err(RealtimeError::from)
            .and_then(|blob| storage.set(self.key, &blob));
        if let Err(e) = result {
            warn!("Failed to persist {}: {}", self.key, e);
        }
    }
}

fn next_free_id<T: FeedEntry>(entries: &[T], candidate: i64) -> i64 {
    let mut id = candidate;
    while entries.iter().any(|entry| entry.id() == id) {
        id += 1;
    }
    id
}
