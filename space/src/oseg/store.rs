//! The abstract key/value backing store behind the object directory. All
//! operations are asynchronous: a submission is correlated with its reply
//! by token, and replies surface on the next poll, never inline. The
//! in-memory implementation doubles as the `local` backend and as the
//! shared directory for several servers in one process.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;

pub type StoreToken = u64;

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum StoreRequest {
    Get { key: String },
    SetNx { key: String, value: String },
    Set { key: String, value: String },
    Del { key: String },
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum StoreResponse {
    /// Reply to Get
    Value(Option<String>),
    /// Reply to SetNx: whether this submission created the key
    SetNx { won: bool },
    /// Reply to Set / Del
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Backing store unavailable")]
    Unavailable,
    #[error("Backing store operation timed out")]
    Timeout,
}

/// The directory's contract with its backing store.
pub trait KeyValueStore: Send {
    fn submit(&mut self, token: StoreToken, request: StoreRequest);
    fn poll(&mut self) -> Vec<(StoreToken, Result<StoreResponse, StoreError>)>;
}

type SharedMap = Arc<Mutex<HashMap<String, String>>>;

/// In-process backing store. Submissions execute against the (possibly
/// shared) map immediately, but replies are queued and only delivered on
/// the next poll so callers experience the same asynchrony a networked
/// store imposes.
pub struct MemoryStore {
    data: SharedMap,
    replies: VecDeque<(StoreToken, Result<StoreResponse, StoreError>)>,
    /// While raised, submissions fail instead of executing. Shared so an
    /// outage can be injected after the store has been handed off.
    unavailable: Arc<AtomicBool>,
    /// Replies held back until released; lets tests order completions
    /// around other activity.
    pub hold_replies: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_map(Arc::new(Mutex::new(HashMap::new())))
    }

    /// A store view over a shared map, so multiple servers resolve against
    /// one directory.
    pub fn with_map(data: SharedMap) -> Self {
        Self {
            data,
            replies: VecDeque::new(),
            unavailable: Arc::new(AtomicBool::new(false)),
            hold_replies: false,
        }
    }

    pub fn shared_map(&self) -> SharedMap {
        self.data.clone()
    }

    /// Flag controlling outage injection; set it to true to fail every
    /// subsequent submission.
    pub fn outage_flag(&self) -> Arc<AtomicBool> {
        self.unavailable.clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryStore {
    fn submit(&mut self, token: StoreToken, request: StoreRequest) {
        if self.unavailable.load(Ordering::Acquire) {
            self.replies.push_back((token, Err(StoreError::Unavailable)));
            return;
        }
        let mut data = self.data.lock().expect("store map poisoned");
        let response = match request {
            StoreRequest::Get { key } => StoreResponse::Value(data.get(&key).cloned()),
            StoreRequest::SetNx { key, value } => {
                if data.contains_key(&key) {
                    StoreResponse::SetNx { won: false }
                } else {
                    data.insert(key, value);
                    StoreResponse::SetNx { won: true }
                }
            }
            StoreRequest::Set { key, value } => {
                data.insert(key, value);
                StoreResponse::Done
            }
            StoreRequest::Del { key } => {
                data.remove(&key);
                StoreResponse::Done
            }
        };
        self.replies.push_back((token, Ok(response)));
    }

    fn poll(&mut self) -> Vec<(StoreToken, Result<StoreResponse, StoreError>)> {
        if self.hold_replies {
            return Vec::new();
        }
        self.replies.drain(..).collect()
    }
}
