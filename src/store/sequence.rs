//! Pending/settled sequences and their expiring store

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use super::{current_timestamp, Clock, KeyValueStore, StoreError, StoreResult};
use crate::types::{Participant, RelayProtocolOptions};

/// Anything with an absolute expiry, unix seconds
pub trait Expirable {
    /// Expiry timestamp
    fn expiry(&self) -> u64;
}

/// Progress of a pending sequence
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingStatus {
    /// Created locally, waiting for the peer
    Proposed,
    /// Received from the peer, answer in flight
    Responded,
}

/// Pending half of a sequence
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pending<P> {
    /// The proposal being negotiated
    pub proposal: P,
    /// Which side of the handshake we are on
    pub status: PendingStatus,
}

/// Sequence state; a sequence is either pending or settled, never both
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceState<P, S> {
    /// Handshake in progress
    Pending(Pending<P>),
    /// Handshake complete
    Settled(S),
}

/// A pairing or session as persisted
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sequence<P, S> {
    /// Topic the sequence lives on
    pub topic: String,
    /// Relay protocol
    pub relay: RelayProtocolOptions,
    /// Our side
    #[serde(rename = "self")]
    pub self_participant: Participant,
    /// Absolute expiry, unix seconds
    pub expiry: u64,
    /// Pending or settled data
    pub state: SequenceState<P, S>,
}

impl<P, S> Sequence<P, S> {
    /// Whether the handshake completed
    pub fn is_settled(&self) -> bool {
        matches!(self.state, SequenceState::Settled(_))
    }

    /// Settled data, if settled
    pub fn settled(&self) -> Option<&S> {
        match &self.state {
            SequenceState::Settled(settled) => Some(settled),
            SequenceState::Pending(_) => None,
        }
    }

    /// Pending data, if pending
    pub fn pending(&self) -> Option<&Pending<P>> {
        match &self.state {
            SequenceState::Pending(pending) => Some(pending),
            SequenceState::Settled(_) => None,
        }
    }
}

impl<P, S> Expirable for Sequence<P, S> {
    fn expiry(&self) -> u64 {
        self.expiry
    }
}

/// Typed, expiring view over a [`KeyValueStore`] namespace.
///
/// Reads evict expired entries, so callers never observe a sequence whose
/// expiry has passed. Evicted sequences are held until [`take_expired`]
/// so their owner can release whatever else belongs to the topic.
///
/// [`take_expired`]: SequenceStore::take_expired
pub struct SequenceStore<T> {
    storage: Arc<dyn KeyValueStore>,
    namespace: String,
    clock: Clock,
    /// Serializes every access; holds evicted sequences
    evicted: Mutex<Vec<T>>,
}

impl<T> SequenceStore<T>
where
    T: Expirable + Serialize + DeserializeOwned,
{
    /// Store under `namespace` using the system clock
    pub fn new(storage: Arc<dyn KeyValueStore>, namespace: impl Into<String>) -> Self {
        Self::with_clock(storage, namespace, Arc::new(current_timestamp))
    }

    /// Store with an injected clock
    pub fn with_clock(
        storage: Arc<dyn KeyValueStore>,
        namespace: impl Into<String>,
        clock: Clock,
    ) -> Self {
        SequenceStore {
            storage,
            namespace: namespace.into(),
            clock,
            evicted: Mutex::new(Vec::new()),
        }
    }

    /// Current time according to this store's clock
    pub fn now(&self) -> u64 {
        (self.clock)()
    }

    fn key(&self, topic: &str) -> String {
        format!("{}{}", self.namespace, topic)
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Vec<T>>> {
        self.evicted.lock().map_err(|_| StoreError::Poisoned)
    }

    fn encode(value: &T) -> StoreResult<String> {
        serde_json::to_string(value).map_err(|e| StoreError::Encode(e.to_string()))
    }

    fn decode(key: &str, raw: &str) -> StoreResult<T> {
        serde_json::from_str(raw).map_err(|e| StoreError::Decode {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    /// Live sequence at `key`; caller holds the lock
    fn load(&self, key: &str, now: u64, evicted: &mut Vec<T>) -> StoreResult<Option<T>> {
        let Some(raw) = self.storage.get(key)? else {
            return Ok(None);
        };
        let sequence = Self::decode(key, &raw)?;
        if now >= sequence.expiry() {
            debug!(key, "evicting expired sequence");
            self.storage.remove(key)?;
            evicted.push(sequence);
            return Ok(None);
        }
        Ok(Some(sequence))
    }

    /// Insert or overwrite
    pub fn set(&self, topic: &str, sequence: &T) -> StoreResult<()> {
        let raw = Self::encode(sequence)?;
        let _guard = self.lock()?;
        self.storage.set(&self.key(topic), raw)
    }

    /// Fetch a live sequence; an expired one is evicted and reported absent
    pub fn get(&self, topic: &str) -> StoreResult<Option<T>> {
        let now = self.now();
        let mut evicted = self.lock()?;
        self.load(&self.key(topic), now, &mut evicted)
    }

    /// All live sequences in this namespace, in no particular order
    pub fn get_all(&self) -> StoreResult<Vec<T>> {
        let now = self.now();
        let mut evicted = self.lock()?;
        let mut live = Vec::new();
        for key in self.storage.keys()? {
            if !key.starts_with(&self.namespace) {
                continue;
            }
            if let Some(sequence) = self.load(&key, now, &mut evicted)? {
                live.push(sequence);
            }
        }
        Ok(live)
    }

    /// Change a live sequence in place, atomically with respect to every
    /// other call on this store. `None` if `topic` is absent or expired.
    pub fn modify<R>(&self, topic: &str, change: impl FnOnce(&mut T) -> R) -> StoreResult<Option<R>> {
        let now = self.now();
        let key = self.key(topic);
        let mut evicted = self.lock()?;
        let Some(mut sequence) = self.load(&key, now, &mut evicted)? else {
            return Ok(None);
        };
        let result = change(&mut sequence);
        self.storage.set(&key, Self::encode(&sequence)?)?;
        Ok(Some(result))
    }

    /// Evict everything expired and hand back every sequence evicted so far
    pub fn take_expired(&self) -> StoreResult<Vec<T>> {
        let now = self.now();
        let mut evicted = self.lock()?;
        for key in self.storage.keys()? {
            if key.starts_with(&self.namespace) {
                self.load(&key, now, &mut evicted)?;
            }
        }
        Ok(std::mem::take(&mut *evicted))
    }

    /// Overwrite `topic`, or move it to `new_topic` when one is given
    pub fn update(&self, topic: &str, new_topic: Option<&str>, sequence: &T) -> StoreResult<()> {
        let raw = Self::encode(sequence)?;
        let _guard = self.lock()?;
        match new_topic {
            Some(new_topic) if new_topic != topic => {
                self.storage.set(&self.key(new_topic), raw)?;
                self.storage.remove(&self.key(topic))
            }
            _ => self.storage.set(&self.key(topic), raw),
        }
    }

    /// Remove `topic`; absent topics are fine
    pub fn delete(&self, topic: &str) -> StoreResult<()> {
        let _guard = self.lock()?;
        self.storage.remove(&self.key(topic))
    }
}
