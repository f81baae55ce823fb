//! Flow-keyed registry of open UDP relay streams.
//!
//! The packet receive path hashes each UDP flow to a `u64` key and reuses the
//! stream registered here instead of opening a new one per datagram.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::Mutex;

use crate::transport::TunnelStream;

pub type SharedStream = Arc<Mutex<Box<dyn TunnelStream>>>;

#[derive(Default)]
pub struct StreamMap {
    streams: Mutex<FxHashMap<u64, SharedStream>>,
}

impl StreamMap {
    pub fn new() -> StreamMap {
        StreamMap::default()
    }

    /// Registers a stream for `key`, returning the one it displaced, if any.
    pub async fn insert(&self, key: u64, stream: Box<dyn TunnelStream>) -> Option<SharedStream> {
        self.streams
            .lock()
            .await
            .insert(key, Arc::new(Mutex::new(stream)))
    }

    pub async fn get(&self, key: u64) -> Option<SharedStream> {
        self.streams.lock().await.get(&key).cloned()
    }

    pub async fn remove(&self, key: u64) -> Option<SharedStream> {
        self.streams.lock().await.remove(&key)
    }

    pub async fn len(&self) -> usize {
        self.streams.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.streams.lock().await.is_empty()
    }
}
