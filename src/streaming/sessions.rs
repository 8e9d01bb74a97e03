//! Client session routing.
//!
//! Tracks which quality backend each streaming client is currently attached
//! to. A client moving to a different file or quality is detached from its
//! previous backend, and when the table is full the oldest client is evicted
//! the same way. The table capacity is kept below the media cache capacity
//! so a routed backend's media descriptor cannot be evicted while the client
//! still points at it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::lru::SharedError;
use crate::media::{MediaCache, MediaDescriptor, MediaKey, QualityBackend};

struct ClientSession {
    key: MediaKey,
    quality: String,
    backend: Arc<QualityBackend>,
}

struct SessionTable {
    /// Insertion order; oldest client at the front.
    order: Vec<String>,
    sessions: HashMap<String, ClientSession>,
}

/// Routes clients to quality backends through the media cache.
pub struct ClientRouter {
    media: Arc<MediaCache>,
    capacity: usize,
    table: Mutex<SessionTable>,
}

impl ClientRouter {
    pub fn new(media: Arc<MediaCache>, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            media,
            capacity,
            table: Mutex::new(SessionTable {
                order: Vec::new(),
                sessions: HashMap::new(),
            }),
        })
    }

    /// Number of tracked clients.
    pub fn client_count(&self) -> usize {
        self.table.lock().sessions.len()
    }

    /// Look up the media descriptor for `key` (used for manifests).
    pub async fn descriptor(
        &self,
        key: MediaKey,
    ) -> std::result::Result<Arc<MediaDescriptor>, SharedError> {
        self.media.get(key).await
    }

    /// Route `client_id` to the backend for `(key, quality)`.
    ///
    /// Re-routing to a different file or quality detaches the client from
    /// its previous backend. A new client arriving at a full table evicts
    /// the oldest tracked client.
    pub async fn route(
        self: &Arc<Self>,
        client_id: &str,
        key: MediaKey,
        quality: &str,
    ) -> Result<Arc<QualityBackend>> {
        let mut detached: Vec<(String, Arc<QualityBackend>)> = Vec::new();
        {
            let mut table = self.table.lock();
            if let Some(session) = table.sessions.get(client_id) {
                if session.key == key && session.quality == quality {
                    let backend = session.backend.clone();
                    touch(&mut table.order, client_id);
                    return Ok(backend);
                }
                let session = table
                    .sessions
                    .remove(client_id)
                    .expect("session checked above");
                table.order.retain(|c| c != client_id);
                detached.push((client_id.to_string(), session.backend));
            } else if table.sessions.len() >= self.capacity {
                if let Some(oldest) = table.order.first().cloned() {
                    if let Some(session) = table.sessions.remove(&oldest) {
                        tracing::info!(client = %oldest, "evicting oldest streaming client");
                        detached.push((oldest.clone(), session.backend));
                    }
                    table.order.retain(|c| c != &oldest);
                }
            }
        }

        for (old_client, backend) in detached {
            backend.remove_client(&old_client);
        }

        let descriptor = self.media.get(key.clone()).await.map_err(shared_to_owned)?;
        let backend = descriptor.backend(quality)?;

        let mut table = self.table.lock();
        table.sessions.insert(
            client_id.to_string(),
            ClientSession {
                key,
                quality: quality.to_string(),
                backend: backend.clone(),
            },
        );
        touch(&mut table.order, client_id);

        Ok(backend)
    }

    /// Drop a client's association and deregister it from its backend.
    ///
    /// Returns `false` if the client was not tracked.
    pub fn deregister(&self, client_id: &str) -> bool {
        let session = {
            let mut table = self.table.lock();
            table.order.retain(|c| c != client_id);
            table.sessions.remove(client_id)
        };
        match session {
            Some(session) => {
                session.backend.remove_client(client_id);
                true
            }
            None => false,
        }
    }
}

fn touch(order: &mut Vec<String>, client_id: &str) {
    order.retain(|c| c != client_id);
    order.push(client_id.to_string());
}

/// Construction errors come out of the media cache behind an `Arc`; turn
/// them back into an owned error for the handler layer.
fn shared_to_owned(e: SharedError) -> crate::error::Error {
    match Arc::try_unwrap(e) {
        Ok(owned) => owned,
        Err(shared) => crate::error::Error::Probe(shared.to_string()),
    }
}
