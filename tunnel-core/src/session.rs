//! The session table: a fixed 65536-slot map from session id to the
//! local TCP half a session forwards to, guarded by a single lock.
//!
//! This mirrors the original's `connectionPool` (`[65535]*net.Conn` plus
//! one `sync.RWMutex`) but gives every slot ownership of its socket
//! instead of a raw pointer, so a concurrent `delete` can't leave a
//! `get` holding a dangling reference.

use std::sync::Arc;

use tokio::io::WriteHalf;
use tokio::net::TcpStream;
use tokio::sync::RwLock;

const TABLE_SIZE: usize = 1 << 16;

/// Per-session state tracked by the table. The TCP write half lives
/// here so [`crate::peer`]'s inbound dispatcher can write DATA payloads
/// straight into the socket without a second lookup structure.
pub struct Session {
    pub write_half: WriteHalf<TcpStream>,
    pub destination: String,
    close_sent: bool,
}

impl Session {
    pub fn new(write_half: WriteHalf<TcpStream>, destination: String) -> Self {
        Self {
            write_half,
            destination,
            close_sent: false,
        }
    }
}

/// A dense, fixed-size table of sessions keyed by their 16-bit id.
///
/// All operations are O(1). `get`/`delete`/`set_close_sent` each take a
/// single lock acquisition; none of them hold the lock across an `.await`
/// that isn't itself the socket write.
pub struct SessionTable {
    slots: RwLock<Vec<Option<Session>>>,
}

impl SessionTable {
    pub fn new() -> Arc<Self> {
        let mut slots = Vec::with_capacity(TABLE_SIZE);
        slots.resize_with(TABLE_SIZE, || None);
        Arc::new(Self {
            slots: RwLock::new(slots),
        })
    }

    pub async fn insert(&self, session_id: u16, session: Session) {
        let mut slots = self.slots.write().await;
        slots[session_id as usize] = Some(session);
    }

    pub async fn remove(&self, session_id: u16) -> Option<Session> {
        let mut slots = self.slots.write().await;
        slots[session_id as usize].take()
    }

    pub async fn contains(&self, session_id: u16) -> bool {
        let slots = self.slots.read().await;
        slots[session_id as usize].is_some()
    }

    pub async fn is_close_sent(&self, session_id: u16) -> bool {
        let slots = self.slots.read().await;
        slots[session_id as usize]
            .as_ref()
            .map(|s| s.close_sent)
            .unwrap_or(true)
    }

    pub async fn set_close_sent(&self, session_id: u16) {
        let mut slots = self.slots.write().await;
        if let Some(session) = slots[session_id as usize].as_mut() {
            session.close_sent = true;
        }
    }

    /// Writes `payload` into the session's socket, returning `false` if
    /// the session is unknown or the write failed (caller should then
    /// emit a DELETE frame for it).
    pub async fn write_to(&self, session_id: u16, payload: &[u8]) -> bool {
        use tokio::io::AsyncWriteExt;
        let mut slots = self.slots.write().await;
        match slots[session_id as usize].as_mut() {
            Some(session) => session.write_half.write_all(payload).await.is_ok(),
            None => false,
        }
    }

    /// Removes every session, used during teardown. Returns the ids
    /// that were actually occupied, so the caller can notify the remote
    /// side with a DELETE per session if it hasn't already.
    pub async fn drain_all(&self) -> Vec<u16> {
        let mut slots = self.slots.write().await;
        let mut ids = Vec::new();
        for (idx, slot) in slots.iter_mut().enumerate() {
            if slot.take().is_some() {
                ids.push(idx as u16);
            }
        }
        ids
    }
}
