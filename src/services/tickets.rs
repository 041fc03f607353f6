//! In-memory store of single-use download tickets.

use crate::{
    models::ticket::DownloadTicket,
    services::{
        archive::DownloadArtifact,
        error::{EngineError, EngineResult},
    },
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use std::{collections::HashMap, fs, sync::Arc};
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_TICKET_TTL_SECS: i64 = 300;

#[derive(Clone)]
pub struct TicketStore {
    tickets: Arc<Mutex<HashMap<String, DownloadTicket>>>,
    ttl: Duration,
}

impl TicketStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tickets: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    /// Grant `owner` one download of `artifact`, taken from `space_id`.
    pub fn issue(&self, owner: &str, space_id: i64, artifact: DownloadArtifact) -> DownloadTicket {
        self.collect_expired();

        let mut raw = Uuid::new_v4().into_bytes().to_vec();
        raw.extend_from_slice(Uuid::new_v4().as_bytes());
        let ticket = DownloadTicket {
            token: URL_SAFE_NO_PAD.encode(raw),
            owner: owner.to_string(),
            space_id,
            file_path: artifact.path,
            file_name: artifact.file_name,
            content_type: artifact.content_type,
            content_size: artifact.size,
            remove_after_use: artifact.temporary,
            expires_at: Utc::now() + self.ttl,
        };
        self.tickets.lock().insert(ticket.token.clone(), ticket.clone());
        debug!(owner, file = %ticket.file_name, "issued download ticket");
        ticket
    }

    /// Consume a ticket. Only its owner may redeem it, and only once.
    pub fn redeem(&self, token: &str, owner: &str) -> EngineResult<DownloadTicket> {
        self.collect_expired();

        let mut tickets = self.tickets.lock();
        match tickets.get(token) {
            None => Err(EngineError::NotFound("download ticket".into())),
            Some(ticket) if ticket.owner != owner => {
                warn!(owner, "download ticket presented by someone else");
                Err(EngineError::denied("download ticket belongs to another user"))
            }
            Some(_) => tickets
                .remove(token)
                .ok_or_else(|| EngineError::NotFound("download ticket".into())),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.tickets.lock().len()
    }

    fn collect_expired(&self) {
        let now = Utc::now();
        let expired: Vec<DownloadTicket> = {
            let mut tickets = self.tickets.lock();
            let tokens: Vec<String> = tickets
                .values()
                .filter(|t| t.is_expired(now))
                .map(|t| t.token.clone())
                .collect();
            tokens.iter().filter_map(|t| tickets.remove(t)).collect()
        };

        for ticket in expired {
            debug!(file = %ticket.file_name, "download ticket expired");
            if ticket.remove_after_use {
                if let Err(err) = fs::remove_file(&ticket.file_path) {
                    warn!("failed to remove expired download {}: {}", ticket.file_path.display(), err);
                }
            }
        }
    }
}

impl Default for TicketStore {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_TICKET_TTL_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn artifact(path: PathBuf, temporary: bool) -> DownloadArtifact {
        DownloadArtifact {
            path,
            file_name: "bundle.zip".into(),
            content_type: "application/zip".into(),
            size: 3,
            temporary,
        }
    }

    #[test]
    fn tickets_are_single_use_and_owner_bound() {
        let store = TicketStore::default();
        let ticket = store.issue("alice", 1, artifact(PathBuf::from("/tmp/x"), false));

        assert!(matches!(
            store.redeem(&ticket.token, "bob"),
            Err(EngineError::AccessDenied(_))
        ));
        let redeemed = store.redeem(&ticket.token, "alice").unwrap();
        assert_eq!(redeemed.file_name, "bundle.zip");
        assert!(matches!(
            store.redeem(&ticket.token, "alice"),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn expired_tickets_drop_their_temp_files() {
        let dir = tempdir().unwrap();
        let zip = dir.path().join("tmp.zip");
        fs::write(&zip, "zip").unwrap();

        let store = TicketStore::new(Duration::seconds(-1));
        let ticket = store.issue("alice", 1, artifact(zip.clone(), true));
        assert!(store.redeem(&ticket.token, "alice").is_err());
        assert!(!zip.exists());
        assert_eq!(store.len(), 0);
    }
}
