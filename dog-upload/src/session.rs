use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::store::CompletedPart;
use crate::{ChunkInfo, PartToken, Result, SessionId, UploadError};

/// Lifecycle of a multipart session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Committed,
    Aborted,
}

/// Backend multipart session plus the parts committed to it so far
///
/// Chunk tasks finish in any order; the part list is keyed by part number
/// behind a lock, so a retried chunk replaces its entry instead of adding one.
#[derive(Debug)]
pub struct MultipartSession {
    id: SessionId,
    key: String,
    namespace: String,
    parts: Mutex<BTreeMap<u32, PartToken>>,
    state: Mutex<SessionState>,
}

impl MultipartSession {
    pub fn new(id: SessionId, key: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            id,
            key: key.into(),
            namespace: namespace.into(),
            parts: Mutex::new(BTreeMap::new()),
            state: Mutex::new(SessionState::Open),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Record a successful part upload; returns the number of committed parts
    pub fn commit_part(&self, part_number: u32, token: PartToken) -> usize {
        let mut parts = self.parts.lock();
        parts.insert(part_number, token);
        parts.len()
    }

    /// Record a chunk marked uploaded; a chunk without a part token is not committed
    pub fn commit_chunk(&self, chunk: &ChunkInfo) -> usize {
        match &chunk.part_token {
            Some(token) if chunk.uploaded => self.commit_part(chunk.part_number(), token.clone()),
            _ => self.committed_count(),
        }
    }

    pub fn committed_count(&self) -> usize {
        self.parts.lock().len()
    }

    /// Parts in commit order, checked to be exactly `1..=expected`
    pub fn ordered_parts(&self, expected: usize) -> Result<Vec<CompletedPart>> {
        let parts = self.parts.lock();
        if parts.len() != expected {
            return Err(UploadError::Unknown(format!(
                "session {} has {} committed parts, expected {}",
                self.id,
                parts.len(),
                expected
            )));
        }

        parts
            .iter()
            .enumerate()
            .map(|(position, (&part_number, token))| {
                if part_number as usize != position + 1 {
                    return Err(UploadError::Unknown(format!(
                        "session {} is missing part {}",
                        self.id,
                        position + 1
                    )));
                }
                Ok(CompletedPart {
                    part_number,
                    token: token.clone(),
                })
            })
            .collect()
    }

    pub fn mark_committed(&self) {
        *self.state.lock() = SessionState::Committed;
    }

    pub fn mark_aborted(&self) {
        *self.state.lock() = SessionState::Aborted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn session() -> MultipartSession {
        MultipartSession::new(SessionId::new(), "u/2026/10/id/video.mp4", "uploads")
    }

    #[test]
    fn out_of_order_commits_come_back_sorted() {
        let session = session();
        session.commit_part(3, PartToken::new("c"));
        session.commit_part(1, PartToken::new("a"));
        session.commit_part(2, PartToken::new("b"));

        let parts = session.ordered_parts(3).unwrap();
        let numbers: Vec<u32> = parts.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(parts[0].token.as_str(), "a");
    }

    #[test]
    fn retried_part_replaces_its_entry() {
        let session = session();
        session.commit_part(1, PartToken::new("first"));
        assert_eq!(session.commit_part(1, PartToken::new("second")), 1);
        let parts = session.ordered_parts(1).unwrap();
        assert_eq!(parts[0].token.as_str(), "second");
    }

    #[test]
    fn only_uploaded_chunks_are_committed() {
        let session = session();
        let mut chunks = ChunkInfo::plan(25, 10);

        assert_eq!(session.commit_chunk(&chunks[0]), 0);
        chunks[0].mark_uploaded(PartToken::new("a"));
        chunks[1].mark_uploaded(PartToken::new("b"));
        assert_eq!(session.commit_chunk(&chunks[1]), 1);
        assert_eq!(session.commit_chunk(&chunks[0]), 2);

        let parts = session.ordered_parts(2).unwrap();
        assert_eq!(parts[1].token.as_str(), "b");
    }

    #[test]
    fn gaps_are_rejected() {
        let session = session();
        session.commit_part(1, PartToken::new("a"));
        session.commit_part(3, PartToken::new("c"));
        assert!(session.ordered_parts(2).is_err());
        assert!(session.ordered_parts(3).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_commits_are_serialized() {
        let session = Arc::new(session());
        let mut handles = Vec::new();
        for part in (1..=64u32).rev() {
            let session = session.clone();
            handles.push(tokio::spawn(async move {
                session.commit_part(part, PartToken::new(format!("etag-{part}")));
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(session.ordered_parts(64).unwrap().len(), 64);
        assert_eq!(session.state(), SessionState::Open);
    }
}
