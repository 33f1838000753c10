//! Builder that batches several actions into one package

use crate::action::{CudAction, CudOptions, KeyPath};
use crate::error::Result;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;

/// Receives the accumulated actions and an optional caller timestamp
pub type CommitFn =
    Arc<dyn Fn(Vec<CudAction>, Option<i64>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Accumulates actions and commits them as a single package.
///
/// `commit` does not clear the sequence, so a failed commit can be retried.
pub struct CudActionSequence {
    actions: Vec<CudAction>,
    timestamp: Option<i64>,
    commit_fn: CommitFn,
}

impl CudActionSequence {
    pub fn new(commit_fn: CommitFn, timestamp: Option<i64>) -> Self {
        Self {
            actions: Vec::new(),
            timestamp,
            commit_fn,
        }
    }

    pub fn insert(&mut self, key_path: impl Into<KeyPath>, value: Value, options: CudOptions) -> &mut Self {
        self.actions.push(CudAction::insert(key_path.into(), value, options));
        self
    }

    pub fn update(&mut self, key_path: impl Into<KeyPath>, value: Value, options: CudOptions) -> &mut Self {
        self.actions.push(CudAction::update(key_path.into(), value, options));
        self
    }

    pub fn delete(&mut self, key_path: impl Into<KeyPath>, options: CudOptions) -> &mut Self {
        self.actions.push(CudAction::delete(key_path.into(), options));
        self
    }

    pub fn actions(&self) -> &[CudAction] {
        &self.actions
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn clear(&mut self) {
        self.actions.clear();
    }

    pub async fn commit(&self) -> Result<()> {
        (self.commit_fn)(self.actions.clone(), self.timestamp).await
    }
}

impl std::fmt::Debug for CudActionSequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudActionSequence")
            .field("actions", &self.actions)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::CudType;
    use futures_util::FutureExt;
    use parking_lot::Mutex;
    use serde_json::json;

    fn recording() -> (CommitFn, Arc<Mutex<Vec<Vec<CudAction>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let commit: CommitFn = Arc::new(move |actions: Vec<CudAction>, _ts: Option<i64>| {
            sink.lock().push(actions);
            async { Ok::<_, crate::error::Error>(()) }.boxed()
        });
        (commit, seen)
    }

    #[tokio::test]
    async fn test_commit_preserves_call_order() {
        let (commit, seen) = recording();
        let mut seq = CudActionSequence::new(commit, None);
        seq.insert("a", json!(1), CudOptions::default())
            .update("b", json!(2), CudOptions::default())
            .delete("c", CudOptions::default());

        seq.commit().await.unwrap();

        let batches = seen.lock();
        let kinds: Vec<CudType> = batches[0].iter().map(|a| a.kind()).collect();
        assert_eq!(kinds, vec![CudType::Insert, CudType::Update, CudType::Delete]);
    }

    #[tokio::test]
    async fn test_commit_twice_resends_same_actions() {
        let (commit, seen) = recording();
        let mut seq = CudActionSequence::new(commit, None);
        seq.insert("a", json!(1), CudOptions::default());

        seq.commit().await.unwrap();
        seq.commit().await.unwrap();

        let batches = seen.lock();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0], batches[1]);
        assert_eq!(seq.len(), 1);
    }
}
