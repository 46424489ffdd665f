//! Stream metadata store.
//!
//! Scopes and streams persisted through a [`KvStore`]. Each stream is one
//! versioned row; every mutation is a read-modify-write closed by a
//! compare-and-set on the row version. A lost race re-reads and re-applies
//! the closure, so two writers on one stream serialize without any
//! in-process lock.

use crate::epoch::EpochRecord;
use crate::policy::StreamConfiguration;
use crate::record::{ResumePoint, ScaleOperation, ScaleRequest, StreamRecord};
use crate::segment::Segment;
use crate::state::StreamState;
use riverbed_common::{Error, Result, ScopedStream, SegmentId, validate_name};
use riverbed_meta_store::{KvStore, Table};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Compare-and-set attempts before a write is reported as conflicting
const MAX_CAS_ATTEMPTS: u32 = 64;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ScopeRecord {
    name: String,
    created_at: u64,
}

/// Result of a read-modify-write step
pub enum Mutation<T> {
    /// Persist the modified record, then return the value
    Write(T),
    /// Return the value without writing
    Unchanged(T),
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::Serialization(e.to_string()))
}

fn key(scope: &str, stream: &str) -> String {
    ScopedStream::new_unchecked(scope, stream).store_key()
}

/// Scope and stream metadata over a versioned key-value store
pub struct StreamMetadataStore {
    kv: Arc<dyn KvStore>,
}

impl StreamMetadataStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Backend name for logging
    pub fn backend(&self) -> &str {
        self.kv.name()
    }

    // Scopes

    pub async fn create_scope(&self, scope: &str, created_at: u64) -> Result<()> {
        validate_name(scope)?;
        let record = ScopeRecord {
            name: scope.to_string(),
            created_at,
        };
        match self.kv.create(Table::Scopes, scope, encode(&record)?).await? {
            Some(_) => {
                info!("Created scope {}", scope);
                Ok(())
            }
            None => Err(Error::ScopeAlreadyExists(scope.to_string())),
        }
    }

    pub async fn scope_exists(&self, scope: &str) -> Result<bool> {
        Ok(self.kv.get(Table::Scopes, scope).await?.is_some())
    }

    pub async fn list_scopes(&self) -> Result<Vec<String>> {
        let entries = self.kv.list(Table::Scopes, "").await?;
        entries
            .into_iter()
            .map(|(_, v)| decode::<ScopeRecord>(&v.value).map(|s| s.name))
            .collect()
    }

    // Streams

    /// Persist a new stream in CREATING with its epoch 0 segments
    pub async fn create_stream(
        &self,
        configuration: StreamConfiguration,
        created_at: u64,
    ) -> Result<StreamRecord> {
        let stream = configuration.stream.clone();
        if !self.scope_exists(stream.scope()).await? {
            return Err(Error::ScopeNotFound(stream.scope().to_string()));
        }
        let record = StreamRecord::new(configuration, created_at)?;
        match self
            .kv
            .create(Table::Streams, &stream.store_key(), encode(&record)?)
            .await?
        {
            Some(_) => {
                info!(
                    "Created stream {} with {} segment(s)",
                    stream,
                    record.current_epoch().segments.len()
                );
                Ok(record)
            }
            None => Err(Error::StreamAlreadyExists {
                scope: stream.scope().to_string(),
                stream: stream.stream().to_string(),
            }),
        }
    }

    async fn read(&self, scope: &str, stream: &str) -> Result<(u64, StreamRecord)> {
        match self.kv.get(Table::Streams, &key(scope, stream)).await? {
            Some(versioned) => Ok((versioned.version, decode(&versioned.value)?)),
            None if !self.scope_exists(scope).await? => Err(Error::ScopeNotFound(scope.to_string())),
            None => Err(Error::stream_not_found(scope, stream)),
        }
    }

    pub async fn get_stream(&self, scope: &str, stream: &str) -> Result<StreamRecord> {
        Ok(self.read(scope, stream).await?.1)
    }

    /// Every stream of `scope`, in name order
    pub async fn list_streams(&self, scope: &str) -> Result<Vec<StreamRecord>> {
        if !self.scope_exists(scope).await? {
            return Err(Error::ScopeNotFound(scope.to_string()));
        }
        let prefix = format!("{scope}/");
        let entries = self.kv.list(Table::Streams, &prefix).await?;
        entries.into_iter().map(|(_, v)| decode(&v.value)).collect()
    }

    /// Read-modify-write on one stream, retried on version conflicts
    pub async fn update<T, F>(&self, scope: &str, stream: &str, mut mutate: F) -> Result<T>
    where
        F: FnMut(&mut StreamRecord) -> Result<Mutation<T>> + Send,
        T: Send,
    {
        let key = key(scope, stream);
        for attempt in 0..MAX_CAS_ATTEMPTS {
            let (version, mut record) = self.read(scope, stream).await?;
            let value = match mutate(&mut record)? {
                Mutation::Unchanged(value) => return Ok(value),
                Mutation::Write(value) => value,
            };
            if self
                .kv
                .compare_and_set(Table::Streams, &key, version, encode(&record)?)
                .await?
                .is_some()
            {
                return Ok(value);
            }
            debug!(
                "Version conflict on {} at v{} (attempt {})",
                key,
                version,
                attempt + 1
            );
        }
        warn!("Gave up updating {} after {} conflicts", key, MAX_CAS_ATTEMPTS);
        Err(Error::WriteConflict(key))
    }

    pub async fn get_state(&self, scope: &str, stream: &str) -> Result<StreamState> {
        Ok(self.get_stream(scope, stream).await?.state())
    }

    pub async fn is_sealed(&self, scope: &str, stream: &str) -> Result<bool> {
        Ok(self.get_stream(scope, stream).await?.is_sealed())
    }

    /// Move to `state` if the state machine allows it
    pub async fn set_state(&self, scope: &str, stream: &str, state: StreamState) -> Result<()> {
        self.update(scope, stream, |record| {
            if record.state() == state {
                return Ok(Mutation::Unchanged(()));
            }
            record.transition(state)?;
            Ok(Mutation::Write(()))
        })
        .await?;
        debug!("Stream {}/{} is now {}", scope, stream, state);
        Ok(())
    }

    /// Move `expected -> new`; returns `false` if the stored state was not `expected`
    pub async fn compare_and_set_state(
        &self,
        scope: &str,
        stream: &str,
        expected: StreamState,
        new: StreamState,
    ) -> Result<bool> {
        self.update(scope, stream, |record| {
            if record.state() != expected {
                return Ok(Mutation::Unchanged(false));
            }
            record.transition(new)?;
            Ok(Mutation::Write(true))
        })
        .await
    }

    pub async fn get_active_epoch(&self, scope: &str, stream: &str) -> Result<EpochRecord> {
        Ok(self.get_stream(scope, stream).await?.current_epoch().clone())
    }

    pub async fn get_epoch(&self, scope: &str, stream: &str, epoch: u32) -> Result<EpochRecord> {
        self.get_stream(scope, stream)
            .await?
            .epoch(epoch)
            .cloned()
            .ok_or_else(|| Error::EpochNotFound {
                scope: scope.to_string(),
                stream: stream.to_string(),
                epoch,
            })
    }

    pub async fn get_segment(&self, scope: &str, stream: &str, id: SegmentId) -> Result<Segment> {
        self.get_stream(scope, stream)
            .await?
            .segment(id)
            .cloned()
            .ok_or(Error::SegmentNotFound(id))
    }

    pub async fn get_current_segments(&self, scope: &str, stream: &str) -> Result<Vec<Segment>> {
        Ok(self.get_stream(scope, stream).await?.current_segments())
    }

    pub async fn get_successors(
        &self,
        scope: &str,
        stream: &str,
        id: SegmentId,
    ) -> Result<Vec<Segment>> {
        self.get_stream(scope, stream)
            .await?
            .successors(id)
            .ok_or(Error::SegmentNotFound(id))
    }

    pub async fn get_predecessors(
        &self,
        scope: &str,
        stream: &str,
        id: SegmentId,
    ) -> Result<Vec<Segment>> {
        self.get_stream(scope, stream)
            .await?
            .predecessors(id)
            .ok_or(Error::SegmentNotFound(id))
    }

    // Scale transitions

    pub async fn start_scale(
        &self,
        scope: &str,
        stream: &str,
        request: &ScaleRequest,
        owner: &str,
    ) -> Result<ScaleOperation> {
        self.update(scope, stream, |record| {
            let was_idle = record.pending_scale().is_none();
            let op = record.start_scale(request, owner)?;
            // Re-proposals return the stored operation without a write
            if was_idle && op.resume_point == ResumePoint::Proposed {
                Ok(Mutation::Write(op))
            } else {
                Ok(Mutation::Unchanged(op))
            }
        })
        .await
    }

    pub async fn scale_new_segments_created(
        &self,
        scope: &str,
        stream: &str,
        request_id: Uuid,
    ) -> Result<()> {
        self.update(scope, stream, |record| {
            if record.scale_new_segments_created(request_id)? {
                Ok(Mutation::Write(()))
            } else {
                Ok(Mutation::Unchanged(()))
            }
        })
        .await
    }

    pub async fn scale_segments_sealed(
        &self,
        scope: &str,
        stream: &str,
        request_id: Uuid,
    ) -> Result<EpochRecord> {
        self.update(scope, stream, |record| {
            let (epoch, changed) = record.scale_segments_sealed(request_id)?;
            Ok(if changed {
                Mutation::Write(epoch)
            } else {
                Mutation::Unchanged(epoch)
            })
        })
        .await
    }

    /// Enter SEALING; `false` if already sealing or sealed
    pub async fn begin_seal(&self, scope: &str, stream: &str) -> Result<bool> {
        self.update(scope, stream, |record| {
            Ok(if record.begin_seal()? {
                Mutation::Write(true)
            } else {
                Mutation::Unchanged(false)
            })
        })
        .await
    }

    /// Commit SEALED; `false` if already sealed
    pub async fn seal(&self, scope: &str, stream: &str, sealed_at: u64) -> Result<bool> {
        self.update(scope, stream, |record| {
            Ok(if record.seal(sealed_at)? {
                Mutation::Write(true)
            } else {
                Mutation::Unchanged(false)
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ScalingPolicy;
    use crate::record::ScaleOrigin;
    use crate::segment::KeyRange;
    use riverbed_meta_store::MemoryKvStore;

    fn store() -> StreamMetadataStore {
        StreamMetadataStore::new(Arc::new(MemoryKvStore::new()))
    }

    async fn active_stream(store: &StreamMetadataStore) {
        store.create_scope("scope", 0).await.unwrap();
        let config = StreamConfiguration::new(
            ScopedStream::new("scope", "stream1").unwrap(),
            ScalingPolicy::Fixed(2),
        );
        store.create_stream(config, 0).await.unwrap();
        store
            .set_state("scope", "stream1", StreamState::Active)
            .await
            .unwrap();
    }

    fn split_one() -> ScaleRequest {
        ScaleRequest {
            request_id: Uuid::new_v4(),
            sealed_segments: vec![SegmentId::new(0, 1)],
            new_ranges: vec![
                KeyRange::new(0.5, 0.75).unwrap(),
                KeyRange::new(0.75, 1.0).unwrap(),
            ],
            scale_timestamp: 10,
            origin: ScaleOrigin::Manual,
            expected_epoch: Some(0),
        }
    }

    #[tokio::test]
    async fn test_scope_and_stream_lookup_errors() {
        let store = store();
        assert!(matches!(
            store.get_stream("nope", "s").await.unwrap_err(),
            Error::ScopeNotFound(_)
        ));
        active_stream(&store).await;
        assert!(matches!(
            store.get_stream("scope", "other").await.unwrap_err(),
            Error::StreamNotFound { .. }
        ));
        assert!(matches!(
            store.create_scope("scope", 0).await.unwrap_err(),
            Error::ScopeAlreadyExists(_)
        ));
        let config = StreamConfiguration::new(
            ScopedStream::new("scope", "stream1").unwrap(),
            ScalingPolicy::Fixed(1),
        );
        assert!(matches!(
            store.create_stream(config, 0).await.unwrap_err(),
            Error::StreamAlreadyExists { .. }
        ));
        assert!(matches!(
            store.get_epoch("scope", "stream1", 5).await.unwrap_err(),
            Error::EpochNotFound { .. }
        ));
        assert_eq!(store.list_scopes().await.unwrap(), vec!["scope".to_string()]);
        assert_eq!(store.list_streams("scope").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_state_cas() {
        let store = store();
        active_stream(&store).await;
        assert!(
            !store
                .compare_and_set_state("scope", "stream1", StreamState::Scaling, StreamState::Active)
                .await
                .unwrap()
        );
        assert!(
            store
                .compare_and_set_state("scope", "stream1", StreamState::Active, StreamState::Sealing)
                .await
                .unwrap()
        );
        assert_eq!(
            store.get_state("scope", "stream1").await.unwrap(),
            StreamState::Sealing
        );
        assert!(
            store
                .set_state("scope", "stream1", StreamState::Active)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_scale_phases_through_store() {
        let store = store();
        active_stream(&store).await;
        let request = split_one();

        let op = store
            .start_scale("scope", "stream1", &request, "host")
            .await
            .unwrap();
        // Proposing again is idempotent
        let again = store
            .start_scale("scope", "stream1", &request, "host")
            .await
            .unwrap();
        assert_eq!(op, again);

        store
            .scale_new_segments_created("scope", "stream1", request.request_id)
            .await
            .unwrap();
        let first = store
            .scale_segments_sealed("scope", "stream1", request.request_id)
            .await
            .unwrap();
        let second = store
            .scale_segments_sealed("scope", "stream1", request.request_id)
            .await
            .unwrap();
        assert_eq!(first, second);

        let active = store.get_active_epoch("scope", "stream1").await.unwrap();
        assert_eq!(active.epoch, 1);
        let successors = store
            .get_successors("scope", "stream1", SegmentId::new(0, 1))
            .await
            .unwrap();
        assert_eq!(successors.len(), 2);
        let predecessors = store
            .get_predecessors("scope", "stream1", SegmentId::new(1, 2))
            .await
            .unwrap();
        assert_eq!(predecessors[0].id, SegmentId::new(0, 1));
        assert!(
            store
                .get_segment("scope", "stream1", SegmentId::new(1, 3))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_concurrent_proposals_one_winner() {
        let store = Arc::new(store());
        active_stream(&store).await;

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store
                        .start_scale("scope", "stream1", &split_one(), "host")
                        .await
                })
            })
            .collect();
        let results: Vec<_> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        let wins = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(Error::ScaleInProgress { .. })))
            .count();
        assert_eq!(wins, 1);
        assert_eq!(conflicts, 1);
    }

    #[tokio::test]
    async fn test_seal_through_store() {
        let store = store();
        active_stream(&store).await;
        assert!(store.begin_seal("scope", "stream1").await.unwrap());
        assert!(store.seal("scope", "stream1", 99).await.unwrap());
        assert!(!store.seal("scope", "stream1", 100).await.unwrap());
        assert!(store.is_sealed("scope", "stream1").await.unwrap());
        assert!(
            store
                .get_current_segments("scope", "stream1")
                .await
                .unwrap()
                .is_empty()
        );
    }
}
