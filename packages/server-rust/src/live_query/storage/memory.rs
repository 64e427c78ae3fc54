//! In-process live query registry for single-process deployments and tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use livesync_core::clock::is_expired;
use livesync_core::{ClockSource, RowId, SystemClock};

use super::{LiveQueryStorage, RegisteredQuery};
use crate::live_query::error::RegistryError;

/// `DashMap`-backed registry. Contents are lost on restart.
pub struct MemoryLiveQueryStorage {
    queries: DashMap<String, RegisteredQuery>,
    clock: Arc<dyn ClockSource>,
}

impl MemoryLiveQueryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(clock: Arc<dyn ClockSource>) -> Self {
        Self {
            queries: DashMap::new(),
            clock,
        }
    }
}

impl Default for MemoryLiveQueryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LiveQueryStorage for MemoryLiveQueryStorage {
    async fn add(&self, mut query: RegisteredQuery) -> Result<(), RegistryError> {
        query.last_touched = self.clock.now();
        self.queries.insert(query.id.clone(), query);
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), RegistryError> {
        self.queries.remove(id);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<RegisteredQuery>, RegistryError> {
        Ok(self.queries.get(id).map(|q| q.clone()))
    }

    async fn queries_for_entity(
        &self,
        entity_key: &str,
    ) -> Result<Vec<RegisteredQuery>, RegistryError> {
        Ok(self
            .queries
            .iter()
            .filter(|q| q.entity_key == entity_key)
            .map(|q| q.clone())
            .collect())
    }

    async fn set_data(&self, id: &str, last_known_ids: Vec<RowId>) -> Result<bool, RegistryError> {
        match self.queries.get_mut(id) {
            Some(mut query) => {
                query.last_known_ids = last_known_ids;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn keep_alive_and_return_unknown_query_ids(
        &self,
        ids: &[String],
    ) -> Result<Vec<String>, RegistryError> {
        let now = self.clock.now();
        let mut unknown = Vec::new();
        for id in ids {
            match self.queries.get_mut(id) {
                Some(mut query) => query.last_touched = now,
                None => unknown.push(id.clone()),
            }
        }
        Ok(unknown)
    }

    async fn remove_expired(&self, ttl: Duration) -> Result<Vec<String>, RegistryError> {
        let now = self.clock.now();
        let candidates: Vec<String> = self
            .queries
            .iter()
            .filter(|q| is_expired(q.last_touched, now, ttl))
            .map(|q| q.id.clone())
            .collect();

        // A keep-alive may land between the scan and the removal.
        Ok(candidates
            .into_iter()
            .filter(|id| {
                self.queries
                    .remove_if(id, |_, q| is_expired(q.last_touched, now, ttl))
                    .is_some()
            })
            .collect())
    }

    async fn remove_for_client(&self, client_id: &str) -> Result<Vec<String>, RegistryError> {
        let mut removed = Vec::new();
        self.queries.retain(|id, q| {
            let keep = q.owner_client_id != client_id;
            if !keep {
                removed.push(id.clone());
            }
            keep
        });
        Ok(removed)
    }

    async fn count(&self) -> Result<usize, RegistryError> {
        Ok(self.queries.len())
    }
}
