//! Persistence contracts
//!
//! The engine reads samples and writes baselines/anomalies through these
//! traits; the host application provides the real storage. `InMemoryStore`
//! implements all of them for tests, the CLI, and embedded use.

use crate::error::EngineError;
use crate::types::{Anomaly, MetricSample, UserBaseline};
use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Outcome of an acknowledgement write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckTransition {
    /// The record moved from new to acknowledged
    Acknowledged,
    /// The record was already acknowledged; nothing changed
    AlreadyAcknowledged,
}

/// Read access to historical daily samples
pub trait SampleFeed: Send + Sync {
    /// Up to `window_days` most recent samples dated strictly before
    /// `before`, ascending by date
    fn recent_samples(
        &self,
        user_id: &str,
        before: NaiveDate,
        window_days: u32,
    ) -> Result<Vec<MetricSample>, EngineError>;
}

/// Whole-record baseline storage (last write wins)
pub trait BaselineRepository: Send + Sync {
    fn load(&self, user_id: &str) -> Result<Option<UserBaseline>, EngineError>;

    fn replace(&self, baseline: UserBaseline) -> Result<(), EngineError>;
}

/// Anomaly storage
pub trait AnomalyRepository: Send + Sync {
    /// Insert anomalies whose id is not yet stored; returns how many were new
    fn insert_all(&self, anomalies: &[Anomaly]) -> Result<usize, EngineError>;

    fn get(&self, id: Uuid) -> Result<Option<Anomaly>, EngineError>;

    /// Atomically set `acknowledged` on the record.
    ///
    /// Implementations must perform the read-modify-write under a per-record
    /// lock or compare-and-set so that concurrent calls see exactly one
    /// `Acknowledged` transition.
    fn mark_acknowledged(&self, id: Uuid) -> Result<AckTransition, EngineError>;

    fn list_for_user(&self, user_id: &str) -> Result<Vec<Anomaly>, EngineError>;
}

/// Concurrent in-memory implementation of every repository
#[derive(Debug, Default)]
pub struct InMemoryStore {
    samples: DashMap<String, BTreeMap<NaiveDate, MetricSample>>,
    baselines: DashMap<String, UserBaseline>,
    anomalies: DashMap<Uuid, Anomaly>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a sample, replacing any earlier sample for the same user and date
    pub fn upsert_sample(&self, sample: MetricSample) -> Option<MetricSample> {
        self.samples
            .entry(sample.user_id.clone())
            .or_default()
            .insert(sample.date, sample)
    }

    pub fn sample_count(&self, user_id: &str) -> usize {
        self.samples.get(user_id).map(|s| s.len()).unwrap_or(0)
    }

    pub fn anomaly_count(&self) -> usize {
        self.anomalies.len()
    }
}

impl SampleFeed for InMemoryStore {
    fn recent_samples(
        &self,
        user_id: &str,
        before: NaiveDate,
        window_days: u32,
    ) -> Result<Vec<MetricSample>, EngineError> {
        let Some(samples) = self.samples.get(user_id) else {
            return Ok(Vec::new());
        };

        let mut recent: Vec<MetricSample> = samples
            .range(..before)
            .rev()
            .take(window_days as usize)
            .map(|(_, sample)| sample.clone())
            .collect();
        recent.reverse();
        Ok(recent)
    }
}

impl BaselineRepository for InMemoryStore {
    fn load(&self, user_id: &str) -> Result<Option<UserBaseline>, EngineError> {
        Ok(self.baselines.get(user_id).map(|b| b.value().clone()))
    }

    fn replace(&self, baseline: UserBaseline) -> Result<(), EngineError> {
        self.baselines.insert(baseline.user_id.clone(), baseline);
        Ok(())
    }
}

impl AnomalyRepository for InMemoryStore {
    fn insert_all(&self, anomalies: &[Anomaly]) -> Result<usize, EngineError> {
        let mut inserted = 0;
        for anomaly in anomalies {
            if let Entry::Vacant(entry) = self.anomalies.entry(anomaly.id) {
                entry.insert(anomaly.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    fn get(&self, id: Uuid) -> Result<Option<Anomaly>, EngineError> {
        Ok(self.anomalies.get(&id).map(|a| a.value().clone()))
    }

    fn mark_acknowledged(&self, id: Uuid) -> Result<AckTransition, EngineError> {
        // get_mut holds the shard write lock for the whole read-modify-write
        let mut anomaly = self.anomalies.get_mut(&id).ok_or(EngineError::NotFound(id))?;
        if anomaly.acknowledged {
            return Ok(AckTransition::AlreadyAcknowledged);
        }
        anomaly.acknowledged = true;
        Ok(AckTransition::Acknowledged)
    }

    fn list_for_user(&self, user_id: &str) -> Result<Vec<Anomaly>, EngineError> {
        let mut anomalies: Vec<Anomaly> = self
            .anomalies
            .iter()
            .filter(|a| a.user_id == user_id)
            .map(|a| a.value().clone())
            .collect();
        anomalies.sort_by(|a, b| {
            a.date
                .cmp(&b.date)
                .then_with(|| a.metric_type.cmp(&b.metric_type))
        });
        Ok(anomalies)
    }
}
