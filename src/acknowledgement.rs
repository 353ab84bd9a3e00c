//! Anomaly acknowledgement lifecycle
//!
//! Anomalies start `New` and move to `Acknowledged` exactly once. Repeated
//! acknowledgements succeed without changing anything.

use crate::error::EngineError;
use crate::store::{AckTransition, AnomalyRepository};
use crate::types::Anomaly;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalyState {
    New,
    Acknowledged,
}

impl From<&Anomaly> for AnomalyState {
    fn from(anomaly: &Anomaly) -> Self {
        if anomaly.acknowledged {
            AnomalyState::Acknowledged
        } else {
            AnomalyState::New
        }
    }
}

/// Manages anomaly state through an `AnomalyRepository`
pub struct AcknowledgementTracker<R: AnomalyRepository> {
    repository: Arc<R>,
}

impl<R: AnomalyRepository> Clone for AcknowledgementTracker<R> {
    fn clone(&self) -> Self {
        Self {
            repository: Arc::clone(&self.repository),
        }
    }
}

impl<R: AnomalyRepository> AcknowledgementTracker<R> {
    pub fn new(repository: Arc<R>) -> Self {
        Self { repository }
    }

    /// Record freshly detected anomalies in state `New`.
    ///
    /// Anomalies already known (same id) are left untouched, including their
    /// acknowledgement. Returns the number of newly recorded anomalies.
    pub fn record_new(&self, anomalies: &[Anomaly]) -> Result<usize, EngineError> {
        let fresh: Vec<Anomaly> = anomalies
            .iter()
            .map(|a| Anomaly {
                acknowledged: false,
                ..a.clone()
            })
            .collect();

        let inserted = self.repository.insert_all(&fresh)?;
        debug!(offered = anomalies.len(), inserted, "Recorded anomalies");
        Ok(inserted)
    }

    /// Acknowledge an anomaly; idempotent
    pub fn acknowledge(&self, anomaly_id: Uuid) -> Result<AckTransition, EngineError> {
        let transition = self.repository.mark_acknowledged(anomaly_id)?;
        match transition {
            AckTransition::Acknowledged => info!(anomaly_id = %anomaly_id, "Anomaly acknowledged"),
            AckTransition::AlreadyAcknowledged => {
                debug!(anomaly_id = %anomaly_id, "Anomaly already acknowledged")
            }
        }
        Ok(transition)
    }

    pub fn state(&self, anomaly_id: Uuid) -> Result<AnomalyState, EngineError> {
        self.repository
            .get(anomaly_id)?
            .map(|a| AnomalyState::from(&a))
            .ok_or(EngineError::NotFound(anomaly_id))
    }

    /// Unacknowledged anomalies for a user, most recent day first
    pub fn pending(&self, user_id: &str) -> Result<Vec<Anomaly>, EngineError> {
        let mut pending: Vec<Anomaly> = self
            .repository
            .list_for_user(user_id)?
            .into_iter()
            .filter(|a| !a.acknowledged)
            .collect();
        pending.sort_by(|a, b| {
            b.date
                .cmp(&a.date)
                .then_with(|| b.severity.cmp(&a.severity))
                .then_with(|| a.metric_type.cmp(&b.metric_type))
        });
        Ok(pending)
    }
}
