use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::events::{Event, EventSeverity, EventType, RemediationDetails};
use crate::remediation::{
    action_type_for, Action, ActionTarget, RemediationEngine, RunOutcome,
};

/* ============================= TYPES ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

impl Urgency {
    pub fn rank(&self) -> u8 {
        match self {
            Urgency::Low => 0,
            Urgency::Medium => 1,
            Urgency::High => 2,
            Urgency::Critical => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Low => "low",
            Urgency::Medium => "medium",
            Urgency::High => "high",
            Urgency::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecommendationStatus {
    Pending,
    Approved,
    Rejected,
    Executing,
    Completed,
    Failed,
    Expired,
}

impl RecommendationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecommendationStatus::Pending => "pending",
            RecommendationStatus::Approved => "approved",
            RecommendationStatus::Rejected => "rejected",
            RecommendationStatus::Executing => "executing",
            RecommendationStatus::Completed => "completed",
            RecommendationStatus::Failed => "failed",
            RecommendationStatus::Expired => "expired",
        }
    }
}

/// A proposed remediation with an approval lifecycle.
#[derive(Debug, Clone)]
pub struct Recommendation {
    pub id: String,
    pub event_id: String,
    pub resource_type: String,
    pub resource_name: String,
    pub namespace: String,
    pub title: String,
    pub description: String,
    pub action: String,
    pub parameters: BTreeMap<String, Value>,
    pub urgency: Urgency,
    pub severity: EventSeverity,
    pub confidence: f64,
    pub time_to_action: Duration,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: RecommendationStatus,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_by: Option<String>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub rejected_reason: Option<String>,
    pub executed_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub tags: BTreeSet<String>,
}

/// Inputs for `create`; everything else is filled in by the manager.
#[derive(Debug, Clone)]
pub struct NewRecommendation {
    pub event_id: String,
    pub resource_type: String,
    pub resource_name: String,
    pub namespace: String,
    pub title: String,
    pub description: String,
    pub action: String,
    pub parameters: BTreeMap<String, Value>,
    pub urgency: Urgency,
    pub severity: EventSeverity,
    pub confidence: f64,
    pub time_to_action: Duration,
    pub ttl: Duration,
    pub tags: BTreeSet<String>,
}

impl Default for NewRecommendation {
    fn default() -> Self {
        Self {
            event_id: String::new(),
            resource_type: "pod".to_string(),
            resource_name: String::new(),
            namespace: String::new(),
            title: String::new(),
            description: String::new(),
            action: String::new(),
            parameters: BTreeMap::new(),
            urgency: Urgency::Medium,
            severity: EventSeverity::Warning,
            confidence: 0.5,
            time_to_action: Duration::from_secs(900),
            ttl: Duration::from_secs(3600),
            tags: BTreeSet::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("recommendation '{0}' not found")]
    NotFound(String),

    #[error("recommendation '{id}' is {from}; cannot {operation}")]
    InvalidTransition {
        id: String,
        from: &'static str,
        operation: &'static str,
    },
}

/* ============================= MANAGER ============================= */

struct ManagerState {
    items: HashMap<String, Recommendation>,
    insertion_order: VecDeque<String>,
}

/// Bounded recommendation store with the pending → approved → executing →
/// completed/failed lifecycle, expiry, and FIFO eviction at capacity.
pub struct RecommendationManager {
    state: Mutex<ManagerState>,
    cap: usize,
    bus: EventBus,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RecommendationManager {
    pub fn new(cap: usize, bus: EventBus) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ManagerState {
                items: HashMap::new(),
                insertion_order: VecDeque::new(),
            }),
            cap: cap.max(1),
            bus,
            sweeper: Mutex::new(None),
        })
    }

    /// Create a pending recommendation and announce it on the bus.
    pub fn create(&self, input: NewRecommendation) -> Recommendation {
        let now = Utc::now();
        let rec = Recommendation {
            id: Uuid::new_v4().to_string(),
            event_id: input.event_id,
            resource_type: input.resource_type,
            resource_name: input.resource_name,
            namespace: input.namespace,
            title: input.title,
            description: input.description,
            action: input.action,
            parameters: input.parameters,
            urgency: input.urgency,
            severity: input.severity,
            confidence: input.confidence,
            time_to_action: input.time_to_action,
            created_at: now,
            expires_at: now + chrono::Duration::from_std(input.ttl).unwrap_or_default(),
            status: RecommendationStatus::Pending,
            approved_by: None,
            approved_at: None,
            rejected_by: None,
            rejected_at: None,
            rejected_reason: None,
            executed_at: None,
            result: None,
            error: None,
            tags: input.tags,
        };

        {
            let mut state = self.state.lock().expect("manager lock poisoned");
            state.insertion_order.push_back(rec.id.clone());
            state.items.insert(rec.id.clone(), rec.clone());

            // Newest insert evicts oldest entries beyond capacity.
            while state.items.len() > self.cap {
                if let Some(oldest) = state.insertion_order.pop_front() {
                    if state.items.remove(&oldest).is_some() {
                        debug!(id = %oldest, "recommendation_evicted_at_capacity");
                    }
                } else {
                    break;
                }
            }
        }

        info!(
            id = %rec.id,
            action = %rec.action,
            urgency = rec.urgency.as_str(),
            resource = %rec.resource_name,
            "recommendation_created"
        );

        self.bus.publish(
            Event::new(
                EventType::SystemRemediationProposed,
                rec.severity,
                format!("{}: {}", rec.title, rec.description),
            )
            .namespace(rec.namespace.clone())
            .resource(format!("{}/{}", rec.resource_type, rec.resource_name))
            .correlation(rec.event_id.clone())
            .details_from(RemediationDetails {
                recommendation_id: rec.id.clone(),
                action: rec.action.clone(),
                urgency: rec.urgency.as_str().to_string(),
                result: None,
                error: None,
            }),
        );

        rec
    }

    pub fn get(&self, id: &str) -> Option<Recommendation> {
        self.state
            .lock()
            .expect("manager lock poisoned")
            .items
            .get(id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("manager lock poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pending recommendations sorted by urgency, then recency.
    pub fn list(&self) -> Vec<Recommendation> {
        let mut items: Vec<Recommendation> = self
            .state
            .lock()
            .expect("manager lock poisoned")
            .items
            .values()
            .cloned()
            .collect();
        items.sort_by(|a, b| {
            b.urgency
                .rank()
                .cmp(&a.urgency.rank())
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        items
    }

    pub fn approve(&self, id: &str, by: &str) -> Result<Recommendation, LifecycleError> {
        self.transition(id, "approve", |rec| {
            if rec.status != RecommendationStatus::Pending {
                return Err(rec.status.as_str());
            }
            rec.status = RecommendationStatus::Approved;
            rec.approved_by = Some(by.to_string());
            rec.approved_at = Some(Utc::now());
            Ok(())
        })
    }

    pub fn reject(
        &self,
        id: &str,
        by: &str,
        reason: &str,
    ) -> Result<Recommendation, LifecycleError> {
        self.transition(id, "reject", |rec| {
            if rec.status != RecommendationStatus::Pending {
                return Err(rec.status.as_str());
            }
            rec.status = RecommendationStatus::Rejected;
            rec.rejected_by = Some(by.to_string());
            rec.rejected_at = Some(Utc::now());
            rec.rejected_reason = Some(reason.to_string());
            Ok(())
        })
    }

    /// Execute an approved recommendation through the remediation engine,
    /// recording the result and announcing the outcome.
    pub async fn execute(
        &self,
        id: &str,
        engine: &RemediationEngine,
    ) -> Result<Recommendation, LifecycleError> {
        let rec = self.transition(id, "execute", |rec| {
            if rec.status != RecommendationStatus::Approved {
                return Err(rec.status.as_str());
            }
            rec.status = RecommendationStatus::Executing;
            Ok(())
        })?;

        let mut action = Action::new(
            action_type_for(&rec.action).to_string(),
            ActionTarget {
                kind: rec.resource_type.clone(),
                namespace: rec.namespace.clone(),
                name: rec.resource_name.clone(),
            },
        );
        action.parameters = rec.parameters.clone();
        if let Some(by) = &rec.approved_by {
            action.approve(by.clone());
        }

        let run = engine.run(&mut action).await;

        let (event_type, severity) = match &run {
            Ok(_) => (EventType::SystemRemediationApplied, EventSeverity::Info),
            Err(_) => (EventType::SystemRemediationFailed, EventSeverity::Error),
        };

        let updated = self.transition(id, "record result", |rec| {
            rec.executed_at = Some(Utc::now());
            match &run {
                Ok(RunOutcome::Completed(message)) => {
                    rec.status = RecommendationStatus::Completed;
                    rec.result = Some(message.clone());
                }
                Ok(RunOutcome::NeedsApproval) => {
                    // The engine asked for approval we already have; park it.
                    rec.status = RecommendationStatus::Approved;
                }
                Err(e) => {
                    rec.status = RecommendationStatus::Failed;
                    rec.error = Some(e.to_string());
                }
            }
            Ok(())
        })?;

        self.bus.publish(
            Event::new(
                event_type,
                severity,
                format!("remediation '{}' {}", updated.action, updated.status.as_str()),
            )
            .namespace(updated.namespace.clone())
            .resource(format!(
                "{}/{}",
                updated.resource_type, updated.resource_name
            ))
            .correlation(updated.event_id.clone())
            .details_from(RemediationDetails {
                recommendation_id: updated.id.clone(),
                action: updated.action.clone(),
                urgency: updated.urgency.as_str().to_string(),
                result: updated.result.clone(),
                error: updated.error.clone(),
            }),
        );

        Ok(updated)
    }

    /// Expire pending recommendations past their deadline and drop them.
    /// Returns how many were removed.
    pub fn expire_due(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.state.lock().expect("manager lock poisoned");
        let expired: Vec<String> = state
            .items
            .values()
            .filter(|rec| rec.status == RecommendationStatus::Pending && rec.expires_at <= now)
            .map(|rec| rec.id.clone())
            .collect();

        for id in &expired {
            if let Some(rec) = state.items.get_mut(id) {
                rec.status = RecommendationStatus::Expired;
            }
            state.items.remove(id);
            warn!(id = %id, "recommendation_expired");
        }
        let ManagerState {
            items,
            insertion_order,
        } = &mut *state;
        insertion_order.retain(|id| items.contains_key(id));
        expired.len()
    }

    /// Background sweep transitioning expired recommendations out.
    pub fn start_cleanup(self: Arc<Self>, interval: Duration) {
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let removed = manager.expire_due(Utc::now());
                if removed > 0 {
                    debug!(removed, "recommendation_cleanup_swept");
                }
            }
        });
        *self.sweeper.lock().expect("manager lock poisoned") = Some(handle);
    }

    pub fn stop(&self) {
        if let Some(handle) = self.sweeper.lock().expect("manager lock poisoned").take() {
            handle.abort();
        }
    }

    fn transition(
        &self,
        id: &str,
        operation: &'static str,
        apply: impl FnOnce(&mut Recommendation) -> Result<(), &'static str>,
    ) -> Result<Recommendation, LifecycleError> {
        let mut state = self.state.lock().expect("manager lock poisoned");
        let rec = state
            .items
            .get_mut(id)
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;
        apply(rec).map_err(|from| LifecycleError::InvalidTransition {
            id: id.to_string(),
            from,
            operation,
        })?;
        Ok(rec.clone())
    }
}

impl Drop for RecommendationManager {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().expect("manager lock poisoned").take() {
            handle.abort();
        }
    }
}

/* ============================= TESTS ============================= */
