use std::sync::Arc;

use chrono::{DateTime, Utc};
use fieldops_core::{
    Clock, DispatchError, DispatchResult, EventKind, Notification, PriceBreakdown, RequestStatus,
    ServiceRequest, StatusPatch, Urgency, Worker, WorkerStatus,
};
use fieldops_storage::{NotificationSink, Repository};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{EligibilityResolver, PricingConfig, PricingEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    Assign,
    Start,
    Complete,
    Cancel,
}

impl LifecycleEvent {
    /// The event whose edges lead into `status`. Nothing leads back to pending.
    pub fn into_status(status: RequestStatus) -> Option<Self> {
        match status {
            RequestStatus::Pending => None,
            RequestStatus::Assigned => Some(Self::Assign),
            RequestStatus::InProgress => Some(Self::Start),
            RequestStatus::Completed => Some(Self::Complete),
            RequestStatus::Cancelled => Some(Self::Cancel),
        }
    }

    pub fn event_kind(&self) -> EventKind {
        match self {
            Self::Assign => EventKind::WorkerAssigned,
            Self::Start => EventKind::WorkStarted,
            Self::Complete => EventKind::RequestCompleted,
            Self::Cancel => EventKind::RequestCancelled,
        }
    }
}

/// Every legal edge of the request state machine.
pub const TRANSITIONS: &[(RequestStatus, LifecycleEvent, RequestStatus)] = &[
    (RequestStatus::Pending, LifecycleEvent::Assign, RequestStatus::Assigned),
    (RequestStatus::Pending, LifecycleEvent::Cancel, RequestStatus::Cancelled),
    (RequestStatus::Assigned, LifecycleEvent::Start, RequestStatus::InProgress),
    (RequestStatus::Assigned, LifecycleEvent::Cancel, RequestStatus::Cancelled),
    (RequestStatus::InProgress, LifecycleEvent::Complete, RequestStatus::Completed),
    (RequestStatus::InProgress, LifecycleEvent::Cancel, RequestStatus::Cancelled),
];

const DELETABLE: [RequestStatus; 2] = [RequestStatus::Pending, RequestStatus::Cancelled];

pub fn next_status(from: RequestStatus, event: LifecycleEvent) -> Option<RequestStatus> {
    TRANSITIONS
        .iter()
        .find(|(state, on, _)| *state == from && *on == event)
        .map(|(_, _, to)| *to)
}

/// Customer-submitted request. Every field except urgency and schedule is
/// required; they are optional here so that all missing ones can be reported.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewServiceRequest {
    pub requester_id: Option<Uuid>,
    pub service_id: Option<Uuid>,
    pub area_id: Option<Uuid>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub address: Option<String>,
    #[serde(default)]
    pub urgency: Option<Urgency>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

struct ValidatedRequest {
    requester_id: Uuid,
    service_id: Uuid,
    area_id: Uuid,
    title: String,
    description: String,
    address: String,
    urgency: Urgency,
    scheduled_at: Option<DateTime<Utc>>,
}

fn required_id(value: Option<Uuid>, name: &str, missing: &mut Vec<String>) -> Uuid {
    match value {
        Some(id) if !id.is_nil() => id,
        _ => {
            missing.push(name.to_string());
            Uuid::nil()
        }
    }
}

fn required_text(value: Option<String>, name: &str, missing: &mut Vec<String>) -> String {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => v,
        _ => {
            missing.push(name.to_string());
            String::new()
        }
    }
}

impl NewServiceRequest {
    fn validate(self) -> DispatchResult<ValidatedRequest> {
        let mut missing = Vec::new();
        let validated = ValidatedRequest {
            requester_id: required_id(self.requester_id, "requester_id", &mut missing),
            service_id: required_id(self.service_id, "service_id", &mut missing),
            area_id: required_id(self.area_id, "area_id", &mut missing),
            title: required_text(self.title, "title", &mut missing),
            description: required_text(self.description, "description", &mut missing),
            address: required_text(self.address, "address", &mut missing),
            urgency: self.urgency.unwrap_or_default(),
            scheduled_at: self.scheduled_at,
        };
        if missing.is_empty() {
            Ok(validated)
        } else {
            Err(DispatchError::MissingFields(missing))
        }
    }
}

/// Optional data accompanying a status change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransitionExtra {
    #[serde(default)]
    pub worker_id: Option<Uuid>,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub cancellation_reason: Option<String>,
}

fn validate_rating(rating: Option<f64>) -> DispatchResult<Option<f64>> {
    match rating {
        Some(r) if !(1.0..=5.0).contains(&r) => Err(DispatchError::Invalid(format!(
            "rating must be between 1 and 5, got {r}"
        ))),
        other => Ok(other),
    }
}

/// Owns every mutation of a service request. Each write is a single
/// status-guarded update, so two callers can never both win the same edge.
pub struct LifecycleManager {
    repo: Arc<dyn Repository>,
    pricing: PricingEngine,
    eligibility: EligibilityResolver,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
}

impl LifecycleManager {
    pub fn new(
        repo: Arc<dyn Repository>,
        pricing_config: PricingConfig,
        notifier: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pricing: PricingEngine::new(repo.clone(), pricing_config),
            eligibility: EligibilityResolver::new(repo.clone()),
            repo,
            notifier,
            clock,
        }
    }

    pub fn pricing(&self) -> &PricingEngine {
        &self.pricing
    }

    pub fn eligibility(&self) -> &EligibilityResolver {
        &self.eligibility
    }

    /// Price preview. Never persists anything.
    pub async fn quote(
        &self,
        service_id: Uuid,
        zone_id: Uuid,
        at: Option<DateTime<Utc>>,
        urgency: Option<Urgency>,
    ) -> DispatchResult<PriceBreakdown> {
        let at = at.unwrap_or_else(|| self.clock.now());
        self.pricing
            .compute_price(service_id, zone_id, at, urgency.unwrap_or_default())
            .await
    }

    #[instrument(skip_all)]
    pub async fn create(&self, input: NewServiceRequest) -> DispatchResult<ServiceRequest> {
        let input = input.validate()?;
        let area = self
            .repo
            .area(input.area_id)
            .await?
            .ok_or_else(|| DispatchError::not_found("area", input.area_id))?;

        let created_at = self.clock.now();
        let breakdown = self
            .pricing
            .compute_price(input.service_id, area.zone_id, created_at, input.urgency)
            .await?;

        let request = ServiceRequest {
            id: Uuid::new_v4(),
            requester_id: input.requester_id,
            service_id: input.service_id,
            worker_id: None,
            area_id: input.area_id,
            title: input.title,
            description: input.description,
            address: input.address,
            urgency: input.urgency,
            status: RequestStatus::Pending,
            base_price: breakdown.base_price,
            final_price: breakdown.final_price,
            price_breakdown: breakdown,
            created_at,
            scheduled_at: input.scheduled_at,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            cancellation_reason: None,
        };
        self.repo.insert(&request).await?;

        info!(
            request_id = %request.id,
            final_price = request.final_price,
            urgency = %request.urgency,
            "service request created"
        );
        self.notify(request.requester_id, EventKind::RequestCreated, &request);
        Ok(request)
    }

    pub async fn get(&self, request_id: Uuid) -> DispatchResult<ServiceRequest> {
        self.repo
            .get(request_id)
            .await?
            .ok_or_else(|| DispatchError::not_found("service request", request_id))
    }

    pub async fn list_for_requester(
        &self,
        requester_id: Uuid,
    ) -> DispatchResult<Vec<ServiceRequest>> {
        Ok(self.repo.list_for_requester(requester_id).await?)
    }

    pub async fn list_for_worker(&self, worker_id: Uuid) -> DispatchResult<Vec<ServiceRequest>> {
        Ok(self.repo.list_for_worker(worker_id).await?)
    }

    pub async fn eligible_workers(&self, request_id: Uuid) -> DispatchResult<Vec<Worker>> {
        let request = self.get(request_id).await?;
        self.eligibility
            .find_eligible_workers(request.service_id, request.area_id)
            .await
    }

    /// Only worker status is checked here, not skill or zone, so staff can
    /// assign outside the eligible set.
    #[instrument(skip(self))]
    pub async fn assign_worker(
        &self,
        request_id: Uuid,
        worker_id: Uuid,
    ) -> DispatchResult<ServiceRequest> {
        let request = self.get(request_id).await?;
        if next_status(request.status, LifecycleEvent::Assign).is_none() {
            return Err(DispatchError::InvalidState {
                id: request_id,
                status: request.status,
                operation: "assign",
            });
        }

        let worker = self
            .repo
            .worker(worker_id)
            .await?
            .ok_or_else(|| DispatchError::not_found("worker", worker_id))?;
        if worker.status != WorkerStatus::Active {
            return Err(DispatchError::WorkerUnavailable(worker_id));
        }

        let patch = StatusPatch {
            worker_id: Some(worker_id),
            ..StatusPatch::to(RequestStatus::Assigned)
        };
        let Some(updated) = self
            .repo
            .compare_and_set(request_id, request.status, &patch)
            .await?
        else {
            return Err(match self.repo.get(request_id).await? {
                Some(latest) => DispatchError::InvalidState {
                    id: request_id,
                    status: latest.status,
                    operation: "assign",
                },
                None => DispatchError::not_found("service request", request_id),
            });
        };

        info!(%request_id, %worker_id, "worker assigned");
        self.notify(updated.requester_id, EventKind::WorkerAssigned, &updated);
        self.notify(worker.user_id, EventKind::WorkerAssigned, &updated);
        Ok(updated)
    }

    /// Moves a request along one edge of [`TRANSITIONS`].
    ///
    /// Completion commits the status first and then folds the job into the
    /// worker's record. If that second write fails the error is returned but
    /// the request stays `completed`; a retry of the same call will fail with
    /// `InvalidTransition`, so callers must not retry a failed completion.
    /// Cancelling unsets the assigned worker.
    #[instrument(skip(self, extra))]
    pub async fn transition_status(
        &self,
        request_id: Uuid,
        new_status: RequestStatus,
        extra: TransitionExtra,
    ) -> DispatchResult<ServiceRequest> {
        let current = self.get(request_id).await?;
        let event = LifecycleEvent::into_status(new_status)
            .filter(|event| next_status(current.status, *event) == Some(new_status))
            .ok_or(DispatchError::InvalidTransition {
                from: current.status,
                to: new_status,
            })?;

        let now = self.clock.now();
        let mut patch = StatusPatch::to(new_status);
        let mut rating = None;
        match event {
            LifecycleEvent::Assign => {
                let worker_id = extra
                    .worker_id
                    .ok_or_else(|| DispatchError::MissingFields(vec!["worker_id".into()]))?;
                return self.assign_worker(request_id, worker_id).await;
            }
            LifecycleEvent::Start => patch.started_at = Some(now),
            LifecycleEvent::Complete => {
                rating = validate_rating(extra.rating)?;
                patch.completed_at = Some(now);
            }
            LifecycleEvent::Cancel => {
                patch.cancelled_at = Some(now);
                patch.clear_worker = true;
                patch.cancellation_reason = extra
                    .cancellation_reason
                    .map(|r| r.trim().to_string())
                    .filter(|r| !r.is_empty());
            }
        }

        let Some(updated) = self
            .repo
            .compare_and_set(request_id, current.status, &patch)
            .await?
        else {
            return Err(match self.repo.get(request_id).await? {
                Some(latest) => DispatchError::InvalidTransition {
                    from: latest.status,
                    to: new_status,
                },
                None => DispatchError::not_found("service request", request_id),
            });
        };

        if event == LifecycleEvent::Complete {
            if let Some(worker_id) = updated.worker_id {
                if self.repo.record_completed_job(worker_id, rating).await?.is_none() {
                    warn!(%request_id, %worker_id, "completed request points at a missing worker");
                }
            }
        }

        info!(%request_id, from = %current.status, to = %new_status, "request transitioned");
        // A cancel has already unset the worker, so address the one it had.
        self.notify_parties(event.event_kind(), &updated, current.worker_id).await;
        Ok(updated)
    }

    /// Only pending or cancelled requests may be removed; anything further
    /// along is kept for its audit trail.
    #[instrument(skip(self))]
    pub async fn delete(&self, request_id: Uuid) -> DispatchResult<()> {
        if self.repo.delete_if(request_id, &DELETABLE).await? {
            info!(%request_id, "service request deleted");
            return Ok(());
        }
        match self.repo.get(request_id).await? {
            Some(request) => Err(DispatchError::InvalidState {
                id: request_id,
                status: request.status,
                operation: "delete",
            }),
            None => Err(DispatchError::not_found("service request", request_id)),
        }
    }

    fn notify(&self, user_id: Uuid, kind: EventKind, request: &ServiceRequest) {
        self.notifier.notify(Notification {
            user_id,
            kind,
            payload: json!({
                "request_id": request.id,
                "status": request.status,
                "final_price": request.final_price,
                "cancellation_reason": request.cancellation_reason,
            }),
        });
    }

    async fn notify_parties(
        &self,
        kind: EventKind,
        request: &ServiceRequest,
        worker_id: Option<Uuid>,
    ) {
        self.notify(request.requester_id, kind, request);
        let Some(worker_id) = worker_id else {
            return;
        };
        match self.repo.worker(worker_id).await {
            Ok(Some(worker)) => self.notify(worker.user_id, kind, request),
            Ok(None) => {}
            Err(err) => {
                warn!(%worker_id, error = %err, "could not resolve worker for notification")
            }
        }
    }
}
