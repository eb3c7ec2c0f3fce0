//! Core domain model for the fieldops dispatch core: service requests, workers,
//! catalog entries, pricing rules and the error vocabulary shared by every crate.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "fieldops-core";

/// Generates `as_str`, `Display` and `FromStr` for a plain enum whose persisted
/// form is a lowercase identifier.
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = DispatchError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim() {
                    $($text => Ok($name::$variant),)+
                    other => Err(DispatchError::Invalid(format!(
                        "unknown {} `{}`",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    #[default]
    Normal,
    Urgent,
    Emergency,
}

string_enum!(Urgency {
    Normal => "normal",
    Urgent => "urgent",
    Emergency => "emergency",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Cancelled,
}

string_enum!(RequestStatus {
    Pending => "pending",
    Assigned => "assigned",
    InProgress => "in_progress",
    Completed => "completed",
    Cancelled => "cancelled",
});

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Cancelled)
    }

    /// States in which a request must carry an assigned worker.
    pub fn requires_worker(&self) -> bool {
        matches!(
            self,
            RequestStatus::Assigned | RequestStatus::InProgress | RequestStatus::Completed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Available,
    Busy,
    Offline,
}

string_enum!(Availability {
    Available => "available",
    Busy => "busy",
    Offline => "offline",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Pending,
    Active,
    Rejected,
}

string_enum!(WorkerStatus {
    Pending => "pending",
    Active => "active",
    Rejected => "rejected",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    Active,
    Inactive,
}

string_enum!(RuleStatus {
    Active => "active",
    Inactive => "inactive",
});

/// Catalog entry a customer can request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: Uuid,
    pub category_id: Uuid,
    pub name: String,
    pub base_price: f64,
}

/// Finest-grained location unit; every area belongs to exactly one zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Area {
    pub id: Uuid,
    pub zone_id: Uuid,
    pub name: String,
}

/// Zone-scoped multiplier. A rule without a window applies all day; a window
/// whose end precedes its start wraps past midnight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingRule {
    pub id: Uuid,
    pub zone_id: Uuid,
    pub window_start: Option<NaiveTime>,
    pub window_end: Option<NaiveTime>,
    pub multiplier: f64,
    pub status: RuleStatus,
    pub created_at: DateTime<Utc>,
}

impl PricingRule {
    pub fn covers(&self, local_time: NaiveTime) -> bool {
        match (self.window_start, self.window_end) {
            (Some(start), Some(end)) if start <= end => local_time >= start && local_time < end,
            (Some(start), Some(end)) => local_time >= start || local_time < end,
            (Some(start), None) => local_time >= start,
            (None, Some(end)) => local_time < end,
            (None, None) => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: Uuid,
    pub user_id: Uuid,
    pub category_ids: Vec<Uuid>,
    pub service_ids: Vec<Uuid>,
    /// Zone the worker is bound to directly.
    pub zone_id: Option<Uuid>,
    /// Additional zones granted through explicit worker-zone assignments.
    pub assigned_zone_ids: Vec<Uuid>,
    pub availability: Availability,
    pub status: WorkerStatus,
    pub rating: f64,
    pub total_jobs: u32,
}

impl Worker {
    pub fn offers(&self, service_id: Uuid) -> bool {
        self.service_ids.contains(&service_id)
    }

    pub fn covers_zone(&self, zone_id: Uuid) -> bool {
        self.zone_id == Some(zone_id) || self.assigned_zone_ids.contains(&zone_id)
    }

    pub fn is_dispatchable(&self) -> bool {
        self.status == WorkerStatus::Active && self.availability == Availability::Available
    }

    /// Record one completed job, folding `rating` into the running average.
    pub fn fold_rating(&mut self, rating: Option<f64>) {
        if let Some(rating) = rating {
            self.rating = fold_rating(self.rating, self.total_jobs, rating);
        }
        self.total_jobs = self.total_jobs.saturating_add(1);
    }
}

/// Weighted-average fold of a new rating into `current`, weighted by the jobs
/// already counted. A worker with no rating yet adopts `new` directly.
pub fn fold_rating(current: f64, total_jobs: u32, new: f64) -> f64 {
    if current <= 0.0 || total_jobs == 0 {
        return new;
    }
    let weight = f64::from(total_jobs);
    (current * weight + new) / (weight + 1.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorKind {
    Zone,
    TimeOfDay,
    Demand,
    Urgency,
    Availability,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceFactor {
    pub kind: FactorKind,
    pub multiplier: f64,
    pub label: String,
}

/// Itemized price: the catalog base, every factor in application order, and
/// the rounded product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBreakdown {
    pub base_price: f64,
    pub factors: Vec<PriceFactor>,
    pub final_price: f64,
}

impl PriceBreakdown {
    pub fn from_factors(base_price: f64, factors: Vec<PriceFactor>) -> Self {
        let raw = factors
            .iter()
            .fold(base_price, |acc, factor| acc * factor.multiplier);
        Self {
            base_price,
            factors,
            final_price: round_cents(raw),
        }
    }

    pub fn factor(&self, kind: FactorKind) -> Option<&PriceFactor> {
        self.factors.iter().find(|f| f.kind == kind)
    }
}

pub fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub id: Uuid,
    pub requester_id: Uuid,
    pub service_id: Uuid,
    pub worker_id: Option<Uuid>,
    pub area_id: Uuid,
    pub title: String,
    pub description: String,
    pub address: String,
    pub urgency: Urgency,
    pub status: RequestStatus,
    pub base_price: f64,
    pub final_price: f64,
    pub price_breakdown: PriceBreakdown,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
}

/// Column changes written together with a status change. `None` leaves the
/// stored value untouched.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StatusPatch {
    pub status: Option<RequestStatus>,
    pub worker_id: Option<Uuid>,
    /// Unset the worker; takes precedence over `worker_id`.
    pub clear_worker: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
}

impl StatusPatch {
    pub fn to(status: RequestStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn apply(&self, request: &mut ServiceRequest) {
        if let Some(status) = self.status {
            request.status = status;
        }
        if self.clear_worker {
            request.worker_id = None;
        } else if let Some(worker_id) = self.worker_id {
            request.worker_id = Some(worker_id);
        }
        if let Some(at) = self.started_at {
            request.started_at = Some(at);
        }
        if let Some(at) = self.completed_at {
            request.completed_at = Some(at);
        }
        if let Some(at) = self.cancelled_at {
            request.cancelled_at = Some(at);
        }
        if let Some(reason) = &self.cancellation_reason {
            request.cancellation_reason = Some(reason.clone());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RequestCreated,
    WorkerAssigned,
    WorkStarted,
    RequestCompleted,
    RequestCancelled,
}

string_enum!(EventKind {
    RequestCreated => "request_created",
    WorkerAssigned => "worker_assigned",
    WorkStarted => "work_started",
    RequestCompleted => "request_completed",
    RequestCancelled => "request_cancelled",
});

/// Fire-and-forget message handed to a notification sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub user_id: Uuid,
    pub kind: EventKind,
    pub payload: serde_json::Value,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("validation failed: missing {}", .0.join(", "))]
    MissingFields(Vec<String>),
    #[error("validation failed: {0}")]
    Invalid(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("cannot {operation} request {id} while it is {status}")]
    InvalidState {
        id: Uuid,
        status: RequestStatus,
        operation: &'static str,
    },
    #[error("transition {from} -> {to} is not allowed")]
    InvalidTransition {
        from: RequestStatus,
        to: RequestStatus,
    },
    #[error("worker {0} is not active")]
    WorkerUnavailable(Uuid),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl DispatchError {
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        Self::NotFound { entity, id }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::MissingFields(_) | Self::Invalid(_))
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to a single instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock {
    time: DateTime<Utc>,
}

impl FixedClock {
    pub const fn new(time: DateTime<Utc>) -> Self {
        Self { time }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.time
    }
}
