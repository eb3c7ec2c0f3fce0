//! Persistence ports for the dispatch core plus the in-memory and Postgres
//! adapters and the notification sinks the lifecycle reports to.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fieldops_core::{
    Area, Notification, PricingRule, RequestStatus, Service, ServiceRequest, StatusPatch, Worker,
};
use uuid::Uuid;

mod memory;
mod notify;
mod postgres;

pub use memory::MemoryStore;
pub use notify::{LogNotifier, NotificationSink, RecordingNotifier, WebhookConfig, WebhookNotifier};
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "fieldops-storage";

/// Read-only view of the service catalog and the location hierarchy.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn service(&self, id: Uuid) -> anyhow::Result<Option<Service>>;

    async fn area(&self, id: Uuid) -> anyhow::Result<Option<Area>>;

    /// Active pricing rules for a zone, newest first.
    async fn pricing_rules_for_zone(&self, zone_id: Uuid) -> anyhow::Result<Vec<PricingRule>>;
}

#[async_trait]
pub trait WorkerStore: Send + Sync {
    async fn worker(&self, id: Uuid) -> anyhow::Result<Option<Worker>>;

    /// Active, available workers that offer `service_id` and cover `zone_id`
    /// either directly or through a worker-zone assignment. Unordered.
    async fn qualified_workers(&self, service_id: Uuid, zone_id: Uuid)
        -> anyhow::Result<Vec<Worker>>;

    /// Bump the job counter and fold `rating` into the running average in one
    /// write. Returns `None` if the worker does not exist.
    async fn record_completed_job(
        &self,
        worker_id: Uuid,
        rating: Option<f64>,
    ) -> anyhow::Result<Option<Worker>>;
}

#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn insert(&self, request: &ServiceRequest) -> anyhow::Result<()>;

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<ServiceRequest>>;

    async fn list_for_requester(&self, requester_id: Uuid) -> anyhow::Result<Vec<ServiceRequest>>;

    async fn list_for_worker(&self, worker_id: Uuid) -> anyhow::Result<Vec<ServiceRequest>>;

    /// Requests for `service_id` in `zone_id` created in `(from, to]`.
    async fn count_recent(
        &self,
        service_id: Uuid,
        zone_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> anyhow::Result<u32>;

    /// Apply `patch` only if the stored status still equals `expected`. The
    /// check and the write are a single atomic step. Returns the updated row,
    /// or `None` when the request is missing or its status moved on.
    async fn compare_and_set(
        &self,
        id: Uuid,
        expected: RequestStatus,
        patch: &StatusPatch,
    ) -> anyhow::Result<Option<ServiceRequest>>;

    /// Delete the request only if its status is one of `allowed`. Returns
    /// whether a row was removed.
    async fn delete_if(&self, id: Uuid, allowed: &[RequestStatus]) -> anyhow::Result<bool>;
}

/// Everything the engine needs from persistence, injectable as one trait object.
pub trait Repository: CatalogStore + WorkerStore + RequestStore {}

impl<T> Repository for T where T: CatalogStore + WorkerStore + RequestStore {}

pub(crate) fn notification_body(notification: &Notification) -> serde_json::Value {
    serde_json::json!({
        "user_id": notification.user_id,
        "event": notification.kind.as_str(),
        "payload": notification.payload,
    })
}
