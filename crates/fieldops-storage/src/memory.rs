use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fieldops_core::{
    Area, PricingRule, RequestStatus, RuleStatus, Service, ServiceRequest, StatusPatch, Worker,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{CatalogStore, RequestStore, WorkerStore};

#[derive(Debug, Default)]
struct MemoryState {
    services: HashMap<Uuid, Service>,
    areas: HashMap<Uuid, Area>,
    rules: Vec<PricingRule>,
    workers: HashMap<Uuid, Worker>,
    requests: HashMap<Uuid, ServiceRequest>,
}

/// Process-local store. Every conditional write runs under a single lock
/// acquisition, so check and write cannot interleave with another caller.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_service(&self, service: Service) {
        self.state.lock().await.services.insert(service.id, service);
    }

    pub async fn put_area(&self, area: Area) {
        self.state.lock().await.areas.insert(area.id, area);
    }

    pub async fn put_rule(&self, rule: PricingRule) {
        let mut state = self.state.lock().await;
        state.rules.retain(|r| r.id != rule.id);
        state.rules.push(rule);
    }

    pub async fn put_worker(&self, worker: Worker) {
        self.state.lock().await.workers.insert(worker.id, worker);
    }

    pub async fn request_count(&self) -> usize {
        self.state.lock().await.requests.len()
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn service(&self, id: Uuid) -> anyhow::Result<Option<Service>> {
        Ok(self.state.lock().await.services.get(&id).cloned())
    }

    async fn area(&self, id: Uuid) -> anyhow::Result<Option<Area>> {
        Ok(self.state.lock().await.areas.get(&id).cloned())
    }

    async fn pricing_rules_for_zone(&self, zone_id: Uuid) -> anyhow::Result<Vec<PricingRule>> {
        let state = self.state.lock().await;
        let mut rules = state
            .rules
            .iter()
            .filter(|r| r.zone_id == zone_id && r.status == RuleStatus::Active)
            .cloned()
            .collect::<Vec<_>>();
        rules.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rules)
    }
}

#[async_trait]
impl WorkerStore for MemoryStore {
    async fn worker(&self, id: Uuid) -> anyhow::Result<Option<Worker>> {
        Ok(self.state.lock().await.workers.get(&id).cloned())
    }

    async fn qualified_workers(
        &self,
        service_id: Uuid,
        zone_id: Uuid,
    ) -> anyhow::Result<Vec<Worker>> {
        let state = self.state.lock().await;
        Ok(state
            .workers
            .values()
            .filter(|w| w.is_dispatchable() && w.offers(service_id) && w.covers_zone(zone_id))
            .cloned()
            .collect())
    }

    async fn record_completed_job(
        &self,
        worker_id: Uuid,
        rating: Option<f64>,
    ) -> anyhow::Result<Option<Worker>> {
        let mut state = self.state.lock().await;
        Ok(state.workers.get_mut(&worker_id).map(|worker| {
            worker.fold_rating(rating);
            worker.clone()
        }))
    }
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn insert(&self, request: &ServiceRequest) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if state.requests.contains_key(&request.id) {
            anyhow::bail!("service request {} already exists", request.id);
        }
        state.requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<ServiceRequest>> {
        Ok(self.state.lock().await.requests.get(&id).cloned())
    }

    async fn list_for_requester(&self, requester_id: Uuid) -> anyhow::Result<Vec<ServiceRequest>> {
        let state = self.state.lock().await;
        let mut rows = state
            .requests
            .values()
            .filter(|r| r.requester_id == requester_id)
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn list_for_worker(&self, worker_id: Uuid) -> anyhow::Result<Vec<ServiceRequest>> {
        let state = self.state.lock().await;
        let mut rows = state
            .requests
            .values()
            .filter(|r| r.worker_id == Some(worker_id))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn count_recent(
        &self,
        service_id: Uuid,
        zone_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> anyhow::Result<u32> {
        let state = self.state.lock().await;
        let count = state
            .requests
            .values()
            .filter(|r| r.service_id == service_id)
            .filter(|r| r.created_at > from && r.created_at <= to)
            .filter(|r| {
                state
                    .areas
                    .get(&r.area_id)
                    .is_some_and(|area| area.zone_id == zone_id)
            })
            .count();
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn compare_and_set(
        &self,
        id: Uuid,
        expected: RequestStatus,
        patch: &StatusPatch,
    ) -> anyhow::Result<Option<ServiceRequest>> {
        let mut state = self.state.lock().await;
        match state.requests.get_mut(&id) {
            Some(request) if request.status == expected => {
                patch.apply(request);
                Ok(Some(request.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn delete_if(&self, id: Uuid, allowed: &[RequestStatus]) -> anyhow::Result<bool> {
        let mut state = self.state.lock().await;
        let deletable = state
            .requests
            .get(&id)
            .is_some_and(|r| allowed.contains(&r.status));
        if deletable {
            state.requests.remove(&id);
        }
        Ok(deletable)
    }
}
