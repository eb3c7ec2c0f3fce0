use std::cmp::Ordering;
use std::sync::Arc;

use fieldops_core::{DispatchError, DispatchResult, Worker};
use fieldops_storage::Repository;
use uuid::Uuid;

/// Skill, zone, active and available, all at once.
pub fn is_eligible(worker: &Worker, service_id: Uuid, zone_id: Uuid) -> bool {
    worker.is_dispatchable() && worker.offers(service_id) && worker.covers_zone(zone_id)
}

/// Best rating first; ties go to the worker with more completed jobs.
pub fn rank_workers(mut workers: Vec<Worker>) -> Vec<Worker> {
    workers.sort_by(|a, b| {
        b.rating
            .partial_cmp(&a.rating)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.total_jobs.cmp(&a.total_jobs))
            .then_with(|| a.id.cmp(&b.id))
    });
    workers
}

#[derive(Clone)]
pub struct EligibilityResolver {
    repo: Arc<dyn Repository>,
}

impl EligibilityResolver {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    /// Workers dispatchable to `service_id` in the zone containing `area_id`.
    /// An empty list means no immediate match, not an error.
    pub async fn find_eligible_workers(
        &self,
        service_id: Uuid,
        area_id: Uuid,
    ) -> DispatchResult<Vec<Worker>> {
        let area = self
            .repo
            .area(area_id)
            .await?
            .ok_or_else(|| DispatchError::not_found("area", area_id))?;

        let candidates = self
            .repo
            .qualified_workers(service_id, area.zone_id)
            .await?
            .into_iter()
            .filter(|w| is_eligible(w, service_id, area.zone_id))
            .collect();
        Ok(rank_workers(candidates))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldops_core::{Area, Availability, WorkerStatus};
    use fieldops_storage::MemoryStore;

    fn worker(service_id: Uuid, zone_id: Uuid, rating: f64, total_jobs: u32) -> Worker {
        Worker {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            category_ids: vec![],
            service_ids: vec![service_id],
            zone_id: Some(zone_id),
            assigned_zone_ids: vec![],
            availability: Availability::Available,
            status: WorkerStatus::Active,
            rating,
            total_jobs,
        }
    }

    #[test]
    fn ranking_prefers_rating_then_experience() {
        let s = Uuid::new_v4();
        let z = Uuid::new_v4();
        let veteran = worker(s, z, 4.5, 120);
        let newcomer = worker(s, z, 4.5, 3);
        let star = worker(s, z, 4.9, 10);
        let ranked = rank_workers(vec![newcomer.clone(), veteran.clone(), star.clone()]);
        let ids = ranked.iter().map(|w| w.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![star.id, veteran.id, newcomer.id]);
    }

    #[tokio::test]
    async fn only_dispatchable_skilled_workers_in_zone_are_returned() {
        let store = Arc::new(MemoryStore::new());
        let service_id = Uuid::new_v4();
        let zone_id = Uuid::new_v4();
        let area = Area { id: Uuid::new_v4(), zone_id, name: "Riverside".into() };
        store.put_area(area.clone()).await;

        let good = worker(service_id, zone_id, 4.0, 5);
        let mut via_assignment = worker(service_id, Uuid::new_v4(), 4.8, 2);
        via_assignment.assigned_zone_ids.push(zone_id);
        let mut offline = worker(service_id, zone_id, 5.0, 50);
        offline.availability = Availability::Offline;
        let mut pending = worker(service_id, zone_id, 5.0, 50);
        pending.status = WorkerStatus::Pending;
        let wrong_skill = worker(Uuid::new_v4(), zone_id, 5.0, 50);
        for w in [&good, &via_assignment, &offline, &pending, &wrong_skill] {
            store.put_worker(w.clone()).await;
        }

        let resolver = EligibilityResolver::new(store.clone());
        let found = resolver.find_eligible_workers(service_id, area.id).await.unwrap();
        let ids = found.iter().map(|w| w.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![via_assignment.id, good.id]);
        assert!(found.iter().all(|w| w.is_dispatchable() && w.offers(service_id)));
    }

    #[tokio::test]
    async fn no_match_is_an_empty_list() {
        let store = Arc::new(MemoryStore::new());
        let area = Area { id: Uuid::new_v4(), zone_id: Uuid::new_v4(), name: "Hills".into() };
        store.put_area(area.clone()).await;
        let resolver = EligibilityResolver::new(store);
        let found = resolver.find_eligible_workers(Uuid::new_v4(), area.id).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn unknown_area_is_not_found() {
        let resolver = EligibilityResolver::new(Arc::new(MemoryStore::new()));
        let err = resolver
            .find_eligible_workers(Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotFound { entity: "area", .. }));
    }
}
