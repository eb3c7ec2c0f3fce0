use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, FixedOffset, Offset, Timelike, Utc, Weekday};
use fieldops_core::{
    DispatchError, DispatchResult, FactorKind, PriceBreakdown, PriceFactor, PricingRule, Urgency,
};
use fieldops_storage::Repository;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::PricingConfig;

/// Inputs the factor functions read. Lookup-backed fields are `None` when the
/// lookup failed; the matching factor then falls back to 1.0.
#[derive(Debug, Clone, PartialEq)]
pub struct PricingContext {
    pub base_price: f64,
    pub request_time: DateTime<Utc>,
    pub urgency: Urgency,
    pub zone_rule: Option<PricingRule>,
    pub recent_requests: Option<u32>,
    pub available_workers: Option<u32>,
}

type FactorFn = fn(&PricingContext, &PricingConfig) -> PriceFactor;

/// Factors in application order.
pub const FACTOR_PIPELINE: [FactorFn; 5] = [
    zone_factor,
    time_of_day_factor,
    demand_factor,
    urgency_factor,
    availability_factor,
];

impl PricingContext {
    pub fn breakdown(&self, config: &PricingConfig) -> PriceBreakdown {
        let factors = FACTOR_PIPELINE
            .iter()
            .map(|apply| apply(self, config))
            .collect();
        PriceBreakdown::from_factors(self.base_price, factors)
    }
}

fn factor(kind: FactorKind, multiplier: f64, label: impl Into<String>) -> PriceFactor {
    PriceFactor {
        kind,
        multiplier,
        label: label.into(),
    }
}

fn zone_factor(ctx: &PricingContext, _config: &PricingConfig) -> PriceFactor {
    match &ctx.zone_rule {
        Some(rule) => factor(
            FactorKind::Zone,
            rule.multiplier,
            format!("Zone rate x{}", rule.multiplier),
        ),
        None => factor(FactorKind::Zone, 1.0, "Standard zone rate"),
    }
}

fn local_time(request_time: DateTime<Utc>, offset_minutes: i32) -> DateTime<FixedOffset> {
    let offset = FixedOffset::east_opt(offset_minutes * 60).unwrap_or_else(|| Utc.fix());
    request_time.with_timezone(&offset)
}

/// Peak hours are checked first, then weekend, then late night. Only the first
/// match applies.
fn time_of_day_factor(ctx: &PricingContext, config: &PricingConfig) -> PriceFactor {
    let cfg = &config.time_of_day;
    let local = local_time(ctx.request_time, cfg.utc_offset_minutes);
    let hour = local.hour();

    if cfg.peak_windows.iter().any(|w| w.contains(hour)) {
        factor(FactorKind::TimeOfDay, cfg.peak_multiplier, "Peak hours")
    } else if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
        factor(FactorKind::TimeOfDay, cfg.weekend_multiplier, "Weekend")
    } else if cfg.late_night.contains(hour) {
        factor(FactorKind::TimeOfDay, cfg.late_night_multiplier, "Late night")
    } else {
        factor(FactorKind::TimeOfDay, 1.0, "Standard hours")
    }
}

fn demand_factor(ctx: &PricingContext, config: &PricingConfig) -> PriceFactor {
    let cfg = &config.demand;
    match ctx.recent_requests {
        Some(n) if n > cfg.high_above => factor(
            FactorKind::Demand,
            cfg.high_multiplier,
            format!("High demand ({n} recent requests)"),
        ),
        Some(n) if n >= cfg.moderate_from => factor(
            FactorKind::Demand,
            cfg.moderate_multiplier,
            format!("Moderate demand ({n} recent requests)"),
        ),
        Some(_) => factor(FactorKind::Demand, 1.0, "Normal demand"),
        None => factor(FactorKind::Demand, 1.0, "Demand data unavailable"),
    }
}

fn urgency_factor(ctx: &PricingContext, config: &PricingConfig) -> PriceFactor {
    match ctx.urgency {
        Urgency::Emergency => factor(
            FactorKind::Urgency,
            config.urgency.emergency_multiplier,
            "Emergency",
        ),
        Urgency::Urgent => factor(FactorKind::Urgency, config.urgency.urgent_multiplier, "Urgent"),
        Urgency::Normal => factor(FactorKind::Urgency, 1.0, "Normal priority"),
    }
}

fn availability_factor(ctx: &PricingContext, config: &PricingConfig) -> PriceFactor {
    let cfg = &config.availability;
    match ctx.available_workers {
        Some(n) if n <= cfg.scarce_at_most => factor(
            FactorKind::Availability,
            cfg.scarce_multiplier,
            format!("Very few workers available ({n})"),
        ),
        Some(n) if n <= cfg.limited_at_most => factor(
            FactorKind::Availability,
            cfg.limited_multiplier,
            format!("Limited workers available ({n})"),
        ),
        Some(_) => factor(FactorKind::Availability, 1.0, "Workers available"),
        None => factor(FactorKind::Availability, 1.0, "Availability data unavailable"),
    }
}

/// Read-only price computation. Only a missing service aborts; every other
/// lookup failure degrades its factor to 1.0.
#[derive(Clone)]
pub struct PricingEngine {
    repo: Arc<dyn Repository>,
    config: Arc<PricingConfig>,
}

impl PricingEngine {
    pub fn new(repo: Arc<dyn Repository>, config: PricingConfig) -> Self {
        Self {
            repo,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &PricingConfig {
        &self.config
    }

    pub async fn compute_price(
        &self,
        service_id: Uuid,
        zone_id: Uuid,
        request_time: DateTime<Utc>,
        urgency: Urgency,
    ) -> DispatchResult<PriceBreakdown> {
        let service = self
            .repo
            .service(service_id)
            .await?
            .ok_or_else(|| DispatchError::not_found("service", service_id))?;

        let ctx = PricingContext {
            base_price: service.base_price,
            request_time,
            urgency,
            zone_rule: self.zone_rule(zone_id, request_time).await,
            recent_requests: self.recent_requests(service_id, zone_id, request_time).await,
            available_workers: self.available_workers(service_id, zone_id).await,
        };
        let breakdown = ctx.breakdown(&self.config);
        debug!(
            %service_id,
            %zone_id,
            final_price = breakdown.final_price,
            "computed price"
        );
        Ok(breakdown)
    }

    async fn zone_rule(&self, zone_id: Uuid, request_time: DateTime<Utc>) -> Option<PricingRule> {
        let rules = match self.repo.pricing_rules_for_zone(zone_id).await {
            Ok(rules) => rules,
            Err(err) => {
                warn!(%zone_id, error = %err, "zone rule lookup failed; using 1.0");
                return None;
            }
        };
        let local =
            local_time(request_time, self.config.time_of_day.utc_offset_minutes).time();
        rules
            .into_iter()
            .filter(|rule| rule.multiplier > 0.0 && rule.covers(local))
            .max_by_key(|rule| rule.created_at)
    }

    async fn recent_requests(
        &self,
        service_id: Uuid,
        zone_id: Uuid,
        request_time: DateTime<Utc>,
    ) -> Option<u32> {
        let from = request_time - Duration::minutes(self.config.demand.lookback_minutes);
        match self
            .repo
            .count_recent(service_id, zone_id, from, request_time)
            .await
        {
            Ok(count) => Some(count),
            Err(err) => {
                warn!(%service_id, %zone_id, error = %err, "demand lookup failed; using 1.0");
                None
            }
        }
    }

    async fn available_workers(&self, service_id: Uuid, zone_id: Uuid) -> Option<u32> {
        match self.repo.qualified_workers(service_id, zone_id).await {
            Ok(workers) => Some(u32::try_from(workers.len()).unwrap_or(u32::MAX)),
            Err(err) => {
                warn!(%service_id, %zone_id, error = %err, "availability lookup failed; using 1.0");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use failing::FailingRepo;
    use fieldops_core::{
        Area, Availability, RequestStatus, RuleStatus, Service, ServiceRequest, Worker,
        WorkerStatus,
    };
    use fieldops_storage::{MemoryStore, RequestStore};

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).single().unwrap()
    }

    // 2026-03-04 is a Wednesday, 2026-03-07 a Saturday.
    fn wednesday(h: u32) -> DateTime<Utc> {
        at(2026, 3, 4, h, 0)
    }

    fn ctx(request_time: DateTime<Utc>) -> PricingContext {
        PricingContext {
            base_price: 100.0,
            request_time,
            urgency: Urgency::Normal,
            zone_rule: None,
            recent_requests: Some(0),
            available_workers: Some(10),
        }
    }

    fn time_label(t: DateTime<Utc>) -> (f64, String) {
        let f = time_of_day_factor(&ctx(t), &PricingConfig::default());
        (f.multiplier, f.label)
    }

    #[test]
    fn time_of_day_bands() {
        assert_eq!(time_label(wednesday(8)), (1.2, "Peak hours".into()));
        assert_eq!(time_label(wednesday(19)), (1.2, "Peak hours".into()));
        assert_eq!(time_label(wednesday(10)), (1.0, "Standard hours".into()));
        assert_eq!(time_label(wednesday(23)), (1.3, "Late night".into()));
        assert_eq!(time_label(wednesday(5)), (1.3, "Late night".into()));
        assert_eq!(time_label(wednesday(6)), (1.0, "Standard hours".into()));
        assert_eq!(time_label(at(2026, 3, 7, 13, 0)), (1.15, "Weekend".into()));
    }

    #[test]
    fn peak_wins_over_weekend_and_weekend_over_late_night() {
        // Saturday morning peak.
        assert_eq!(time_label(at(2026, 3, 7, 9, 0)).0, 1.2);
        // Sunday late night.
        assert_eq!(time_label(at(2026, 3, 8, 23, 0)).0, 1.15);
    }

    #[test]
    fn local_offset_shifts_the_band() {
        let mut config = PricingConfig::default();
        config.time_of_day.utc_offset_minutes = 180;
        // 06:00 UTC is 09:00 at +03:00.
        let f = time_of_day_factor(&ctx(wednesday(6)), &config);
        assert_eq!(f.multiplier, 1.2);
    }

    #[test]
    fn demand_thresholds() {
        let config = PricingConfig::default();
        let m = |n| {
            let mut c = ctx(wednesday(12));
            c.recent_requests = n;
            demand_factor(&c, &config).multiplier
        };
        assert_eq!(m(Some(0)), 1.0);
        assert_eq!(m(Some(2)), 1.0);
        assert_eq!(m(Some(3)), 1.2);
        assert_eq!(m(Some(5)), 1.2);
        assert_eq!(m(Some(6)), 1.5);
        assert_eq!(m(None), 1.0);
    }

    #[test]
    fn availability_thresholds() {
        let config = PricingConfig::default();
        let m = |n| {
            let mut c = ctx(wednesday(12));
            c.available_workers = n;
            availability_factor(&c, &config).multiplier
        };
        assert_eq!(m(Some(0)), 1.3);
        assert_eq!(m(Some(2)), 1.3);
        assert_eq!(m(Some(3)), 1.1);
        assert_eq!(m(Some(5)), 1.1);
        assert_eq!(m(Some(6)), 1.0);
        assert_eq!(m(None), 1.0);
    }

    #[test]
    fn emergency_at_peak_is_240() {
        let mut c = ctx(wednesday(9));
        c.urgency = Urgency::Emergency;
        let breakdown = c.breakdown(&PricingConfig::default());
        assert_eq!(breakdown.final_price, 240.0);
        let kinds = breakdown.factors.iter().map(|f| f.kind).collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![
                FactorKind::Zone,
                FactorKind::TimeOfDay,
                FactorKind::Demand,
                FactorKind::Urgency,
                FactorKind::Availability,
            ]
        );
    }

    #[test]
    fn every_factor_combination_stays_at_or_above_base() {
        let config = PricingConfig::default();
        for hour in 0..24 {
            for day in 2..=8 {
                for urgency in Urgency::ALL {
                    for demand in [0, 3, 9] {
                        for workers in [0, 4, 12] {
                            let c = PricingContext {
                                base_price: 80.0,
                                request_time: at(2026, 3, day, hour, 30),
                                urgency: *urgency,
                                zone_rule: None,
                                recent_requests: Some(demand),
                                available_workers: Some(workers),
                            };
                            assert!(c.breakdown(&config).final_price >= 80.0);
                        }
                    }
                }
            }
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        service: Service,
        zone_id: Uuid,
        area: Area,
    }

    async fn fixture(workers: usize) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let service = Service {
            id: Uuid::new_v4(),
            category_id: Uuid::new_v4(),
            name: "Boiler repair".into(),
            base_price: 100.0,
        };
        let zone_id = Uuid::new_v4();
        let area = Area { id: Uuid::new_v4(), zone_id, name: "Harbour".into() };
        store.put_service(service.clone()).await;
        store.put_area(area.clone()).await;
        for _ in 0..workers {
            store
                .put_worker(Worker {
                    id: Uuid::new_v4(),
                    user_id: Uuid::new_v4(),
                    category_ids: vec![service.category_id],
                    service_ids: vec![service.id],
                    zone_id: Some(zone_id),
                    assigned_zone_ids: vec![],
                    availability: Availability::Available,
                    status: WorkerStatus::Active,
                    rating: 4.0,
                    total_jobs: 3,
                })
                .await;
        }
        Fixture { store, service, zone_id, area }
    }

    fn past_request(f: &Fixture, created_at: DateTime<Utc>) -> ServiceRequest {
        ServiceRequest {
            id: Uuid::new_v4(),
            requester_id: Uuid::new_v4(),
            service_id: f.service.id,
            worker_id: None,
            area_id: f.area.id,
            title: "t".into(),
            description: "d".into(),
            address: "a".into(),
            urgency: Urgency::Normal,
            status: RequestStatus::Pending,
            base_price: 100.0,
            final_price: 100.0,
            price_breakdown: PriceBreakdown::from_factors(100.0, vec![]),
            created_at,
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            cancellation_reason: None,
        }
    }

    #[tokio::test]
    async fn scenario_emergency_peak_with_adequate_supply() {
        let f = fixture(6).await;
        let engine = PricingEngine::new(f.store.clone(), PricingConfig::default());
        let breakdown = engine
            .compute_price(f.service.id, f.zone_id, wednesday(9), Urgency::Emergency)
            .await
            .unwrap();
        assert_eq!(breakdown.final_price, 240.0);
        assert_eq!(breakdown.base_price, 100.0);
    }

    #[tokio::test]
    async fn unknown_service_is_not_found() {
        let f = fixture(6).await;
        let engine = PricingEngine::new(f.store.clone(), PricingConfig::default());
        let err = engine
            .compute_price(Uuid::new_v4(), f.zone_id, wednesday(12), Urgency::Normal)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotFound { entity: "service", .. }));
    }

    #[tokio::test]
    async fn newest_covering_zone_rule_applies() {
        let f = fixture(6).await;
        let t = |h| chrono::NaiveTime::from_hms_opt(h, 0, 0).unwrap();
        let rule = |multiplier, start, end, created_at, status| PricingRule {
            id: Uuid::new_v4(),
            zone_id: f.zone_id,
            window_start: start,
            window_end: end,
            multiplier,
            status,
            created_at,
        };
        f.store.put_rule(rule(1.1, None, None, wednesday(1), RuleStatus::Active)).await;
        f.store
            .put_rule(rule(1.25, Some(t(11)), Some(t(14)), wednesday(2), RuleStatus::Active))
            .await;
        f.store.put_rule(rule(3.0, None, None, wednesday(3), RuleStatus::Inactive)).await;

        let engine = PricingEngine::new(f.store.clone(), PricingConfig::default());
        let noon = engine
            .compute_price(f.service.id, f.zone_id, wednesday(12), Urgency::Normal)
            .await
            .unwrap();
        assert_eq!(noon.factor(FactorKind::Zone).unwrap().multiplier, 1.25);
        assert_eq!(noon.final_price, 125.0);

        let afternoon = engine
            .compute_price(f.service.id, f.zone_id, wednesday(15), Urgency::Normal)
            .await
            .unwrap();
        assert_eq!(afternoon.factor(FactorKind::Zone).unwrap().multiplier, 1.1);
    }

    #[tokio::test]
    async fn demand_counts_the_two_hours_before_the_request() {
        let f = fixture(6).await;
        let now = wednesday(12);
        for minutes in [10, 40, 70, 100] {
            f.store
                .insert(&past_request(&f, now - Duration::minutes(minutes)))
                .await
                .unwrap();
        }
        f.store
            .insert(&past_request(&f, now - Duration::minutes(150)))
            .await
            .unwrap();

        let engine = PricingEngine::new(f.store.clone(), PricingConfig::default());
        let breakdown = engine
            .compute_price(f.service.id, f.zone_id, now, Urgency::Normal)
            .await
            .unwrap();
        assert_eq!(breakdown.factor(FactorKind::Demand).unwrap().multiplier, 1.2);
        assert_eq!(breakdown.final_price, 120.0);
    }

    #[tokio::test]
    async fn repeated_quotes_are_identical() {
        let f = fixture(2).await;
        let engine = PricingEngine::new(f.store.clone(), PricingConfig::default());
        let a = engine
            .compute_price(f.service.id, f.zone_id, wednesday(23), Urgency::Urgent)
            .await
            .unwrap();
        let b = engine
            .compute_price(f.service.id, f.zone_id, wednesday(23), Urgency::Urgent)
            .await
            .unwrap();
        assert_eq!(a, b);
        // 100 * 1.3 (night) * 1.5 (urgent) * 1.3 (two workers)
        assert_eq!(a.final_price, 253.5);
    }

    #[tokio::test]
    async fn failed_sub_lookups_degrade_to_neutral_factors() {
        let repo = Arc::new(FailingRepo::with_service(100.0));
        let engine = PricingEngine::new(repo.clone(), PricingConfig::default());
        let breakdown = engine
            .compute_price(repo.service_id, Uuid::new_v4(), wednesday(12), Urgency::Normal)
            .await
            .unwrap();
        assert_eq!(breakdown.final_price, 100.0);
        assert_eq!(
            breakdown.factor(FactorKind::Demand).unwrap().label,
            "Demand data unavailable"
        );
        assert_eq!(
            breakdown.factor(FactorKind::Availability).unwrap().label,
            "Availability data unavailable"
        );
    }

    /// Repository whose every lookup except the service catalog errors.
    mod failing {
        use super::*;
        use anyhow::anyhow;
        use fieldops_core::StatusPatch;
        use fieldops_storage::{CatalogStore, WorkerStore};

        pub struct FailingRepo {
            pub service_id: Uuid,
            base_price: f64,
        }

        impl FailingRepo {
            pub fn with_service(base_price: f64) -> Self {
                Self { service_id: Uuid::new_v4(), base_price }
            }
        }

        #[async_trait::async_trait]
        impl CatalogStore for FailingRepo {
            async fn service(&self, id: Uuid) -> anyhow::Result<Option<Service>> {
                Ok((id == self.service_id).then(|| Service {
                    id,
                    category_id: Uuid::nil(),
                    name: "flaky".into(),
                    base_price: self.base_price,
                }))
            }
            async fn area(&self, _id: Uuid) -> anyhow::Result<Option<Area>> {
                Err(anyhow!("directory offline"))
            }
            async fn pricing_rules_for_zone(
                &self,
                _zone_id: Uuid,
            ) -> anyhow::Result<Vec<PricingRule>> {
                Err(anyhow!("rules table locked"))
            }
        }

        #[async_trait::async_trait]
        impl WorkerStore for FailingRepo {
            async fn worker(&self, _id: Uuid) -> anyhow::Result<Option<Worker>> {
                Err(anyhow!("workers offline"))
            }
            async fn qualified_workers(&self, _s: Uuid, _z: Uuid) -> anyhow::Result<Vec<Worker>> {
                Err(anyhow!("workers offline"))
            }
            async fn record_completed_job(
                &self,
                _worker_id: Uuid,
                _rating: Option<f64>,
            ) -> anyhow::Result<Option<Worker>> {
                Err(anyhow!("workers offline"))
            }
        }

        #[async_trait::async_trait]
        impl RequestStore for FailingRepo {
            async fn insert(&self, _request: &ServiceRequest) -> anyhow::Result<()> {
                Err(anyhow!("requests offline"))
            }
            async fn get(&self, _id: Uuid) -> anyhow::Result<Option<ServiceRequest>> {
                Err(anyhow!("requests offline"))
            }
            async fn list_for_requester(&self, _id: Uuid) -> anyhow::Result<Vec<ServiceRequest>> {
                Err(anyhow!("requests offline"))
            }
            async fn list_for_worker(&self, _id: Uuid) -> anyhow::Result<Vec<ServiceRequest>> {
                Err(anyhow!("requests offline"))
            }
            async fn count_recent(
                &self,
                _service_id: Uuid,
                _zone_id: Uuid,
                _from: DateTime<Utc>,
                _to: DateTime<Utc>,
            ) -> anyhow::Result<u32> {
                Err(anyhow!("requests offline"))
            }
            async fn compare_and_set(
                &self,
                _id: Uuid,
                _expected: RequestStatus,
                _patch: &StatusPatch,
            ) -> anyhow::Result<Option<ServiceRequest>> {
                Err(anyhow!("requests offline"))
            }
            async fn delete_if(
                &self,
                _id: Uuid,
                _allowed: &[RequestStatus],
            ) -> anyhow::Result<bool> {
                Err(anyhow!("requests offline"))
            }
        }
    }
}
