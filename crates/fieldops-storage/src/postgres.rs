use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fieldops_core::{
    Area, PriceBreakdown, PricingRule, RequestStatus, Service, ServiceRequest, StatusPatch, Worker,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::{CatalogStore, RequestStore, WorkerStore};

const WORKER_COLUMNS: &str = r#"
    SELECT w.id, w.user_id, w.zone_id, w.availability, w.status, w.rating, w.total_jobs,
           ARRAY(SELECT ws.service_id FROM worker_services ws WHERE ws.worker_id = w.id) AS service_ids,
           ARRAY(SELECT wz.zone_id FROM worker_zones wz WHERE wz.worker_id = w.id) AS assigned_zone_ids,
           ARRAY(SELECT wc.category_id FROM worker_categories wc WHERE wc.worker_id = w.id) AS category_ids
      FROM workers w
"#;

const REQUEST_COLUMNS: &str = r#"
    id, requester_id, service_id, worker_id, area_id, title, description, address,
    urgency, status, base_price, final_price, price_breakdown, created_at, scheduled_at,
    started_at, completed_at, cancelled_at, cancellation_reason
"#;

/// Postgres-backed repository. Conditional transitions are single statements
/// guarded on the current status, so concurrent callers race inside the database.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")?;
        Ok(())
    }
}

fn worker_from_row(row: &PgRow) -> anyhow::Result<Worker> {
    let availability: String = row.try_get("availability")?;
    let status: String = row.try_get("status")?;
    let total_jobs: i32 = row.try_get("total_jobs")?;
    Ok(Worker {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        category_ids: row.try_get("category_ids")?,
        service_ids: row.try_get("service_ids")?,
        zone_id: row.try_get("zone_id")?,
        assigned_zone_ids: row.try_get("assigned_zone_ids")?,
        availability: availability.parse()?,
        status: status.parse()?,
        rating: row.try_get("rating")?,
        total_jobs: u32::try_from(total_jobs).unwrap_or(0),
    })
}

fn request_from_row(row: &PgRow) -> anyhow::Result<ServiceRequest> {
    let urgency: String = row.try_get("urgency")?;
    let status: String = row.try_get("status")?;
    let Json(price_breakdown): Json<PriceBreakdown> = row.try_get("price_breakdown")?;
    Ok(ServiceRequest {
        id: row.try_get("id")?,
        requester_id: row.try_get("requester_id")?,
        service_id: row.try_get("service_id")?,
        worker_id: row.try_get("worker_id")?,
        area_id: row.try_get("area_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        address: row.try_get("address")?,
        urgency: urgency.parse()?,
        status: status.parse()?,
        base_price: row.try_get("base_price")?,
        final_price: row.try_get("final_price")?,
        price_breakdown,
        created_at: row.try_get("created_at")?,
        scheduled_at: row.try_get("scheduled_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        cancelled_at: row.try_get("cancelled_at")?,
        cancellation_reason: row.try_get("cancellation_reason")?,
    })
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn service(&self, id: Uuid) -> anyhow::Result<Option<Service>> {
        let row = sqlx::query(
            r#"
            SELECT id, category_id, name, base_price
              FROM services
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("loading service {id}"))?;

        row.map(|row| -> anyhow::Result<Service> {
            Ok(Service {
                id: row.try_get("id")?,
                category_id: row.try_get("category_id")?,
                name: row.try_get("name")?,
                base_price: row.try_get("base_price")?,
            })
        })
        .transpose()
    }

    async fn area(&self, id: Uuid) -> anyhow::Result<Option<Area>> {
        let row = sqlx::query("SELECT id, zone_id, name FROM areas WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading area {id}"))?;

        row.map(|row| -> anyhow::Result<Area> {
            Ok(Area {
                id: row.try_get("id")?,
                zone_id: row.try_get("zone_id")?,
                name: row.try_get("name")?,
            })
        })
        .transpose()
    }

    async fn pricing_rules_for_zone(&self, zone_id: Uuid) -> anyhow::Result<Vec<PricingRule>> {
        let rows = sqlx::query(
            r#"
            SELECT id, zone_id, window_start, window_end, multiplier, status, created_at
              FROM pricing_rules
             WHERE zone_id = $1
               AND status = 'active'
             ORDER BY created_at DESC
            "#,
        )
        .bind(zone_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("loading pricing rules for zone {zone_id}"))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            out.push(PricingRule {
                id: row.try_get("id")?,
                zone_id: row.try_get("zone_id")?,
                window_start: row.try_get("window_start")?,
                window_end: row.try_get("window_end")?,
                multiplier: row.try_get("multiplier")?,
                status: status.parse()?,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl WorkerStore for PgStore {
    async fn worker(&self, id: Uuid) -> anyhow::Result<Option<Worker>> {
        let sql = format!("{WORKER_COLUMNS} WHERE w.id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading worker {id}"))?;
        row.as_ref().map(worker_from_row).transpose()
    }

    async fn qualified_workers(
        &self,
        service_id: Uuid,
        zone_id: Uuid,
    ) -> anyhow::Result<Vec<Worker>> {
        let sql = format!(
            r#"{WORKER_COLUMNS}
             WHERE w.status = 'active'
               AND w.availability = 'available'
               AND EXISTS (
                   SELECT 1 FROM worker_services ws
                    WHERE ws.worker_id = w.id AND ws.service_id = $1
               )
               AND (
                   w.zone_id = $2
                   OR EXISTS (
                       SELECT 1 FROM worker_zones wz
                        WHERE wz.worker_id = w.id AND wz.zone_id = $2
                   )
               )
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(service_id)
            .bind(zone_id)
            .fetch_all(&self.pool)
            .await
            .with_context(|| {
                format!("loading workers for service {service_id} in zone {zone_id}")
            })?;
        rows.iter().map(worker_from_row).collect()
    }

    async fn record_completed_job(
        &self,
        worker_id: Uuid,
        rating: Option<f64>,
    ) -> anyhow::Result<Option<Worker>> {
        let updated = sqlx::query(
            r#"
            UPDATE workers
               SET rating = CASE
                       WHEN $2::float8 IS NULL THEN rating
                       WHEN rating <= 0 OR total_jobs = 0 THEN $2::float8
                       ELSE (rating * total_jobs + $2::float8) / (total_jobs + 1)
                   END,
                   total_jobs = total_jobs + 1
             WHERE id = $1
            "#,
        )
        .bind(worker_id)
        .bind(rating)
        .execute(&self.pool)
        .await
        .with_context(|| format!("recording completed job for worker {worker_id}"))?;

        if updated.rows_affected() == 0 {
            return Ok(None);
        }
        self.worker(worker_id).await
    }
}

#[async_trait]
impl RequestStore for PgStore {
    async fn insert(&self, request: &ServiceRequest) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO service_requests (
                id, requester_id, service_id, worker_id, area_id, title, description, address,
                urgency, status, base_price, final_price, price_breakdown, created_at, scheduled_at,
                started_at, completed_at, cancelled_at, cancellation_reason
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19
            )
            "#,
        )
        .bind(request.id)
        .bind(request.requester_id)
        .bind(request.service_id)
        .bind(request.worker_id)
        .bind(request.area_id)
        .bind(&request.title)
        .bind(&request.description)
        .bind(&request.address)
        .bind(request.urgency.as_str())
        .bind(request.status.as_str())
        .bind(request.base_price)
        .bind(request.final_price)
        .bind(Json(&request.price_breakdown))
        .bind(request.created_at)
        .bind(request.scheduled_at)
        .bind(request.started_at)
        .bind(request.completed_at)
        .bind(request.cancelled_at)
        .bind(&request.cancellation_reason)
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting service request {}", request.id))?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<ServiceRequest>> {
        let sql = format!("SELECT {REQUEST_COLUMNS} FROM service_requests WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading service request {id}"))?;
        row.as_ref().map(request_from_row).transpose()
    }

    async fn list_for_requester(&self, requester_id: Uuid) -> anyhow::Result<Vec<ServiceRequest>> {
        let sql = format!(
            "SELECT {REQUEST_COLUMNS} FROM service_requests WHERE requester_id = $1 ORDER BY created_at DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(requester_id)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("listing requests for requester {requester_id}"))?;
        rows.iter().map(request_from_row).collect()
    }

    async fn list_for_worker(&self, worker_id: Uuid) -> anyhow::Result<Vec<ServiceRequest>> {
        let sql = format!(
            "SELECT {REQUEST_COLUMNS} FROM service_requests WHERE worker_id = $1 ORDER BY created_at DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(worker_id)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("listing requests for worker {worker_id}"))?;
        rows.iter().map(request_from_row).collect()
    }

    async fn count_recent(
        &self,
        service_id: Uuid,
        zone_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> anyhow::Result<u32> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
              FROM service_requests sr
              JOIN areas a ON a.id = sr.area_id
             WHERE sr.service_id = $1
               AND a.zone_id = $2
               AND sr.created_at > $3
               AND sr.created_at <= $4
            "#,
        )
        .bind(service_id)
        .bind(zone_id)
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("counting recent requests for service {service_id}"))?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn compare_and_set(
        &self,
        id: Uuid,
        expected: RequestStatus,
        patch: &StatusPatch,
    ) -> anyhow::Result<Option<ServiceRequest>> {
        let sql = format!(
            r#"
            UPDATE service_requests
               SET status = COALESCE($3, status),
                   worker_id = CASE WHEN $9 THEN NULL ELSE COALESCE($4, worker_id) END,
                   started_at = COALESCE($5, started_at),
                   completed_at = COALESCE($6, completed_at),
                   cancelled_at = COALESCE($7, cancelled_at),
                   cancellation_reason = COALESCE($8, cancellation_reason)
             WHERE id = $1
               AND status = $2
            RETURNING {REQUEST_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(expected.as_str())
            .bind(patch.status.map(|s| s.as_str()))
            .bind(patch.worker_id)
            .bind(patch.started_at)
            .bind(patch.completed_at)
            .bind(patch.cancelled_at)
            .bind(&patch.cancellation_reason)
            .bind(patch.clear_worker)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("updating service request {id} from {expected}"))?;
        row.as_ref().map(request_from_row).transpose()
    }

    async fn delete_if(&self, id: Uuid, allowed: &[RequestStatus]) -> anyhow::Result<bool> {
        let allowed = allowed.iter().map(|s| s.as_str().to_string()).collect::<Vec<_>>();
        let result = sqlx::query("DELETE FROM service_requests WHERE id = $1 AND status = ANY($2)")
            .bind(id)
            .bind(&allowed)
            .execute(&self.pool)
            .await
            .with_context(|| format!("deleting service request {id}"))?;
        Ok(result.rows_affected() > 0)
    }
}
