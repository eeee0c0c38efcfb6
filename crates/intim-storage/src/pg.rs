//! Postgres-backed store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use intim_core::{Subject, SubjectProfile, SubjectType, SyncTarget};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::{PendingSubject, StoreError, SubjectRepository, WatermarkStore};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn load_subject(
        &self,
        subject_id: &str,
    ) -> Result<Option<(Subject, Option<SyncTarget>)>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT s.id, s.name, s.email, s.registration_key, s.organization_code,
                   s.subject_type, s.access_token, s.created_at,
                   t.sink_database_id, t.validation_database_id
              FROM subjects s
              LEFT JOIN sync_targets t ON t.subject_id = s.id
             WHERE s.id = $1
            "#,
        )
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let subject = subject_from_row(&row)?;
        let sink: Option<String> = row.try_get("sink_database_id")?;
        let validation: Option<String> = row.try_get("validation_database_id")?;
        let target = match (sink, validation) {
            (Some(sink_database_id), Some(validation_database_id)) => Some(SyncTarget {
                subject_id: subject.id.clone(),
                sink_database_id,
                validation_database_id,
            }),
            _ => None,
        };
        Ok(Some((subject, target)))
    }
}

fn subject_from_row(row: &PgRow) -> Result<Subject, sqlx::Error> {
    let subject_type: Option<String> = row.try_get("subject_type")?;
    Ok(Subject {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        registration_key: row.try_get("registration_key")?,
        organization_code: row.try_get("organization_code")?,
        subject_type: subject_type.and_then(|t| t.parse::<SubjectType>().ok()),
        access_token: row.try_get("access_token")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl SubjectRepository for PgStore {
    async fn find_incomplete(&self) -> Result<Vec<PendingSubject>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT s.id, s.access_token, t.sink_database_id, t.validation_database_id
              FROM subjects s
              JOIN sync_targets t ON t.subject_id = s.id
             WHERE s.registration_key IS NULL
                OR (s.organization_code IS NULL
                    AND (s.subject_type IS NULL OR s.subject_type = 'company'))
             ORDER BY s.created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(PendingSubject {
                subject_id: row.try_get("id")?,
                access_token: row.try_get("access_token")?,
                sink_database_id: row.try_get("sink_database_id")?,
                validation_database_id: row.try_get("validation_database_id")?,
            });
        }
        debug!(count = out.len(), "loaded incomplete subjects");
        Ok(out)
    }

    async fn complete_profile(
        &self,
        subject_id: &str,
        profile: &SubjectProfile,
    ) -> Result<Option<SyncTarget>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE subjects
               SET registration_key = $2,
                   organization_code = $3,
                   subject_type = $4
             WHERE id = $1
            "#,
        )
        .bind(subject_id)
        .bind(profile.registration_key())
        .bind(profile.organization_code())
        .bind(profile.subject_type().as_str())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let target = sqlx::query(
            r#"
            SELECT sink_database_id, validation_database_id
              FROM sync_targets
             WHERE subject_id = $1
            "#,
        )
        .bind(subject_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = target else {
            tx.rollback().await?;
            return Ok(None);
        };
        let target = SyncTarget {
            subject_id: subject_id.to_string(),
            sink_database_id: row.try_get("sink_database_id")?,
            validation_database_id: row.try_get("validation_database_id")?,
        };
        tx.commit().await?;
        Ok(Some(target))
    }
}

#[async_trait]
impl WatermarkStore for PgStore {
    async fn upsert_watermark(
        &self,
        subject_id: &str,
        treated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO watermarks (subject_id, last_treated_at, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (subject_id) DO UPDATE
               SET last_treated_at = EXCLUDED.last_treated_at,
                   updated_at = NOW()
            "#,
        )
        .bind(subject_id)
        .bind(treated_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn watermark(&self, subject_id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let value = sqlx::query_scalar::<_, DateTime<Utc>>(
            "SELECT last_treated_at FROM watermarks WHERE subject_id = $1",
        )
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }
}
