//! PostgreSQL backend (sqlx).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use frictionary_core::{Suggestion, SuggestionDraft, VoteSign, VoteTally};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::info;

use crate::store::{SampleRange, StoreError, SuggestionBackend};

const SUGGESTION_COLUMNS: &str = "id, site, title, excerpt, reference_url, fetched_at, \
     votes_positive, votes_negative, sampling_key";

#[derive(Debug, Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!().run(&self.pool).await?;
        info!("suggestion schema is up to date");
        Ok(())
    }
}

fn row_to_suggestion(row: &PgRow) -> Result<Suggestion, sqlx::Error> {
    let positive: i64 = row.try_get("votes_positive")?;
    let negative: i64 = row.try_get("votes_negative")?;
    Ok(Suggestion {
        id: row.try_get("id")?,
        site: row.try_get("site")?,
        title: row.try_get("title")?,
        excerpt: row.try_get("excerpt")?,
        reference_url: row.try_get("reference_url")?,
        fetched_at: row.try_get("fetched_at")?,
        votes: VoteTally::from_counts(positive.max(0) as u64, negative.max(0) as u64),
        sampling_key: row.try_get("sampling_key")?,
    })
}

fn rows_to_suggestions(rows: &[PgRow]) -> Result<Vec<Suggestion>, StoreError> {
    rows.iter()
        .map(|row| row_to_suggestion(row).map_err(StoreError::from))
        .collect()
}

#[async_trait]
impl SuggestionBackend for PgBackend {
    async fn upsert_many(&self, drafts: &[SuggestionDraft]) -> Result<Vec<Suggestion>, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO suggestions
                   (id, site, title, excerpt, reference_url, fetched_at, sampling_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE
               SET site = EXCLUDED.site,
                   title = EXCLUDED.title,
                   excerpt = EXCLUDED.excerpt,
                   reference_url = EXCLUDED.reference_url,
                   fetched_at = EXCLUDED.fetched_at
            RETURNING {SUGGESTION_COLUMNS}
            "#
        );

        let mut tx = self.pool.begin().await?;
        let mut saved = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let row = sqlx::query(&sql)
                .bind(draft.id())
                .bind(&draft.site)
                .bind(&draft.title)
                .bind(&draft.excerpt)
                .bind(&draft.reference_url)
                .bind(draft.fetched_at)
                .bind(rand::random::<f64>())
                .fetch_one(&mut *tx)
                .await?;
            saved.push(row_to_suggestion(&row)?);
        }
        tx.commit().await?;
        Ok(saved)
    }

    async fn record_vote(&self, id: &str, sign: VoteSign) -> Result<VoteTally, StoreError> {
        let (up, down) = match sign {
            VoteSign::Up => (1i64, 0i64),
            VoteSign::Down => (0, 1),
        };
        let row = sqlx::query(
            r#"
            UPDATE suggestions
               SET votes_positive = votes_positive + $2,
                   votes_negative = votes_negative + $3
             WHERE id = $1
            RETURNING votes_positive, votes_negative
            "#,
        )
        .bind(id)
        .bind(up)
        .bind(down)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let positive: i64 = row.try_get("votes_positive")?;
        let negative: i64 = row.try_get("votes_negative")?;
        Ok(VoteTally::from_counts(positive as u64, negative as u64))
    }

    async fn top_by_score(&self, site: &str, limit: usize) -> Result<Vec<Suggestion>, StoreError> {
        let sql = format!(
            r#"
            SELECT {SUGGESTION_COLUMNS}
              FROM suggestions
             WHERE site = $1
             ORDER BY votes_positive - votes_negative DESC, id ASC
             LIMIT $2
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(site)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows_to_suggestions(&rows)
    }

    async fn sample(
        &self,
        site: &str,
        range: SampleRange,
        limit: usize,
    ) -> Result<Vec<Suggestion>, StoreError> {
        let clause = if range.descending {
            "sampling_key <= $2 ORDER BY sampling_key DESC"
        } else {
            "sampling_key >= $2 ORDER BY sampling_key ASC"
        };
        let sql = format!(
            "SELECT {SUGGESTION_COLUMNS} FROM suggestions WHERE site = $1 AND {clause} LIMIT $3"
        );
        let rows = sqlx::query(&sql)
            .bind(site)
            .bind(range.pivot)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows_to_suggestions(&rows)
    }

    async fn prune_outdated(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM suggestions
             WHERE fetched_at < $1
               AND votes_positive - votes_negative <= 0
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(site: &str, title: &str, excerpt: &str, fetched_at: DateTime<Utc>) -> SuggestionDraft {
        SuggestionDraft {
            site: site.to_string(),
            title: title.to_string(),
            excerpt: excerpt.to_string(),
            reference_url: format!("https://{site}.example/w/index.php?title={title}"),
            fetched_at,
        }
    }

    async fn backend() -> PgBackend {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a scratch database");
        let pool = PgPoolOptions::new().max_connections(2).connect(&url).await.unwrap();
        let backend = PgBackend::from_pool(pool);
        backend.migrate().await.unwrap();
        backend
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL"]
    async fn upsert_keeps_votes_and_sampling_key() {
        let backend = backend().await;
        let site = format!("pgtest{}", Utc::now().timestamp_micros());
        let now = Utc::now();

        let first = backend
            .upsert_many(&[draft(&site, "Osmium", "<b>Osmium</b> v1", now)])
            .await
            .unwrap();
        let id = first[0].id.clone();
        assert_eq!(id, format!("{site}:Osmium"));
        assert_eq!(first[0].votes.total, 0);

        backend.record_vote(&id, VoteSign::Up).await.unwrap();
        let tally = backend.record_vote(&id, VoteSign::Up).await.unwrap();
        assert_eq!((tally.positive, tally.total), (2, 2));

        let again = backend
            .upsert_many(&[draft(&site, "Osmium", "<b>Osmium</b> v2", now)])
            .await
            .unwrap();
        assert_eq!(again[0].excerpt, "<b>Osmium</b> v2");
        assert_eq!(again[0].votes.total, 2);
        assert_eq!(again[0].sampling_key, first[0].sampling_key);

        assert!(matches!(
            backend.record_vote(&format!("{site}:Nope"), VoteSign::Down).await,
            Err(StoreError::NotFound(_))
        ));

        let top = backend.top_by_score(&site, 10).await.unwrap();
        assert_eq!(top.len(), 1);

        let range = SampleRange {
            pivot: first[0].sampling_key,
            descending: false,
        };
        for r in [range, range.complement()] {
            let found = backend.sample(&site, r, 10).await.unwrap();
            assert_eq!(found.len(), 1, "{r:?}");
        }

        let later = now + chrono::Duration::days(30);
        // other rows in the scratch database may be pruned too
        backend.prune_outdated(later).await.unwrap();
        assert_eq!(backend.top_by_score(&site, 10).await.unwrap().len(), 1);
        backend.record_vote(&id, VoteSign::Down).await.unwrap();
        backend.record_vote(&id, VoteSign::Down).await.unwrap();
        assert!(backend.prune_outdated(later).await.unwrap() >= 1);
        assert!(backend.top_by_score(&site, 10).await.unwrap().is_empty());
    }
}
