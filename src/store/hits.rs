//! Bucketed per-minute hit counters.

use super::{ip_from_bytes, ip_to_bytes};
use crate::error::Error;
use crate::policy::{group_column, AutobanProfile};
use chrono::{DateTime, Timelike, Utc};
use sqlx::PgPool;
use std::net::IpAddr;

/// One row of the top-offenders listing: an address and its total count for
/// the current day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopHit {
    pub ip: IpAddr,
    pub count: i64,
}

/// Store of `(ip, day, hour, tenminute, minute)` hit buckets.
#[derive(Clone)]
pub struct HitStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct TotalRow {
    ip: Vec<u8>,
    total: i64,
}

impl HitStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record one hit. The increment is a single upsert statement so
    /// concurrent adds for the same bucket never lose counts.
    pub async fn add(&self, ip: IpAddr, timestamp: DateTime<Utc>) -> Result<(), Error> {
        let minute = timestamp.minute() as i16;

        sqlx::query(
            r#"
            INSERT INTO ip_monitoring (day_date, hour, tenminute, minute, ip, count)
            VALUES ($1, $2, $3, $4, $5, 1)
            ON CONFLICT (ip, day_date, hour, tenminute, minute)
            DO UPDATE SET count = ip_monitoring.count + 1
            "#,
        )
        .bind(timestamp.date_naive())
        .bind(timestamp.hour() as i16)
        .bind(minute / 10)
        .bind(minute)
        .bind(ip_to_bytes(ip))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Today's heaviest clients, grouped by address, total count descending.
    pub async fn list_of_top(&self, limit: i64) -> Result<Vec<TopHit>, Error> {
        let rows = sqlx::query_as::<_, TotalRow>(
            r#"
            SELECT ip, SUM(count)::BIGINT AS total
            FROM ip_monitoring
            WHERE day_date = $1
            GROUP BY ip
            ORDER BY total DESC
            LIMIT $2
            "#,
        )
        .bind(Utc::now().date_naive())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(TopHit {
                    ip: ip_from_bytes(&row.ip)?,
                    count: row.total,
                })
            })
            .collect()
    }

    /// Addresses whose summed count over the profile's grouping exceeds the
    /// profile's limit, restricted to today. Grouping columns are resolved
    /// through the fixed allowlist before any SQL is built; an unknown token
    /// fails without touching the database.
    pub async fn list_by_ban_profile(&self, profile: &AutobanProfile) -> Result<Vec<IpAddr>, Error> {
        let mut group_by = String::from("ip");
        for token in &profile.group {
            group_by.push_str(", ");
            group_by.push_str(group_column(token)?);
        }

        let sql = format!(
            r#"
            SELECT ip, SUM(count)::BIGINT AS total
            FROM ip_monitoring
            WHERE day_date = $1
            GROUP BY {group_by}
            HAVING SUM(count) > $2
            LIMIT 1000
            "#,
        );

        let rows = sqlx::query_as::<_, TotalRow>(&sql)
            .bind(Utc::now().date_naive())
            .bind(profile.limit)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| Ok(ip_from_bytes(&row.ip)?))
            .collect()
    }

    /// Any bucket recorded for this address, on any day.
    pub async fn exists_ip(&self, ip: IpAddr) -> Result<bool, Error> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM ip_monitoring WHERE ip = $1)")
                .bind(ip_to_bytes(ip))
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    /// Drop every bucket for this address.
    pub async fn clear_ip(&self, ip: IpAddr) -> Result<(), Error> {
        sqlx::query("DELETE FROM ip_monitoring WHERE ip = $1")
            .bind(ip_to_bytes(ip))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drop every bucket. Testing aid.
    pub async fn clear(&self) -> Result<(), Error> {
        sqlx::query("DELETE FROM ip_monitoring")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Sweep buckets older than today. Returns the number of rows removed.
    pub async fn gc(&self) -> Result<u64, Error> {
        let result = sqlx::query("DELETE FROM ip_monitoring WHERE day_date < $1")
            .bind(Utc::now().date_naive())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
