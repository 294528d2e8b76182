//! Time-limited ban entries.

use super::{ip_from_bytes, ip_to_bytes};
use crate::error::Error;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::net::IpAddr;
use tracing::warn;

/// One ban: an address, the instant the ban lapses, who issued it and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanEntry {
    pub ip: IpAddr,
    #[serde(rename = "up_to")]
    pub until: DateTime<Utc>,
    pub by_user_id: i32,
    pub reason: String,
}

/// Store of active and lapsed bans. An entry is visible only while
/// `until >= now`; lapsed rows act as absent until the sweeper removes them.
///
/// The store never consults the whitelist — exempting whitelisted addresses
/// is the caller's responsibility.
#[derive(Clone)]
pub struct BanStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct BanRow {
    ip: Vec<u8>,
    until: DateTime<Utc>,
    by_user_id: i32,
    reason: String,
}

impl BanStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Ban an address for `duration` from now. A re-ban replaces the
    /// deadline, reason and issuer; the last caller wins.
    pub async fn add(
        &self,
        ip: IpAddr,
        duration: Duration,
        by_user_id: i32,
        reason: &str,
    ) -> Result<(), Error> {
        let reason = reason.trim();
        let until = Utc::now() + duration;

        let inserted: bool = sqlx::query_scalar(
            r#"
            INSERT INTO ip_ban (ip, until, by_user_id, reason)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (ip) DO UPDATE
            SET until = EXCLUDED.until,
                by_user_id = EXCLUDED.by_user_id,
                reason = EXCLUDED.reason
            RETURNING (xmax = 0)
            "#,
        )
        .bind(ip_to_bytes(ip))
        .bind(until)
        .bind(by_user_id)
        .bind(reason)
        .fetch_one(&self.pool)
        .await?;

        if inserted {
            warn!(ip = %ip, reason, "banned");
        }

        Ok(())
    }

    /// Lift the ban. No error when the address was not banned.
    pub async fn remove(&self, ip: IpAddr) -> Result<(), Error> {
        sqlx::query("DELETE FROM ip_ban WHERE ip = $1")
            .bind(ip_to_bytes(ip))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// True iff an unexpired entry exists for this address.
    pub async fn exists(&self, ip: IpAddr) -> Result<bool, Error> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM ip_ban WHERE ip = $1 AND until >= $2)",
        )
        .bind(ip_to_bytes(ip))
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// Fetch the active entry for this address, if any.
    pub async fn get(&self, ip: IpAddr) -> Result<Option<BanEntry>, Error> {
        let row = sqlx::query_as::<_, BanRow>(
            r#"
            SELECT ip, until, by_user_id, reason
            FROM ip_ban
            WHERE ip = $1 AND until >= $2
            "#,
        )
        .bind(ip_to_bytes(ip))
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(BanEntry {
                ip: ip_from_bytes(&row.ip)?,
                until: row.until,
                by_user_id: row.by_user_id,
                reason: row.reason,
            })),
            None => Ok(None),
        }
    }

    /// Sweep lapsed entries. Returns the number of rows removed.
    pub async fn gc(&self) -> Result<u64, Error> {
        let result = sqlx::query("DELETE FROM ip_ban WHERE until < $1")
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Purge all entries. Testing aid.
    pub async fn clear(&self) -> Result<(), Error> {
        sqlx::query("DELETE FROM ip_ban").execute(&self.pool).await?;
        Ok(())
    }
}
