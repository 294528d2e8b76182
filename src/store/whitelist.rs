//! Permanent whitelist entries.

use super::{ip_from_bytes, ip_to_bytes};
use crate::error::Error;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::net::IpAddr;

/// One exemption: an address and a human-readable description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistEntry {
    pub ip: IpAddr,
    pub description: String,
}

/// Store of permanently exempted addresses. Entries never expire.
#[derive(Clone)]
pub struct WhitelistStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct WhitelistRow {
    ip: Vec<u8>,
    description: String,
}

impl WhitelistStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Exempt an address. The description is replaced on conflict.
    pub async fn add(&self, ip: IpAddr, description: &str) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO ip_whitelist (ip, description)
            VALUES ($1, $2)
            ON CONFLICT (ip) DO UPDATE SET description = EXCLUDED.description
            "#,
        )
        .bind(ip_to_bytes(ip))
        .bind(description)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, ip: IpAddr) -> Result<Option<WhitelistEntry>, Error> {
        let row = sqlx::query_as::<_, WhitelistRow>(
            "SELECT ip, description FROM ip_whitelist WHERE ip = $1",
        )
        .bind(ip_to_bytes(ip))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(WhitelistEntry {
                ip: ip_from_bytes(&row.ip)?,
                description: row.description,
            })),
            None => Ok(None),
        }
    }

    /// Every exemption, unordered.
    pub async fn list(&self) -> Result<Vec<WhitelistEntry>, Error> {
        let rows =
            sqlx::query_as::<_, WhitelistRow>("SELECT ip, description FROM ip_whitelist")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|row| {
                Ok(WhitelistEntry {
                    ip: ip_from_bytes(&row.ip)?,
                    description: row.description,
                })
            })
            .collect()
    }

    pub async fn exists(&self, ip: IpAddr) -> Result<bool, Error> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM ip_whitelist WHERE ip = $1)")
                .bind(ip_to_bytes(ip))
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    /// Drop the exemption. No error when the address was not listed.
    pub async fn remove(&self, ip: IpAddr) -> Result<(), Error> {
        sqlx::query("DELETE FROM ip_whitelist WHERE ip = $1")
            .bind(ip_to_bytes(ip))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
