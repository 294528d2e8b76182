//! Referer (hotlink) monitoring: per-URL counters grouped by referring host,
//! with host-level whitelist and blacklist.

use crate::error::Error;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use url::Url;

/// Stored URLs are capped at this many bytes.
pub const MAX_URL_LENGTH: usize = 1000;

/// Stored accept headers are capped at this many bytes.
pub const MAX_ACCEPT_LENGTH: usize = 1000;

/// One referring URL and its count within the reporting window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefererLink {
    pub url: String,
    pub accept: String,
    pub count: i32,
}

/// One referring host in the monitoring view: total count, list membership
/// and its heaviest URLs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefererTop {
    pub host: String,
    pub count: i64,
    pub whitelisted: bool,
    pub blacklisted: bool,
    pub links: Vec<RefererLink>,
}

/// Store of referer counters and the host whitelist/blacklist. The two host
/// lists are mutually exclusive: adding to one removes from the other.
#[derive(Clone)]
pub struct HotlinkStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct HostTotalRow {
    host: String,
    total: i64,
}

#[derive(sqlx::FromRow)]
struct LinkRow {
    url: String,
    count: i32,
    accept: String,
}

impl HotlinkStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record one referred request. URLs without a host are ignored, as are
    /// hosts on the whitelist. A repeated URL increments its counter and
    /// refreshes host, last-seen instant and accept header.
    pub async fn add(
        &self,
        url: &str,
        accept: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), Error> {
        let Some(host) = referer_host(url)? else {
            return Ok(());
        };

        if self.is_host_whitelisted(&host).await? {
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT INTO hotlink_referer (host, url, count, last_date, accept)
            VALUES ($1, $2, 1, $3, $4)
            ON CONFLICT (url) DO UPDATE
            SET count = hotlink_referer.count + 1,
                host = EXCLUDED.host,
                last_date = EXCLUDED.last_date,
                accept = EXCLUDED.accept
            "#,
        )
        .bind(&host)
        .bind(truncate(url, MAX_URL_LENGTH))
        .bind(timestamp)
        .bind(truncate(accept, MAX_ACCEPT_LENGTH))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// The heaviest referring hosts of the last day, each with its top URLs
    /// and list membership.
    pub async fn top_data(&self) -> Result<Vec<RefererTop>, Error> {
        let since = Utc::now() - Duration::days(1);

        let hosts = sqlx::query_as::<_, HostTotalRow>(
            r#"
            SELECT host, SUM(count)::BIGINT AS total
            FROM hotlink_referer
            WHERE last_date >= $1
            GROUP BY host
            ORDER BY total DESC
            LIMIT 100
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut result = Vec::with_capacity(hosts.len());
        for row in hosts {
            let links = self.host_links(&row.host, since, 20).await?;
            let whitelisted = self.is_host_whitelisted(&row.host).await?;
            let blacklisted = self.is_host_blacklisted(&row.host).await?;

            result.push(RefererTop {
                host: row.host,
                count: row.total,
                whitelisted,
                blacklisted,
                links,
            });
        }

        Ok(result)
    }

    async fn host_links(
        &self,
        host: &str,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<RefererLink>, Error> {
        let rows = sqlx::query_as::<_, LinkRow>(
            r#"
            SELECT url, count, accept
            FROM hotlink_referer
            WHERE last_date >= $1 AND host = $2
            ORDER BY count DESC
            LIMIT $3
            "#,
        )
        .bind(since)
        .bind(host)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| RefererLink {
                url: row.url,
                accept: row.accept,
                count: row.count,
            })
            .collect())
    }

    pub async fn is_host_whitelisted(&self, host: &str) -> Result<bool, Error> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM hotlink_whitelist WHERE host = $1)")
                .bind(host)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    pub async fn is_host_blacklisted(&self, host: &str) -> Result<bool, Error> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM hotlink_blacklist WHERE host = $1)")
                .bind(host)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    /// Exempt a host from referer accounting. Removes it from the blacklist.
    pub async fn add_to_whitelist(&self, host: &str) -> Result<(), Error> {
        self.delete_from_blacklist(host).await?;

        sqlx::query("INSERT INTO hotlink_whitelist (host) VALUES ($1) ON CONFLICT (host) DO NOTHING")
            .bind(host)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mark a host as a known offender. Removes it from the whitelist.
    pub async fn add_to_blacklist(&self, host: &str) -> Result<(), Error> {
        self.delete_from_whitelist(host).await?;

        sqlx::query("INSERT INTO hotlink_blacklist (host) VALUES ($1) ON CONFLICT (host) DO NOTHING")
            .bind(host)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_from_whitelist(&self, host: &str) -> Result<(), Error> {
        sqlx::query("DELETE FROM hotlink_whitelist WHERE host = $1")
            .bind(host)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_from_blacklist(&self, host: &str) -> Result<(), Error> {
        sqlx::query("DELETE FROM hotlink_blacklist WHERE host = $1")
            .bind(host)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drop every counter for one host.
    pub async fn delete_by_host(&self, host: &str) -> Result<(), Error> {
        sqlx::query("DELETE FROM hotlink_referer WHERE host = $1")
            .bind(host)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drop every counter.
    pub async fn clear(&self) -> Result<(), Error> {
        sqlx::query("DELETE FROM hotlink_referer")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Sweep counters last seen more than a day ago. Returns the number of
    /// rows removed.
    pub async fn gc(&self) -> Result<u64, Error> {
        let result = sqlx::query("DELETE FROM hotlink_referer WHERE last_date < $1")
            .bind(Utc::now() - Duration::days(1))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Extract the referring host (with port, when present) from a URL.
/// `None` for URLs that carry no host.
pub(crate) fn referer_host(url: &str) -> Result<Option<String>, Error> {
    let parsed = Url::parse(url).map_err(|e| Error::Validation(e.to_string()))?;

    let Some(host) = parsed.host_str() else {
        return Ok(None);
    };

    Ok(Some(match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }))
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_referer_host() {
        assert_eq!(
            referer_host("http://example.com/path-to-file").unwrap(),
            Some("example.com".to_string())
        );
        assert_eq!(
            referer_host("https://cdn.example.com:8443/img.jpg").unwrap(),
            Some("cdn.example.com:8443".to_string())
        );
        assert_eq!(referer_host("mailto:user@example.com").unwrap(), None);
    }

    #[test]
    fn test_referer_host_rejects_relative_urls() {
        assert!(matches!(
            referer_host("/path-to-file"),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("abcdef", 4), "abcd");
        assert_eq!(truncate("abc", 10), "abc");
        // 'é' is two bytes; cutting inside it moves back to the boundary.
        assert_eq!(truncate("aéb", 2), "a");
    }

    #[test]
    fn test_referer_link_wire_format() {
        let link = RefererLink {
            url: "http://example.com/img.png".to_string(),
            accept: "image/png".to_string(),
            count: 3,
        };
        let json = serde_json::to_value(&link).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "url": "http://example.com/img.png",
                "accept": "image/png",
                "count": 3
            })
        );
    }
}
