//! Rate policy: autoban profiles and the two periodic control passes.

use crate::classifier::CrawlerClassifier;
use crate::error::Error;
use crate::store::{BanStore, HitStore, WhitelistStore};
use chrono::Duration;
use std::net::IpAddr;
use tracing::{debug, info};

/// Reserved issuer identity for automated ban decisions.
pub const AUTOBAN_BY_USER_ID: i32 = 9;

/// One rate rule: a count limit within a grouping granularity, and the ban
/// duration an exceedance earns.
#[derive(Debug, Clone)]
pub struct AutobanProfile {
    pub limit: i64,
    pub reason: String,
    pub group: Vec<String>,
    pub time: Duration,
}

/// The canonical profile set, coarsest first. Order matters: the ban upsert
/// is last-writer-wins, so a client violating several profiles ends up with
/// the finest matching profile's reason and (usually shorter) duration.
pub fn autoban_profiles() -> Vec<AutobanProfile> {
    vec![
        AutobanProfile {
            limit: 10_000,
            reason: "daily limit".to_string(),
            group: vec![],
            time: Duration::hours(240),
        },
        AutobanProfile {
            limit: 3_600,
            reason: "hourly limit".to_string(),
            group: vec!["hour".to_string()],
            time: Duration::hours(120),
        },
        AutobanProfile {
            limit: 1_200,
            reason: "ten min limit".to_string(),
            group: vec!["hour".to_string(), "tenminute".to_string()],
            time: Duration::hours(24),
        },
        AutobanProfile {
            limit: 700,
            reason: "min limit".to_string(),
            group: vec![
                "hour".to_string(),
                "tenminute".to_string(),
                "minute".to_string(),
            ],
            time: Duration::hours(12),
        },
    ]
}

/// Resolve a grouping token against the fixed column allowlist. Grouping
/// columns are interpolated into SQL, so nothing outside this list may pass.
pub(crate) fn group_column(token: &str) -> Result<&'static str, Error> {
    match token {
        "hour" => Ok("hour"),
        "tenminute" => Ok("tenminute"),
        "minute" => Ok("minute"),
        other => Err(Error::Policy(other.to_string())),
    }
}

/// Executes the periodic policy passes against the stores.
#[derive(Clone)]
pub struct Enforcer {
    hits: HitStore,
    bans: BanStore,
    whitelist: WhitelistStore,
    classifier: CrawlerClassifier,
}

impl Enforcer {
    pub fn new(
        hits: HitStore,
        bans: BanStore,
        whitelist: WhitelistStore,
        classifier: CrawlerClassifier,
    ) -> Self {
        Self {
            hits,
            bans,
            whitelist,
            classifier,
        }
    }

    /// One autowhitelist pass: scan today's top offenders and promote every
    /// PTR-confirmed crawler. A step error aborts the pass; the next tick
    /// starts over.
    pub async fn auto_whitelist(&self) -> Result<(), Error> {
        let items = self.hits.list_of_top(1000).await?;

        for item in items {
            debug!(ip = %item.ip, count = item.count, "checking candidate");
            self.auto_whitelist_ip(item.ip).await?;
        }

        Ok(())
    }

    /// Promote a single address if the classifier confirms it. Clears the
    /// address from the counters and lifts any ban, so it drops out of the
    /// same day's top list and cannot be re-banned from stale buckets.
    pub async fn auto_whitelist_ip(&self, ip: IpAddr) -> Result<(), Error> {
        let Some(label) = self.classifier.match_auto(ip).await else {
            return Ok(());
        };

        if self.whitelist.exists(ip).await? {
            debug!(ip = %ip, "already whitelisted");
        } else {
            self.whitelist.add(ip, label).await?;
        }

        self.bans.remove(ip).await?;
        self.hits.clear_ip(ip).await?;

        info!(ip = %ip, label, "whitelisted");

        Ok(())
    }

    /// One autoban pass over the canonical profiles, coarsest first.
    pub async fn auto_ban(&self) -> Result<(), Error> {
        for profile in autoban_profiles() {
            self.auto_ban_by_profile(&profile).await?;
        }
        Ok(())
    }

    /// Evaluate one profile and ban every exceeding, non-whitelisted address.
    pub async fn auto_ban_by_profile(&self, profile: &AutobanProfile) -> Result<(), Error> {
        let ips = self.hits.list_by_ban_profile(profile).await?;

        for ip in ips {
            if self.whitelist.exists(ip).await? {
                continue;
            }

            info!(ip = %ip, reason = %profile.reason, "rate limit exceeded");

            self.bans
                .add(ip, profile.time, AUTOBAN_BY_USER_ID, &profile.reason)
                .await?;
        }

        Ok(())
    }
}
