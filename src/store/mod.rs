//! Persistent stores backed by the shared Postgres pool.
//!
//! The three tables are independent and joined only by IP equality. IPs are
//! stored as 16-byte values: IPv4 addresses are mapped into IPv6 so a single
//! fixed-width column covers both families.

pub mod bans;
pub mod hits;
pub mod hotlink;
pub mod whitelist;

pub use bans::{BanEntry, BanStore};
pub use hits::{HitStore, TopHit};
pub use hotlink::{HotlinkStore, RefererLink, RefererTop};
pub use whitelist::{WhitelistEntry, WhitelistStore};

use std::net::{IpAddr, Ipv6Addr};

/// Serialize an address to its 16-byte storage form.
pub(crate) fn ip_to_bytes(ip: IpAddr) -> Vec<u8> {
    let octets = match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    };
    octets.to_vec()
}

/// Decode a stored 16-byte value back to an address. Mapped IPv4 addresses
/// come back as `IpAddr::V4` so they round-trip to dotted-quad text.
pub(crate) fn ip_from_bytes(bytes: &[u8]) -> sqlx::Result<IpAddr> {
    let octets: [u8; 16] = bytes
        .try_into()
        .map_err(|_| sqlx::Error::Decode("stored ip is not 16 bytes".into()))?;
    let v6 = Ipv6Addr::from(octets);
    Ok(match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(v6),
    })
}
