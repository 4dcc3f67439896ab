//! IP reputation enrichment.
//!
//! Lookups go through a store-backed cache with a 24 hour TTL. Private,
//! loopback, link-local, and otherwise non-global addresses short-circuit to
//! an `UNKNOWN` placeholder without touching the network. Enrichment may only
//! raise detection severity, never lower it.

use std::net::IpAddr;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use firewall_common::database::DbPool;
use firewall_common::error::StoreError;
use firewall_common::{Severity, store_time};

const CACHE_TTL_HOURS: i64 = 24;
const REQUEST_TIMEOUT_SECONDS: u64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpReputation {
    pub detected: bool,
    pub reputation_score: i64,
    pub threat_level: String,
    pub malicious_count: i64,
    pub suspicious_count: i64,
    pub total_engines: i64,
    pub country: Option<String>,
    pub as_owner: Option<String>,
    pub last_analysis_date: Option<String>,
}

impl IpReputation {
    /// Placeholder for addresses the reputation service cannot know about.
    pub fn unknown() -> Self {
        IpReputation {
            detected: false,
            reputation_score: 0,
            threat_level: "UNKNOWN".to_string(),
            malicious_count: 0,
            suspicious_count: 0,
            total_engines: 0,
            country: None,
            as_owner: None,
            last_analysis_date: None,
        }
    }
}

/// Reputation client with cache-aside semantics over the store.
pub struct ReputationService {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

impl ReputationService {
    pub fn new(api_key: Option<String>) -> Self {
        ReputationService {
            client: reqwest::Client::builder()
                .timeout(StdDuration::from_secs(REQUEST_TIMEOUT_SECONDS))
                .build()
                .unwrap_or_default(),
            api_key,
            base_url: "https://www.virustotal.com/api/v3".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Fetch reputation for an IP: non-global short-circuit, then cache, then
    /// the remote service. Returns `None` when nothing is known (no key, no
    /// cache, or remote failure).
    pub async fn get(&self, pool: &DbPool, ip: &str) -> Option<IpReputation> {
        if is_non_global(ip) {
            return Some(IpReputation::unknown());
        }

        match cache_get(pool, ip).await {
            Ok(Some(cached)) => return Some(cached),
            Ok(None) => {}
            Err(e) => tracing::warn!(ip, error = %e, "reputation cache read failed"),
        }

        let api_key = self.api_key.as_ref()?;
        let url = format!("{}/ip_addresses/{ip}", self.base_url);
        let response = match self
            .client
            .get(&url)
            .header("x-apikey", api_key)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(ip, error = %e, "reputation lookup failed");
                return None;
            }
        };

        let reputation = match response.status().as_u16() {
            200 => {
                let body: serde_json::Value = response.json().await.ok()?;
                parse_reputation_response(&body)
            }
            // Unknown to the service: cache the clean placeholder.
            404 => IpReputation::unknown(),
            status => {
                tracing::warn!(ip, status, "reputation service returned an error");
                return None;
            }
        };

        if let Err(e) = cache_put(pool, ip, &reputation).await {
            tracing::warn!(ip, error = %e, "reputation cache write failed");
        }
        Some(reputation)
    }
}

/// True for addresses the reputation service has no data for.
pub fn is_non_global(ip: &str) -> bool {
    let Ok(addr) = ip.parse::<IpAddr>() else {
        // Not a well-formed address; treat it as unknowable rather than
        // sending it to the remote service.
        return true;
    };
    match addr {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_multicast() || v6.is_unspecified(),
    }
}

/// Map analysis stats from the remote document into the normalized record.
fn parse_reputation_response(body: &serde_json::Value) -> IpReputation {
    let attributes = &body["data"]["attributes"];
    let stats = &attributes["last_analysis_stats"];
    let malicious = stats["malicious"].as_i64().unwrap_or(0);
    let suspicious = stats["suspicious"].as_i64().unwrap_or(0);
    let harmless = stats["harmless"].as_i64().unwrap_or(0);
    let undetected = stats["undetected"].as_i64().unwrap_or(0);
    let total = malicious + suspicious + harmless + undetected;

    IpReputation {
        detected: malicious > 0 || suspicious > 0,
        reputation_score: malicious * 2 + suspicious,
        threat_level: threat_level(malicious, suspicious).to_string(),
        malicious_count: malicious,
        suspicious_count: suspicious,
        total_engines: total,
        country: attributes["country"].as_str().filter(|s| !s.is_empty()).map(str::to_string),
        as_owner: attributes["as_owner"].as_str().filter(|s| !s.is_empty()).map(str::to_string),
        last_analysis_date: attributes["last_analysis_date"].as_i64().map(|v| v.to_string()),
    }
}

fn threat_level(malicious: i64, suspicious: i64) -> &'static str {
    if malicious >= 10 {
        "CRITICAL"
    } else if malicious >= 3 {
        "HIGH"
    } else if malicious >= 1 || suspicious >= 3 {
        "MEDIUM"
    } else if suspicious >= 1 {
        "LOW"
    } else {
        "CLEAN"
    }
}

/// Raise a rule-computed severity according to reputation. `CRITICAL`
/// reputation forces `CRITICAL`; `HIGH`/`MEDIUM` set floors; anything lower
/// leaves the severity untouched.
pub fn enhance_severity(severity: Severity, reputation: &IpReputation) -> Severity {
    match reputation.threat_level.as_str() {
        "CRITICAL" => Severity::Critical,
        "HIGH" => severity.max(Severity::High),
        "MEDIUM" => severity.max(Severity::Medium),
        _ => severity,
    }
}

async fn cache_get(pool: &DbPool, ip: &str) -> Result<Option<IpReputation>, StoreError> {
    let row: Option<(String, String)> =
        sqlx::query_as("SELECT payload, cached_at FROM ip_reputation_cache WHERE ip = ?")
            .bind(ip)
            .fetch_optional(pool)
            .await?;
    let Some((payload, cached_at)) = row else {
        return Ok(None);
    };

    let cached_at: DateTime<Utc> = store_time::decode(&cached_at)?;
    if Utc::now() - cached_at > Duration::hours(CACHE_TTL_HOURS) {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(&payload)?))
}

async fn cache_put(pool: &DbPool, ip: &str, reputation: &IpReputation) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO ip_reputation_cache (ip, payload, cached_at) VALUES (?, ?, ?) \
         ON CONFLICT (ip) DO UPDATE SET payload = excluded.payload, cached_at = excluded.cached_at",
    )
    .bind(ip)
    .bind(serde_json::to_string(reputation)?)
    .bind(store_time::encode(&Utc::now()))
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use firewall_common::database::init_memory_db;

    #[test]
    fn test_non_global_addresses() {
        assert!(is_non_global("192.168.1.5"));
        assert!(is_non_global("10.0.0.1"));
        assert!(is_non_global("127.0.0.1"));
        assert!(is_non_global("169.254.0.1"));
        assert!(is_non_global("224.0.0.1"));
        assert!(is_non_global("not-an-ip"));
        assert!(!is_non_global("8.8.8.8"));
        assert!(!is_non_global("203.0.114.7"));
    }

    #[test]
    fn test_threat_level_mapping() {
        assert_eq!(threat_level(12, 0), "CRITICAL");
        assert_eq!(threat_level(3, 0), "HIGH");
        assert_eq!(threat_level(1, 0), "MEDIUM");
        assert_eq!(threat_level(0, 4), "MEDIUM");
        assert_eq!(threat_level(0, 1), "LOW");
        assert_eq!(threat_level(0, 0), "CLEAN");
    }

    #[test]
    fn test_enhance_severity_never_downgrades() {
        let mut rep = IpReputation::unknown();
        rep.threat_level = "MEDIUM".to_string();
        assert_eq!(enhance_severity(Severity::High, &rep), Severity::High);
        assert_eq!(enhance_severity(Severity::Low, &rep), Severity::Medium);

        rep.threat_level = "CRITICAL".to_string();
        assert_eq!(enhance_severity(Severity::Low, &rep), Severity::Critical);

        rep.threat_level = "CLEAN".to_string();
        assert_eq!(enhance_severity(Severity::High, &rep), Severity::High);
    }

    #[test]
    fn test_parse_reputation_response() {
        let body = serde_json::json!({
            "data": {"attributes": {
                "last_analysis_stats": {"malicious": 5, "suspicious": 2, "harmless": 60, "undetected": 10},
                "country": "NL",
                "as_owner": "ExampleNet",
                "last_analysis_date": 1735689600
            }}
        });
        let rep = parse_reputation_response(&body);
        assert!(rep.detected);
        assert_eq!(rep.reputation_score, 12);
        assert_eq!(rep.threat_level, "HIGH");
        assert_eq!(rep.total_engines, 77);
        assert_eq!(rep.country.as_deref(), Some("NL"));
    }

    #[tokio::test]
    async fn test_private_ip_short_circuits_without_key() {
        let pool = init_memory_db().await.unwrap();
        let service = ReputationService::new(None);
        let rep = service.get(&pool, "192.168.0.10").await.unwrap();
        assert_eq!(rep.threat_level, "UNKNOWN");
    }

    #[tokio::test]
    async fn test_cache_round_trip_and_ttl() {
        let pool = init_memory_db().await.unwrap();
        let mut rep = IpReputation::unknown();
        rep.threat_level = "HIGH".to_string();
        rep.malicious_count = 4;
        cache_put(&pool, "203.0.113.50", &rep).await.unwrap();

        let cached = cache_get(&pool, "203.0.113.50").await.unwrap().unwrap();
        assert_eq!(cached.threat_level, "HIGH");
        assert_eq!(cached.malicious_count, 4);

        // Age the entry past the TTL: the cache must treat it as a miss.
        sqlx::query("UPDATE ip_reputation_cache SET cached_at = ? WHERE ip = ?")
            .bind(store_time::encode(&(Utc::now() - Duration::hours(25))))
            .bind("203.0.113.50")
            .execute(&pool)
            .await
            .unwrap();
        assert!(cache_get(&pool, "203.0.113.50").await.unwrap().is_none());

        // A cache hit is served without an API key.
        cache_put(&pool, "203.0.113.51", &rep).await.unwrap();
        let service = ReputationService::new(None);
        let got = service.get(&pool, "203.0.113.51").await.unwrap();
        assert_eq!(got.threat_level, "HIGH");
    }
}
