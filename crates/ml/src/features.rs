//! Engineered feature extraction over canonical log rows.
//!
//! The trained feature vector is a fixed schema: the extractor always emits
//! exactly [`FEATURE_NAMES`], and the cache is versioned by [`schema_hash`] so
//! rows produced by an older schema are recomputed instead of reaching the
//! scaler.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, Datelike, Utc};
use regex::Regex;
use serde::Serialize;

use crate::artifacts::sha256_hex;

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

/// Canonical single-row input to the feature pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct MlInput {
    #[serde(rename = "Month")]
    pub month: String,
    #[serde(rename = "Date")]
    pub date: u32,
    #[serde(rename = "Time")]
    pub time: String,
    #[serde(rename = "Component")]
    pub component: String,
    #[serde(rename = "Content")]
    pub content: String,
    #[serde(rename = "EventId")]
    pub event_id: String,
}

impl MlInput {
    pub fn new(
        timestamp: Option<DateTime<Utc>>,
        log_source: Option<&str>,
        event_type: Option<&str>,
        raw_log: Option<&str>,
    ) -> Self {
        let dt = timestamp.unwrap_or_else(Utc::now);
        MlInput {
            month: dt.format("%b").to_string(),
            date: dt.day(),
            time: dt.format("%H:%M:%S").to_string(),
            component: log_source.unwrap_or("unknown").to_string(),
            content: raw_log.unwrap_or("").to_string(),
            event_id: event_type.unwrap_or("UNKNOWN").to_string(),
        }
    }
}

pub const FEATURE_NAMES: [&str; 18] = [
    "content_length",
    "content_digit_ratio",
    "content_special_chars",
    "content_word_count",
    "content_ip_count",
    "hour",
    "minute",
    "day",
    "month_idx",
    "is_night",
    "event_hash_bucket",
    "component_hash_bucket",
    "kw_failed",
    "kw_denied",
    "kw_error",
    "kw_root",
    "kw_invalid",
    "kw_accepted",
];

/// Hash of the feature schema. Cached feature rows carry this value and are
/// invalidated when it changes.
pub fn schema_hash() -> String {
    let joined = format!("v{}:{}", FEATURE_SCHEMA_VERSION, FEATURE_NAMES.join(","));
    sha256_hex(&joined)
}

static IP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap());

/// Stable hash bucket: the first 8 bytes of the SHA-256 digest reduced modulo
/// `modulus`. Deterministic across processes, unlike the default hasher.
fn stable_hash_bucket(value: &str, modulus: u64) -> f64 {
    let digest = sha256_hex(value);
    let head = u64::from_str_radix(&digest[..16], 16).unwrap_or(0);
    (head % modulus) as f64
}

fn month_index(abbr: &str) -> f64 {
    match abbr {
        "Jan" => 1.0,
        "Feb" => 2.0,
        "Mar" => 3.0,
        "Apr" => 4.0,
        "May" => 5.0,
        "Jun" => 6.0,
        "Jul" => 7.0,
        "Aug" => 8.0,
        "Sep" => 9.0,
        "Oct" => 10.0,
        "Nov" => 11.0,
        "Dec" => 12.0,
        _ => 0.0,
    }
}

fn keyword_flag(haystack: &str, keyword: &str) -> f64 {
    if haystack.contains(keyword) { 1.0 } else { 0.0 }
}

/// Extract the full engineered feature row for one input.
pub fn extract_features(input: &MlInput) -> BTreeMap<String, f64> {
    let content = input.content.as_str();
    let lower = content.to_lowercase();
    let len = content.chars().count();
    let digits = content.chars().filter(|c| c.is_ascii_digit()).count();
    let specials = content
        .chars()
        .filter(|c| !c.is_alphanumeric() && !c.is_whitespace())
        .count();
    let words = content.split_whitespace().count();
    let ip_count = IP_RE.find_iter(content).count();

    let (hour, minute) = parse_time(&input.time);

    let mut row = BTreeMap::new();
    row.insert("content_length".to_string(), len as f64);
    row.insert(
        "content_digit_ratio".to_string(),
        if len > 0 { digits as f64 / len as f64 } else { 0.0 },
    );
    row.insert("content_special_chars".to_string(), specials as f64);
    row.insert("content_word_count".to_string(), words as f64);
    row.insert("content_ip_count".to_string(), ip_count as f64);
    row.insert("hour".to_string(), hour);
    row.insert("minute".to_string(), minute);
    row.insert("day".to_string(), input.date as f64);
    row.insert("month_idx".to_string(), month_index(&input.month));
    row.insert(
        "is_night".to_string(),
        if !(6.0..22.0).contains(&hour) { 1.0 } else { 0.0 },
    );
    row.insert(
        "event_hash_bucket".to_string(),
        stable_hash_bucket(&input.event_id, 64),
    );
    row.insert(
        "component_hash_bucket".to_string(),
        stable_hash_bucket(&input.component, 32),
    );
    row.insert("kw_failed".to_string(), keyword_flag(&lower, "fail"));
    row.insert("kw_denied".to_string(), keyword_flag(&lower, "denied"));
    row.insert("kw_error".to_string(), keyword_flag(&lower, "error"));
    row.insert("kw_root".to_string(), keyword_flag(&lower, "root"));
    row.insert("kw_invalid".to_string(), keyword_flag(&lower, "invalid"));
    row.insert("kw_accepted".to_string(), keyword_flag(&lower, "accepted"));
    row
}

fn parse_time(time: &str) -> (f64, f64) {
    let mut parts = time.split(':');
    let hour = parts
        .next()
        .and_then(|p| p.parse::<f64>().ok())
        .unwrap_or(0.0);
    let minute = parts
        .next()
        .and_then(|p| p.parse::<f64>().ok())
        .unwrap_or(0.0);
    (hour, minute)
}
