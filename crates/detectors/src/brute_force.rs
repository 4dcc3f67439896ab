//! Brute-force authentication detector.
//!
//! Scans failed SSH logins, groups them by source IP, and walks a greedy
//! non-overlapping sliding window over each group. An IP produces a detection
//! iff at least one window reaches the attempt threshold.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use firewall_common::database::DbPool;
use firewall_common::database::queries::{ScanFilter, scan_range};
use firewall_common::error::StoreError;
use firewall_common::{Event, SampleEvent, Severity, event_type};

#[derive(Debug, Clone)]
pub struct BruteForceParams {
    pub time_window_minutes: i64,
    pub threshold: usize,
    pub source_ip: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl Default for BruteForceParams {
    fn default() -> Self {
        BruteForceParams {
            time_window_minutes: 15,
            threshold: 5,
            source_ip: None,
            start: None,
            end: None,
        }
    }
}

/// One qualifying attack window: a contiguous slice of failed attempts whose
/// count reached the threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BruteForceWindow {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub attempt_count: usize,
    pub usernames: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BruteForceDetection {
    pub source_ip: String,
    pub total_attempts: usize,
    pub unique_usernames_attempted: usize,
    pub usernames_attempted: Vec<String>,
    pub first_attempt: DateTime<Utc>,
    pub last_attempt: DateTime<Utc>,
    pub attack_windows: Vec<BruteForceWindow>,
    pub severity: Severity,
    pub sample: SampleEvent,
}

/// Detect brute-force attacks in the store. Defaults to the last 24 hours
/// anchored at now.
pub async fn detect_brute_force(
    pool: &DbPool,
    params: &BruteForceParams,
) -> Result<Vec<BruteForceDetection>, StoreError> {
    let end = params.end.unwrap_or_else(Utc::now);
    let start = params.start.unwrap_or(end - Duration::hours(24));

    let mut filter = ScanFilter::range(start, end);
    filter.event_type = Some(event_type::SSH_FAILED_LOGIN.to_string());
    filter.source_ip = params.source_ip.clone();

    let events = scan_range(pool, &filter).await?;
    Ok(detect_in_events(&events, params))
}

/// Pure sliding-window core over events already ordered by timestamp.
pub fn detect_in_events(events: &[Event], params: &BruteForceParams) -> Vec<BruteForceDetection> {
    let window = Duration::minutes(params.time_window_minutes);

    let mut by_ip: BTreeMap<&str, Vec<&Event>> = BTreeMap::new();
    for event in events {
        by_ip.entry(event.source_ip.as_str()).or_default().push(event);
    }

    let mut detections = Vec::new();
    for (ip, mut attempts) in by_ip {
        attempts.sort_by_key(|e| e.timestamp);
        let windows = find_attack_windows(&attempts, window, params.threshold);
        if windows.is_empty() {
            continue;
        }

        let usernames: BTreeSet<String> = attempts
            .iter()
            .filter_map(|e| e.username.clone())
            .collect();
        let last = attempts[attempts.len() - 1];

        detections.push(BruteForceDetection {
            source_ip: ip.to_string(),
            total_attempts: attempts.len(),
            unique_usernames_attempted: usernames.len(),
            usernames_attempted: usernames.into_iter().collect(),
            first_attempt: attempts[0].timestamp,
            last_attempt: last.timestamp,
            severity: calculate_severity(attempts.len(), windows.len()),
            attack_windows: windows,
            sample: last.sample(),
        });
    }

    // Most attempts first.
    detections.sort_by(|a, b| b.total_attempts.cmp(&a.total_attempts));
    detections
}

/// Greedy non-overlapping window walk. Starting at index `i`, the window
/// extends while timestamps stay within `attempts[i].timestamp + window`; a
/// window that reaches the threshold is emitted and the walk jumps past its
/// last index, otherwise the start advances by one.
fn find_attack_windows(
    attempts: &[&Event],
    window: Duration,
    threshold: usize,
) -> Vec<BruteForceWindow> {
    let mut windows = Vec::new();
    let mut i = 0;

    while i < attempts.len() {
        let window_start = attempts[i].timestamp;
        let window_limit = window_start + window;

        let mut j = i;
        while j < attempts.len() && attempts[j].timestamp <= window_limit {
            j += 1;
        }

        let count = j - i;
        if count >= threshold {
            let usernames: BTreeSet<String> = attempts[i..j]
                .iter()
                .filter_map(|e| e.username.clone())
                .collect();
            windows.push(BruteForceWindow {
                window_start,
                window_end: attempts[j - 1].timestamp,
                attempt_count: count,
                usernames: usernames.into_iter().collect(),
            });
            i = j;
        } else {
            i += 1;
        }
    }

    windows
}

fn calculate_severity(total_attempts: usize, window_count: usize) -> Severity {
    if total_attempts >= 50 || window_count >= 5 {
        Severity::Critical
    } else if total_attempts >= 20 || window_count >= 3 {
        Severity::High
    } else if total_attempts >= 10 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// Per-IP attempt timeline for drill-down views.
#[derive(Debug, Serialize)]
pub struct BruteForceTimeline {
    pub source_ip: String,
    pub total_attempts: usize,
    pub timeline: Vec<TimelineEntry>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct TimelineEntry {
    pub timestamp: DateTime<Utc>,
    pub username: Option<String>,
}

pub async fn brute_force_timeline(
    pool: &DbPool,
    ip: &str,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Result<BruteForceTimeline, StoreError> {
    let end = end.unwrap_or_else(Utc::now);
    let start = start.unwrap_or(end - Duration::hours(24));

    let mut filter = ScanFilter::range(start, end);
    filter.event_type = Some(event_type::SSH_FAILED_LOGIN.to_string());
    filter.source_ip = Some(ip.to_string());
    let events = scan_range(pool, &filter).await?;

    Ok(BruteForceTimeline {
        source_ip: ip.to_string(),
        total_attempts: events.len(),
        timeline: events
            .into_iter()
            .map(|e| TimelineEntry {
                timestamp: e.timestamp,
                username: e.username,
            })
            .collect(),
        start,
        end,
    })
}
