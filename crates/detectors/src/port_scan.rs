//! Horizontal port-scan detector.
//!
//! Flags source IPs that touch many distinct destination ports inside a short
//! sliding window.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use firewall_common::database::DbPool;
use firewall_common::database::queries::{ScanFilter, scan_range};
use firewall_common::error::StoreError;
use firewall_common::{Event, SampleEvent, Severity};

#[derive(Debug, Clone)]
pub struct PortScanParams {
    pub time_window_minutes: i64,
    pub unique_ports_threshold: usize,
    pub min_total_attempts: usize,
    pub source_ip: Option<String>,
    pub protocol: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl Default for PortScanParams {
    fn default() -> Self {
        PortScanParams {
            time_window_minutes: 10,
            unique_ports_threshold: 10,
            min_total_attempts: 20,
            source_ip: None,
            protocol: None,
            start: None,
            end: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortScanAttempt {
    pub timestamp: DateTime<Utc>,
    pub destination_port: Option<u16>,
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortScanWindow {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub attempt_count: usize,
    pub unique_ports: usize,
    /// Up to 50 distinct ports touched inside the window, ascending.
    pub ports: Vec<u16>,
    /// Up to 50 sampled attempts.
    pub attempts: Vec<PortScanAttempt>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortScanDetection {
    pub source_ip: String,
    pub total_attempts: usize,
    pub unique_ports_attempted: usize,
    /// Up to 100 distinct ports across the whole detection, ascending.
    pub ports_attempted: Vec<u16>,
    pub first_attempt: DateTime<Utc>,
    pub last_attempt: DateTime<Utc>,
    pub attack_windows: Vec<PortScanWindow>,
    pub severity: Severity,
    pub sample: SampleEvent,
}

/// Detect port scans in the store. Defaults to the last 24 hours anchored at now.
pub async fn detect_port_scan(
    pool: &DbPool,
    params: &PortScanParams,
) -> Result<Vec<PortScanDetection>, StoreError> {
    let end = params.end.unwrap_or_else(Utc::now);
    let start = params.start.unwrap_or(end - Duration::hours(24));

    let mut filter = ScanFilter::range(start, end);
    filter.source_ip = params.source_ip.clone();
    filter.protocol = params.protocol.clone();
    filter.require_destination_port = true;

    let events = scan_range(pool, &filter).await?;
    Ok(detect_in_events(&events, params))
}

/// Pure core over events ordered by timestamp ascending. Only events with a
/// destination port contribute.
pub fn detect_in_events(events: &[Event], params: &PortScanParams) -> Vec<PortScanDetection> {
    let window = Duration::minutes(params.time_window_minutes);

    let mut by_ip: BTreeMap<&str, Vec<&Event>> = BTreeMap::new();
    for event in events.iter().filter(|e| e.destination_port.is_some()) {
        by_ip.entry(event.source_ip.as_str()).or_default().push(event);
    }

    let mut detections = Vec::new();
    for (ip, mut group) in by_ip {
        if group.len() < params.min_total_attempts {
            continue;
        }
        group.sort_by_key(|e| e.timestamp);

        let windows = find_scan_windows(&group, window, params.unique_ports_threshold);
        if windows.is_empty() {
            continue;
        }

        let all_ports: BTreeSet<u16> = group.iter().filter_map(|e| e.destination_port).collect();
        let last = group[group.len() - 1];

        detections.push(PortScanDetection {
            source_ip: ip.to_string(),
            total_attempts: group.len(),
            unique_ports_attempted: all_ports.len(),
            ports_attempted: all_ports.iter().copied().take(100).collect(),
            first_attempt: group[0].timestamp,
            last_attempt: last.timestamp,
            severity: calculate_severity(all_ports.len(), windows.len(), group.len()),
            attack_windows: windows,
            sample: last.sample(),
        });
    }

    detections.sort_by(|a, b| {
        a.severity
            .sort_rank()
            .cmp(&b.severity.sort_rank())
            .then(b.unique_ports_attempted.cmp(&a.unique_ports_attempted))
            .then(b.total_attempts.cmp(&a.total_attempts))
    });
    detections
}

fn find_scan_windows(
    group: &[&Event],
    window: Duration,
    unique_ports_threshold: usize,
) -> Vec<PortScanWindow> {
    let mut windows = Vec::new();
    let mut i = 0;

    while i < group.len() {
        let window_start = group[i].timestamp;
        let window_limit = window_start + window;

        let mut j = i;
        let mut ports: BTreeSet<u16> = BTreeSet::new();
        let mut attempts = Vec::new();
        while j < group.len() && group[j].timestamp <= window_limit {
            if let Some(port) = group[j].destination_port {
                ports.insert(port);
            }
            if attempts.len() < 50 {
                attempts.push(PortScanAttempt {
                    timestamp: group[j].timestamp,
                    destination_port: group[j].destination_port,
                    protocol: group[j].protocol.clone(),
                });
            }
            j += 1;
        }

        if ports.len() >= unique_ports_threshold {
            windows.push(PortScanWindow {
                window_start,
                window_end: group[j - 1].timestamp,
                attempt_count: j - i,
                unique_ports: ports.len(),
                ports: ports.iter().copied().take(50).collect(),
                attempts,
            });
            i = j;
        } else {
            i += 1;
        }
    }

    windows
}

fn calculate_severity(unique_ports: usize, window_count: usize, total_attempts: usize) -> Severity {
    if unique_ports >= 50 || window_count >= 6 || total_attempts >= 500 {
        Severity::Critical
    } else if unique_ports >= 25 || window_count >= 4 || total_attempts >= 200 {
        Severity::High
    } else if unique_ports >= 10 || window_count >= 2 || total_attempts >= 50 {
        Severity::Medium
    } else {
        Severity::Low
    }
}
