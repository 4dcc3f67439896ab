//! DDoS / flood detector.
//!
//! Two independent sub-detectors run over the same time slice:
//! single-IP floods (rate per source IP) and distributed floods (many IPs
//! converging on one destination port/protocol).

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use firewall_common::database::DbPool;
use firewall_common::database::queries::{ScanFilter, scan_range};
use firewall_common::error::StoreError;
use firewall_common::{Event, SampleEvent, Severity};

#[derive(Debug, Clone)]
pub struct DdosParams {
    pub time_window_seconds: i64,
    pub single_ip_threshold: usize,
    pub distributed_ip_count: usize,
    pub distributed_request_threshold: usize,
    pub destination_port: Option<u16>,
    pub protocol: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl Default for DdosParams {
    fn default() -> Self {
        DdosParams {
            time_window_seconds: 60,
            single_ip_threshold: 100,
            distributed_ip_count: 10,
            distributed_request_threshold: 500,
            destination_port: None,
            protocol: None,
            start: None,
            end: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SingleIpWindow {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub request_count: usize,
    pub request_rate_per_min: f64,
    pub target_ports: BTreeMap<u16, usize>,
    pub protocols: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SingleIpFlood {
    pub source_ip: String,
    pub total_requests: usize,
    pub peak_request_rate: f64,
    pub avg_request_rate: f64,
    pub target_ports: Vec<u16>,
    pub target_protocols: Vec<String>,
    pub first_request: DateTime<Utc>,
    pub last_request: DateTime<Utc>,
    pub attack_windows: Vec<SingleIpWindow>,
    pub severity: Severity,
    pub sample: SampleEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedWindow {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub request_count: usize,
    pub unique_ip_count: usize,
    pub request_rate_per_min: f64,
    /// Top 10 attacking IPs inside this window with request counts.
    pub top_attacking_ips: Vec<(String, usize)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedFlood {
    /// Top 20 attacking IPs across the whole detection.
    pub source_ips: Vec<String>,
    pub source_ip_count: usize,
    pub total_requests: usize,
    pub peak_request_rate: f64,
    pub avg_request_rate: f64,
    pub peak_unique_ips: usize,
    pub target_port: Option<u16>,
    pub target_protocol: Option<String>,
    pub first_request: DateTime<Utc>,
    pub last_request: DateTime<Utc>,
    pub attack_windows: Vec<DistributedWindow>,
    pub top_attacking_ips: Vec<(String, usize)>,
    pub severity: Severity,
    pub sample: SampleEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "attack_type")]
pub enum FloodDetection {
    #[serde(rename = "SINGLE_IP_FLOOD")]
    SingleIp(SingleIpFlood),
    #[serde(rename = "DISTRIBUTED_FLOOD")]
    Distributed(DistributedFlood),
}

impl FloodDetection {
    pub fn severity(&self) -> Severity {
        match self {
            FloodDetection::SingleIp(d) => d.severity,
            FloodDetection::Distributed(d) => d.severity,
        }
    }

    pub fn peak_request_rate(&self) -> f64 {
        match self {
            FloodDetection::SingleIp(d) => d.peak_request_rate,
            FloodDetection::Distributed(d) => d.peak_request_rate,
        }
    }

    pub fn total_requests(&self) -> usize {
        match self {
            FloodDetection::SingleIp(d) => d.total_requests,
            FloodDetection::Distributed(d) => d.total_requests,
        }
    }

    /// Primary source IP, if one exists. Distributed floods may have none.
    pub fn primary_ip(&self) -> Option<&str> {
        match self {
            FloodDetection::SingleIp(d) => Some(d.source_ip.as_str()),
            FloodDetection::Distributed(d) => d.source_ips.first().map(String::as_str),
        }
    }

    pub fn first_request(&self) -> DateTime<Utc> {
        match self {
            FloodDetection::SingleIp(d) => d.first_request,
            FloodDetection::Distributed(d) => d.first_request,
        }
    }

    pub fn last_request(&self) -> DateTime<Utc> {
        match self {
            FloodDetection::SingleIp(d) => d.last_request,
            FloodDetection::Distributed(d) => d.last_request,
        }
    }

    pub fn sample(&self) -> &SampleEvent {
        match self {
            FloodDetection::SingleIp(d) => &d.sample,
            FloodDetection::Distributed(d) => &d.sample,
        }
    }
}

/// Detect floods in the store. Defaults to the last hour anchored at now.
pub async fn detect_ddos(
    pool: &DbPool,
    params: &DdosParams,
) -> Result<Vec<FloodDetection>, StoreError> {
    let end = params.end.unwrap_or_else(Utc::now);
    let start = params.start.unwrap_or(end - Duration::hours(1));

    let mut filter = ScanFilter::range(start, end);
    filter.destination_port = params.destination_port;
    filter.protocol = params.protocol.clone();

    let events = scan_range(pool, &filter).await?;
    Ok(detect_in_events(&events, params))
}

/// Pure core over events ordered by timestamp ascending.
pub fn detect_in_events(events: &[Event], params: &DdosParams) -> Vec<FloodDetection> {
    if events.is_empty() {
        return Vec::new();
    }

    let mut detections: Vec<FloodDetection> = Vec::new();
    detections.extend(
        detect_single_ip_floods(events, params.time_window_seconds, params.single_ip_threshold)
            .into_iter()
            .map(FloodDetection::SingleIp),
    );
    detections.extend(
        detect_distributed_floods(
            events,
            params.time_window_seconds,
            params.distributed_ip_count,
            params.distributed_request_threshold,
        )
        .into_iter()
        .map(FloodDetection::Distributed),
    );

    // Most severe first, then highest peak rate.
    detections.sort_by(|a, b| {
        a.severity()
            .sort_rank()
            .cmp(&b.severity().sort_rank())
            .then(
                b.peak_request_rate()
                    .partial_cmp(&a.peak_request_rate())
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
    });
    detections
}

fn rate_per_min(count: usize, window_seconds: i64) -> f64 {
    count as f64 / (window_seconds as f64 / 60.0)
}

fn avg_rate(total: usize, first: DateTime<Utc>, last: DateTime<Utc>) -> f64 {
    let span_seconds = (last - first).num_milliseconds() as f64 / 1000.0;
    if span_seconds > 0.0 {
        total as f64 / (span_seconds / 60.0)
    } else {
        total as f64
    }
}

fn detect_single_ip_floods(
    events: &[Event],
    window_seconds: i64,
    threshold: usize,
) -> Vec<SingleIpFlood> {
    let mut by_ip: BTreeMap<&str, Vec<&Event>> = BTreeMap::new();
    for event in events {
        by_ip.entry(event.source_ip.as_str()).or_default().push(event);
    }

    let mut detections = Vec::new();
    for (ip, mut group) in by_ip {
        group.sort_by_key(|e| e.timestamp);
        let last_ts = group[group.len() - 1].timestamp;

        let mut windows = Vec::new();
        let mut i = 0;
        while i < group.len() {
            let window_start = group[i].timestamp;
            let window_limit = window_start + Duration::seconds(window_seconds);

            let mut j = i;
            while j < group.len() && group[j].timestamp <= window_limit {
                j += 1;
            }

            let count = j - i;
            if count >= threshold {
                let mut ports: BTreeMap<u16, usize> = BTreeMap::new();
                let mut protocols: BTreeMap<String, usize> = BTreeMap::new();
                for event in &group[i..j] {
                    if let Some(port) = event.destination_port {
                        *ports.entry(port).or_insert(0) += 1;
                    }
                    if let Some(protocol) = &event.protocol {
                        *protocols.entry(protocol.clone()).or_insert(0) += 1;
                    }
                }
                windows.push(SingleIpWindow {
                    window_start,
                    window_end: window_limit.min(last_ts),
                    request_count: count,
                    request_rate_per_min: rate_per_min(count, window_seconds),
                    target_ports: ports,
                    protocols,
                });
            }

            // Advance past the window whether or not it qualified.
            i = j;
        }

        if windows.is_empty() {
            continue;
        }

        let peak = windows
            .iter()
            .map(|w| w.request_rate_per_min)
            .fold(f64::MIN, f64::max);
        let target_ports: BTreeSet<u16> =
            group.iter().filter_map(|e| e.destination_port).collect();
        let target_protocols: BTreeSet<String> =
            group.iter().filter_map(|e| e.protocol.clone()).collect();
        let first = group[0].timestamp;
        let sample = group[group.len() - 1].sample();

        detections.push(SingleIpFlood {
            source_ip: ip.to_string(),
            total_requests: group.len(),
            peak_request_rate: peak,
            avg_request_rate: avg_rate(group.len(), first, last_ts),
            target_ports: target_ports.into_iter().collect(),
            target_protocols: target_protocols.into_iter().collect(),
            first_request: first,
            last_request: last_ts,
            severity: single_ip_severity(peak, windows.len()),
            attack_windows: windows,
            sample,
        });
    }
    detections
}

fn top_ip_counts(counts: BTreeMap<&str, usize>, limit: usize) -> Vec<(String, usize)> {
    let mut entries: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(ip, count)| (ip.to_string(), count))
        .collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    entries.truncate(limit);
    entries
}

fn detect_distributed_floods(
    events: &[Event],
    window_seconds: i64,
    min_ip_count: usize,
    min_request_threshold: usize,
) -> Vec<DistributedFlood> {
    let mut by_target: BTreeMap<(Option<u16>, Option<&str>), Vec<&Event>> = BTreeMap::new();
    for event in events {
        let key = (event.destination_port, event.protocol.as_deref());
        by_target.entry(key).or_default().push(event);
    }

    let mut detections = Vec::new();
    for ((port, protocol), mut group) in by_target {
        if group.len() < min_request_threshold {
            continue;
        }
        group.sort_by_key(|e| e.timestamp);
        let last_ts = group[group.len() - 1].timestamp;

        let unique_ips: BTreeSet<&str> = group.iter().map(|e| e.source_ip.as_str()).collect();
        if unique_ips.len() < min_ip_count {
            continue;
        }

        let mut windows = Vec::new();
        let mut i = 0;
        while i < group.len() {
            let window_start = group[i].timestamp;
            let window_limit = window_start + Duration::seconds(window_seconds);

            let mut j = i;
            while j < group.len() && group[j].timestamp <= window_limit {
                j += 1;
            }

            let count = j - i;
            if count >= min_request_threshold {
                let mut window_ip_counts: BTreeMap<&str, usize> = BTreeMap::new();
                for event in &group[i..j] {
                    *window_ip_counts.entry(event.source_ip.as_str()).or_insert(0) += 1;
                }
                // A window counts only when enough distinct sources converge.
                if window_ip_counts.len() >= min_ip_count {
                    windows.push(DistributedWindow {
                        window_start,
                        window_end: window_limit.min(last_ts),
                        request_count: count,
                        unique_ip_count: window_ip_counts.len(),
                        request_rate_per_min: rate_per_min(count, window_seconds),
                        top_attacking_ips: top_ip_counts(window_ip_counts, 10),
                    });
                }
            }

            i = j;
        }

        if windows.is_empty() {
            continue;
        }

        let peak_rate = windows
            .iter()
            .map(|w| w.request_rate_per_min)
            .fold(f64::MIN, f64::max);
        let peak_unique = windows.iter().map(|w| w.unique_ip_count).max().unwrap_or(0);

        let mut overall_counts: BTreeMap<&str, usize> = BTreeMap::new();
        for event in &group {
            *overall_counts.entry(event.source_ip.as_str()).or_insert(0) += 1;
        }
        let top_ips = top_ip_counts(overall_counts, 20);
        let first = group[0].timestamp;
        let sample = group[group.len() - 1].sample();

        detections.push(DistributedFlood {
            source_ips: top_ips.iter().map(|(ip, _)| ip.clone()).collect(),
            source_ip_count: unique_ips.len(),
            total_requests: group.len(),
            peak_request_rate: peak_rate,
            avg_request_rate: avg_rate(group.len(), first, last_ts),
            peak_unique_ips: peak_unique,
            target_port: port,
            target_protocol: protocol.map(str::to_string),
            first_request: first,
            last_request: last_ts,
            severity: distributed_severity(peak_rate, unique_ips.len(), windows.len()),
            attack_windows: windows,
            top_attacking_ips: top_ips,
            sample,
        });
    }
    detections
}

fn single_ip_severity(peak_rate: f64, window_count: usize) -> Severity {
    if peak_rate >= 1000.0 || window_count >= 10 {
        Severity::Critical
    } else if peak_rate >= 500.0 || window_count >= 5 {
        Severity::High
    } else if peak_rate >= 200.0 || window_count >= 3 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

fn distributed_severity(peak_rate: f64, unique_ips: usize, window_count: usize) -> Severity {
    if peak_rate >= 2000.0 || unique_ips >= 50 || window_count >= 10 {
        Severity::Critical
    } else if peak_rate >= 1000.0 || unique_ips >= 25 || window_count >= 5 {
        Severity::High
    } else if peak_rate >= 500.0 || unique_ips >= 15 || window_count >= 3 {
        Severity::Medium
    } else {
        Severity::Low
    }
}
