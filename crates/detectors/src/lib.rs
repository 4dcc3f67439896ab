// Attack detectors over the event store
// Sliding-window analysis for brute force, floods, and port scans, plus the
// alert cache that materializes detector output and IP reputation enrichment.

pub mod alert_cache;
pub mod brute_force;
pub mod ddos;
pub mod port_scan;
pub mod reputation;

pub use alert_cache::{AlertDoc, get_or_compute_alerts};
pub use brute_force::{BruteForceDetection, BruteForceParams, detect_brute_force};
pub use ddos::{DdosParams, FloodDetection, detect_ddos};
pub use port_scan::{PortScanDetection, PortScanParams, detect_port_scan};
pub use reputation::ReputationService;
