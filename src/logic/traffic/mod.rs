//! Traffic History Tracker - Lưu lượng vào/ra theo port
//!
//! Traffic-volume plan: an ingress rate above the port's historical peak is
//! only accepted when the egress of the sibling ports on the same switch
//! surged with it. Peaks are persisted by host number in a snapshot file
//! shared with the peer process.

pub mod storage;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use super::error::PeakFileError;
use super::switch::BindingDirectory;
use super::types::{SwitchPort, Verdict};

// ============================================================================
// TYPES
// ============================================================================

/// Volume history of one port (packets per second)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PortVolume {
    pub ingress_rate: f64,
    pub peak_ingress: f64,
    pub sibling_egress_baseline: f64,
}

/// One cycle's rates for a port
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrafficSample {
    pub ingress: f64,
    pub sibling_egress: f64,
}

// ============================================================================
// TRACKER
// ============================================================================

pub struct TrafficHistoryTracker {
    volumes: RwLock<HashMap<SwitchPort, PortVolume>>,
    surge_factor: f64,
    default_peak: f64,
    peak_file: PathBuf,
    directory: Arc<dyn BindingDirectory>,
}

impl TrafficHistoryTracker {
    pub fn new(
        surge_factor: f64,
        default_peak: f64,
        peak_file: PathBuf,
        directory: Arc<dyn BindingDirectory>,
    ) -> Self {
        Self {
            volumes: RwLock::new(HashMap::new()),
            surge_factor,
            default_peak,
            peak_file,
            directory,
        }
    }

    /// Load peaks for `ports` from the snapshot. An unusable snapshot
    /// resets every port to the default peak.
    pub fn init(&self, ports: &[SwitchPort]) {
        let loaded = match storage::load_peaks(&self.peak_file) {
            Ok(peaks) => Some(peaks),
            Err(e) => {
                log::warn!("Peak snapshot unusable ({}), using default peak {}", e, self.default_peak);
                None
            }
        };

        let mut volumes = self.volumes.write();
        volumes.clear();
        for &sp in ports {
            let peak = loaded
                .as_ref()
                .and_then(|peaks| self.directory.host_number_for(&sp).and_then(|h| peaks.get(&h)))
                .copied()
                .unwrap_or(self.default_peak);
            volumes.insert(sp, PortVolume { peak_ingress: peak, ..Default::default() });
        }
    }

    /// Traffic-plan verdicts for the ports `classified` accepts. Ports
    /// without a sample get `NoData`; the others are left untouched.
    pub fn evaluate<F>(&self, samples: &HashMap<SwitchPort, TrafficSample>, classified: F) -> HashMap<SwitchPort, Verdict>
    where
        F: Fn(&SwitchPort) -> bool,
    {
        let mut verdicts = HashMap::new();
        let mut raised = false;

        {
            let mut volumes = self.volumes.write();
            for (sp, volume) in volumes.iter_mut().filter(|(sp, _)| classified(sp)) {
                let Some(sample) = samples.get(sp) else {
                    verdicts.insert(*sp, Verdict::NoData);
                    continue;
                };

                let (verdict, peak_raised) = self.judge(volume, sample);
                if verdict == Verdict::Bad {
                    log::info!(
                        "Port {} ingress {:.2} over peak {:.2} without egress surge ({:.2} <= {:.2} x {})",
                        sp, sample.ingress, volume.peak_ingress, sample.sibling_egress,
                        volume.sibling_egress_baseline, self.surge_factor
                    );
                }
                raised |= peak_raised;
                verdicts.insert(*sp, verdict);
            }
        }

        if raised {
            self.persist_or_log();
        }
        verdicts
    }

    /// Compare one sample with the port's history, updating it in place
    fn judge(&self, volume: &mut PortVolume, sample: &TrafficSample) -> (Verdict, bool) {
        volume.ingress_rate = sample.ingress;
        if sample.ingress <= volume.peak_ingress {
            return (Verdict::Good, false);
        }

        if sample.sibling_egress > volume.sibling_egress_baseline * self.surge_factor {
            log::info!(
                "Legitimate bulk traffic: ingress {:.2} (peak {:.2}), sibling egress {:.2} (baseline {:.2})",
                sample.ingress, volume.peak_ingress, sample.sibling_egress, volume.sibling_egress_baseline
            );
            volume.peak_ingress = sample.ingress;
            volume.sibling_egress_baseline = sample.sibling_egress;
            (Verdict::Good, true)
        } else {
            (Verdict::Bad, false)
        }
    }

    #[cfg(test)]
    pub fn volume(&self, port: &SwitchPort) -> Option<PortVolume> {
        self.volumes.read().get(port).copied()
    }

    /// Peaks keyed by host number
    pub fn peaks_by_host(&self) -> BTreeMap<u32, f64> {
        self.volumes.read()
            .iter()
            .filter_map(|(sp, v)| self.directory.host_number_for(sp).map(|h| (h, v.peak_ingress)))
            .collect()
    }

    fn persist(&self) -> Result<(), PeakFileError> {
        storage::save_peaks(&self.peak_file, &self.peaks_by_host())
    }

    fn persist_or_log(&self) {
        if let Err(e) = self.persist() {
            log::error!("Failed to write peak snapshot {:?}: {}", self.peak_file, e);
        }
    }

    // ========================================================================
    // ADMIN OPERATIONS
    // ========================================================================

    /// Take the current sibling egress as every port's baseline
    pub fn update_out_flow(&self, samples: &HashMap<SwitchPort, TrafficSample>) -> BTreeMap<u32, f64> {
        let mut volumes = self.volumes.write();
        for (sp, volume) in volumes.iter_mut() {
            if let Some(sample) = samples.get(sp) {
                volume.sibling_egress_baseline = sample.sibling_egress;
            }
        }

        let baselines: BTreeMap<u32, f64> = volumes
            .iter()
            .filter_map(|(sp, v)| self.directory.host_number_for(sp).map(|h| (h, v.sibling_egress_baseline)))
            .collect();
        log::info!("Sibling egress baselines updated: {:?}", baselines);
        baselines
    }

    /// Current sibling egress by host
    pub fn show_out_flow(&self, samples: &HashMap<SwitchPort, TrafficSample>) -> BTreeMap<u32, f64> {
        let volumes = self.volumes.read();
        let current: BTreeMap<u32, f64> = samples
            .iter()
            .filter(|(sp, _)| volumes.contains_key(*sp))
            .filter_map(|(sp, s)| self.directory.host_number_for(sp).map(|h| (h, s.sibling_egress)))
            .collect();
        log::info!("Current sibling egress: {:?}", current);
        current
    }

    /// Peaks by host; logs current ingress against them
    pub fn show_max_traffic(&self, samples: &HashMap<SwitchPort, TrafficSample>) -> BTreeMap<u32, f64> {
        let volumes = self.volumes.read();
        let mut current: BTreeMap<u32, f64> = BTreeMap::new();
        for (sp, s) in samples {
            if !volumes.contains_key(sp) {
                continue;
            }
            if let Some(h) = self.directory.host_number_for(sp) {
                current.insert(h, s.ingress);
            }
        }
        drop(volumes);

        let peaks = self.peaks_by_host();
        for (host, ingress) in &current {
            log::info!(
                "host {}: current in {:.2}, peak {:.2}",
                host, ingress, peaks.get(host).copied().unwrap_or(self.default_peak)
            );
        }
        peaks
    }

    /// Raise every peak to the current ingress and persist
    pub fn update_max_traffic(&self, samples: &HashMap<SwitchPort, TrafficSample>) -> Result<BTreeMap<u32, f64>, PeakFileError> {
        {
            let mut volumes = self.volumes.write();
            for (sp, volume) in volumes.iter_mut() {
                if let Some(sample) = samples.get(sp) {
                    if sample.ingress > volume.peak_ingress {
                        volume.peak_ingress = sample.ingress;
                    }
                }
            }
        }
        self.persist()?;
        Ok(self.peaks_by_host())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::switch::StaticBindings;
    use crate::logic::types::{Binding, PortNo, SwitchId};
    use tempfile::TempDir;

    fn port(p: u32) -> SwitchPort {
        SwitchPort::new(SwitchId(2), PortNo(p))
    }

    fn directory(n: u32) -> Arc<StaticBindings> {
        let bindings = (1..=n)
            .map(|p| Binding {
                switch_port: port(p),
                mac: format!("00:00:00:00:00:{:02x}", p).parse().unwrap(),
                address: format!("2001:db8::{}", p).parse().unwrap(),
            })
            .collect();
        Arc::new(StaticBindings::new(bindings))
    }

    fn tracker(dir: &TempDir, hosts: u32) -> TrafficHistoryTracker {
        TrafficHistoryTracker::new(1.3, 100.0, dir.path().join("max_traffic.txt"), directory(hosts))
    }

    fn sample(ingress: f64, sibling_egress: f64) -> TrafficSample {
        TrafficSample { ingress, sibling_egress }
    }

    #[test]
    fn test_below_peak_always_right() {
        let dir = TempDir::new().unwrap();
        let t = tracker(&dir, 1);
        t.init(&[port(1)]);

        for egress in [0.0, 10.0, 1_000_000.0] {
            let verdicts = t.evaluate(&HashMap::from([(port(1), sample(99.0, egress))]), |_| true);
            assert_eq!(verdicts[&port(1)], Verdict::Good);
        }
        assert_eq!(t.volume(&port(1)).unwrap().peak_ingress, 100.0);
    }

    #[test]
    fn test_correlated_surge_raises_peak() {
        let dir = TempDir::new().unwrap();
        let t = tracker(&dir, 1);
        t.init(&[port(1)]);
        t.update_out_flow(&HashMap::from([(port(1), sample(0.0, 50.0))]));

        let verdicts = t.evaluate(&HashMap::from([(port(1), sample(150.0, 80.0))]), |_| true);
        assert_eq!(verdicts[&port(1)], Verdict::Good);

        let v = t.volume(&port(1)).unwrap();
        assert_eq!(v.peak_ingress, 150.0);
        assert_eq!(v.sibling_egress_baseline, 80.0);

        // Snapshot rewritten
        let saved = storage::load_peaks(&dir.path().join("max_traffic.txt")).unwrap();
        assert_eq!(saved[&1], 150.0);
    }

    #[test]
    fn test_uncorrelated_spike_is_anomalous() {
        let dir = TempDir::new().unwrap();
        let t = tracker(&dir, 1);
        t.init(&[port(1)]);
        t.update_out_flow(&HashMap::from([(port(1), sample(0.0, 50.0))]));

        let verdicts = t.evaluate(&HashMap::from([(port(1), sample(150.0, 60.0))]), |_| true);
        assert_eq!(verdicts[&port(1)], Verdict::Bad);

        let v = t.volume(&port(1)).unwrap();
        assert_eq!(v.peak_ingress, 100.0);
        assert_eq!(v.sibling_egress_baseline, 50.0);
        assert!(!dir.path().join("max_traffic.txt").exists());
    }

    #[test]
    fn test_missing_sample_no_data() {
        let dir = TempDir::new().unwrap();
        let t = tracker(&dir, 2);
        t.init(&[port(1), port(2)]);
        let verdicts = t.evaluate(&HashMap::from([(port(1), sample(1.0, 0.0))]), |_| true);
        assert_eq!(verdicts[&port(2)], Verdict::NoData);
    }

    #[test]
    fn test_unclassified_ports_left_alone() {
        let dir = TempDir::new().unwrap();
        let t = tracker(&dir, 2);
        t.init(&[port(1), port(2)]);
        t.update_out_flow(&HashMap::from([(port(2), sample(0.0, 10.0))]));

        let samples = HashMap::from([(port(1), sample(50.0, 0.0)), (port(2), sample(900.0, 500.0))]);
        let verdicts = t.evaluate(&samples, |sp| *sp != port(2));
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[&port(1)], Verdict::Good);

        // Surge on port 2 would have raised its peak if it were judged
        let v = t.volume(&port(2)).unwrap();
        assert_eq!(v.peak_ingress, 100.0);
        assert_eq!(v.ingress_rate, 0.0);
        assert!(!dir.path().join("max_traffic.txt").exists());
    }

    #[test]
    fn test_malformed_snapshot_resets_all_peaks() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("max_traffic.txt"), "1 20.5\n2 33\n3 abc\n").unwrap();

        let t = tracker(&dir, 3);
        t.init(&[port(1), port(2), port(3)]);
        let peaks = t.peaks_by_host();
        assert_eq!(peaks.len(), 3);
        assert!(peaks.values().all(|&p| p == 100.0));
    }

    #[test]
    fn test_negative_peak_resets_all_peaks() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("max_traffic.txt"), "1 20.5\n2 -5\n").unwrap();

        let t = tracker(&dir, 2);
        t.init(&[port(1), port(2)]);
        assert!(t.peaks_by_host().values().all(|&p| p == 100.0));
    }

    #[test]
    fn test_valid_snapshot_loaded() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("max_traffic.txt"), "1 20.5\n2 33\n").unwrap();

        let t = tracker(&dir, 3);
        t.init(&[port(1), port(2), port(3)]);
        let peaks = t.peaks_by_host();
        assert_eq!(peaks[&1], 20.5);
        assert_eq!(peaks[&2], 33.0);
        assert_eq!(peaks[&3], 100.0);
    }

    #[test]
    fn test_parse_rejects_wrong_field_count() {
        assert!(storage::parse_peaks("1 2 3").is_err());
        assert!(storage::parse_peaks("1").is_err());
        assert!(storage::parse_peaks("x 1.0").is_err());
        assert!(storage::parse_peaks("3 -5").is_err());
        assert!(storage::parse_peaks("3 -0.5e2").is_err());
        assert_eq!(storage::parse_peaks("7 1.5\n").unwrap()[&7], 1.5);
    }

    #[test]
    fn test_update_max_traffic_persists() {
        let dir = TempDir::new().unwrap();
        let t = tracker(&dir, 2);
        t.init(&[port(1), port(2)]);

        let peaks = t
            .update_max_traffic(&HashMap::from([(port(1), sample(250.0, 0.0)), (port(2), sample(5.0, 0.0))]))
            .unwrap();
        assert_eq!(peaks[&1], 250.0);
        assert_eq!(peaks[&2], 100.0);

        let saved = storage::load_peaks(&dir.path().join("max_traffic.txt")).unwrap();
        assert_eq!(saved, peaks);
    }
}
