//! In-memory model of a scan binary.
//!
//! A scan is an ordered list of entries, one per point-measurement
//! coordinate (PMC). Each entry records which spectra were acquired for
//! that PMC (read type x detector) and, when beam geometry is known, the
//! beam location. The orchestrator reads scans through the file cache;
//! this module only deserializes and answers membership queries.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadType {
    Normal,
    Dwell,
    BulkSum,
    MaxValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Detector {
    A,
    B,
    Combined,
}

impl ReadType {
    pub fn parse(s: &str) -> Option<ReadType> {
        match s {
            "Normal" => Some(ReadType::Normal),
            "Dwell" => Some(ReadType::Dwell),
            "BulkSum" => Some(ReadType::BulkSum),
            "MaxValue" => Some(ReadType::MaxValue),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReadType::Normal => "Normal",
            ReadType::Dwell => "Dwell",
            ReadType::BulkSum => "BulkSum",
            ReadType::MaxValue => "MaxValue",
        }
    }
}

impl Detector {
    pub fn parse(s: &str) -> Option<Detector> {
        match s {
            "A" => Some(Detector::A),
            "B" => Some(Detector::B),
            "Combined" => Some(Detector::Combined),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Detector::A => "A",
            Detector::B => "B",
            Detector::Combined => "Combined",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BeamLocation {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpectrumMeta {
    pub read_type: ReadType,
    pub detector: Detector,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanEntry {
    pub pmc: i32,
    pub beam: Option<BeamLocation>,
    pub spectra: Vec<SpectrumMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanFile {
    pub scan_id: String,
    pub instrument: String,
    pub entries: Vec<ScanEntry>,
}

impl ScanFile {
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<ScanFile> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Basename of the dataset file as it appears on manifest line 1.
    pub fn dataset_basename(&self) -> String {
        format!("{}{}", self.scan_id, crate::filepaths::DATASET_FILE)
    }

    fn entry(&self, pmc: i32) -> Option<&ScanEntry> {
        self.entries.iter().find(|e| e.pmc == pmc)
    }

    pub fn has_spectrum(&self, pmc: i32, read_type: ReadType) -> bool {
        self.entry(pmc)
            .map(|e| e.spectra.iter().any(|s| s.read_type == read_type))
            .unwrap_or(false)
    }

    pub fn has_dwell(&self, pmc: i32) -> bool {
        self.has_spectrum(pmc, ReadType::Dwell)
    }

    /// PMCs of every entry that has at least one normal spectrum, in
    /// scan order.
    pub fn pmcs_with_normal(&self) -> Vec<i32> {
        self.entries
            .iter()
            .filter(|e| e.spectra.iter().any(|s| s.read_type == ReadType::Normal))
            .map(|e| e.pmc)
            .collect()
    }

    /// Map a scan-entry index (as stored in ROI index lists) to its PMC.
    pub fn pmc_for_index(&self, index: i32) -> Option<i32> {
        self.entries.get(index as usize).map(|e| e.pmc)
    }

    /// Find the entry whose beam location matches (x, y, z) within
    /// `tolerance` on each axis.
    pub fn pmc_by_beam(&self, x: f32, y: f32, z: f32, tolerance: f32) -> Option<i32> {
        self.entries
            .iter()
            .find(|e| {
                e.beam.map_or(false, |b| {
                    (b.x - x).abs() <= tolerance
                        && (b.y - y).abs() <= tolerance
                        && (b.z - z).abs() <= tolerance
                })
            })
            .map(|e| e.pmc)
    }
}

#[cfg(test)]
pub mod testutil {
    use super::*;

    /// Scan with normal A+B spectra on every PMC, plus dwell A+B on
    /// `dwell_pmcs`.
    pub fn scan_with(scan_id: &str, pmcs: &[i32], dwell_pmcs: &[i32]) -> ScanFile {
        let entries = pmcs
            .iter()
            .map(|&pmc| {
                let mut spectra = vec![
                    SpectrumMeta { read_type: ReadType::Normal, detector: Detector::A },
                    SpectrumMeta { read_type: ReadType::Normal, detector: Detector::B },
                ];
                if dwell_pmcs.contains(&pmc) {
                    spectra.push(SpectrumMeta { read_type: ReadType::Dwell, detector: Detector::A });
                    spectra.push(SpectrumMeta { read_type: ReadType::Dwell, detector: Detector::B });
                }
                ScanEntry { pmc, beam: None, spectra }
            })
            .collect();
        ScanFile {
            scan_id: scan_id.to_string(),
            instrument: "PIXL".to_string(),
            entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialization_round_trips() {
        let scan = testutil::scan_with("5x11", &[15, 7, 388], &[15]);
        let bytes = scan.to_bytes().unwrap();
        let back = ScanFile::from_bytes(&bytes).unwrap();
        assert_eq!(back.scan_id, "5x11");
        assert_eq!(back.entries.len(), 3);
        assert!(back.has_dwell(15));
        assert!(!back.has_dwell(7));
    }

    #[test]
    fn pmc_lookup_helpers() {
        let scan = testutil::scan_with("s", &[10, 20, 30], &[]);
        assert_eq!(scan.pmcs_with_normal(), vec![10, 20, 30]);
        assert_eq!(scan.pmc_for_index(1), Some(20));
        assert_eq!(scan.pmc_for_index(5), None);
    }

    #[test]
    fn beam_match_uses_tolerance() {
        let mut scan = testutil::scan_with("s", &[1, 2], &[]);
        scan.entries[0].beam = Some(BeamLocation { x: 1.0, y: 2.0, z: 3.0 });
        scan.entries[1].beam = Some(BeamLocation { x: 9.0, y: 9.0, z: 9.0 });
        assert_eq!(scan.pmc_by_beam(1.0005, 2.0, 3.0, 0.001), Some(1));
        assert_eq!(scan.pmc_by_beam(1.5, 2.0, 3.0, 0.001), None);
    }
}
