//! Columnar quantification binary.
//!
//! One file per quantification: a shared column header (labels + types)
//! and, per detector, one record per PMC. The `PMC`, `SCLK`, `RTT` and
//! `filename` CSV columns are stored structurally on the record; every
//! other column lands in `values[]`, parallel to the header.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Float,
    Int,
    Str,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnValue {
    F(f32),
    I(i32),
    S(String),
}

impl ColumnValue {
    pub fn to_csv_field(&self) -> String {
        match self {
            ColumnValue::F(v) => {
                if v.fract() == 0.0 && v.abs() < 1e15 {
                    format!("{:.1}", v)
                } else {
                    format!("{}", v)
                }
            }
            ColumnValue::I(v) => format!("{}", v),
            ColumnValue::S(v) => v.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantRecord {
    pub pmc: i32,
    pub sclk: i32,
    pub rtt: i32,
    pub filename: String,
    pub values: Vec<ColumnValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorSet {
    pub detector: String,
    pub records: Vec<QuantRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantFile {
    /// Title row of the source CSV, preserved verbatim.
    pub title: String,
    pub labels: Vec<String>,
    pub types: Vec<ColumnType>,
    pub detectors: Vec<DetectorSet>,
}

impl QuantFile {
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<QuantFile> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Elements quantified, derived from `_%` column labels. `K_%`
    /// yields `K`; oxide labels keep their formula.
    pub fn elements(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        for label in &self.labels {
            if let Some(elem) = label.strip_suffix("_%") {
                seen.insert(elem.to_string());
            }
        }
        seen.into_iter().collect()
    }

    pub fn detector_names(&self) -> Vec<String> {
        self.detectors.iter().map(|d| d.detector.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> QuantFile {
        QuantFile {
            title: "PIQUANT version: 3.2.8 DetectorConfig: PIXL/v7".to_string(),
            labels: vec!["Fe_%".into(), "CaO_%".into(), "Fe_int".into(), "livetime".into()],
            types: vec![ColumnType::Float, ColumnType::Float, ColumnType::Int, ColumnType::Float],
            detectors: vec![DetectorSet {
                detector: "Combined".to_string(),
                records: vec![QuantRecord {
                    pmc: 15,
                    sclk: 100,
                    rtt: 7890,
                    filename: "Normal_Combined".to_string(),
                    values: vec![
                        ColumnValue::F(10.5),
                        ColumnValue::F(3.2),
                        ColumnValue::I(400),
                        ColumnValue::F(9.9),
                    ],
                }],
            }],
        }
    }

    #[test]
    fn elements_come_from_percent_columns() {
        assert_eq!(sample().elements(), vec!["CaO".to_string(), "Fe".to_string()]);
    }

    #[test]
    fn binary_round_trip() {
        let q = sample();
        let back = QuantFile::from_bytes(&q.to_bytes().unwrap()).unwrap();
        assert_eq!(back.labels, q.labels);
        assert_eq!(back.detectors[0].records[0].pmc, 15);
        assert_eq!(back.detectors[0].records[0].values[2], ColumnValue::I(400));
    }

    #[test]
    fn csv_field_formatting() {
        assert_eq!(ColumnValue::F(10.0).to_csv_field(), "10.0");
        assert_eq!(ColumnValue::F(10.5).to_csv_field(), "10.5");
        assert_eq!(ColumnValue::I(42).to_csv_field(), "42");
        assert_eq!(ColumnValue::S("x".into()).to_csv_field(), "x");
    }
}
