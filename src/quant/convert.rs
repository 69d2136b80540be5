//! CSV to columnar-binary conversion and back.
//!
//! The worker's merged CSV becomes the internal [`QuantFile`]: `PMC`,
//! `SCLK`, `RTT` and `filename` move onto the record, every other
//! column lands in `values[]` typed by inference over the first data
//! row. Conversion back emits the canonical column order
//! `PMC, RTT, SCLK, filename, <values>`; re-converting the emitted form
//! is a fixed point.

use crate::quantfile::{ColumnType, ColumnValue, DetectorSet, QuantFile, QuantRecord};
use crate::scan::{Detector, ReadType, ScanFile};
use anyhow::{anyhow, bail, Context, Result};

const BEAM_TOLERANCE: f32 = 0.001;

/// Columns stored structurally on each record rather than in `values[]`.
const STRUCTURAL: &[&str] = &["PMC", "SCLK", "RTT", "filename"];

fn normalize_nan(field: &str) -> &str {
    if field == "-nan" {
        "nan"
    } else {
        field
    }
}

fn parse_float(field: &str) -> Option<f32> {
    normalize_nan(field).parse::<f32>().ok()
}

fn infer_type(field: &str) -> ColumnType {
    if field.parse::<i32>().is_ok() {
        ColumnType::Int
    } else if parse_float(field).is_some() {
        ColumnType::Float
    } else {
        ColumnType::Str
    }
}

/// Split a worker filename `<READTYPE>_<DETECTOR>[_<suffix>]`.
pub fn decode_filename(filename: &str) -> Result<(ReadType, Detector)> {
    let mut parts = filename.splitn(3, '_');
    let read_type = parts
        .next()
        .and_then(ReadType::parse)
        .ok_or_else(|| anyhow!("bad read type in filename: {}", filename))?;
    let detector = parts
        .next()
        .and_then(Detector::parse)
        .ok_or_else(|| anyhow!("bad detector in filename: {}", filename))?;
    Ok((read_type, detector))
}

fn optional_int(field: &str) -> Result<i32> {
    if field.is_empty() {
        return Ok(0);
    }
    field
        .parse()
        .with_context(|| format!("bad integer field: {}", field))
}

/// Parse a merged worker CSV into the columnar binary form.
///
/// When `scan` is given and the CSV carries `X`, `Y`, `Z` columns, each
/// row's PMC is re-derived from the scan's beam geometry; a location
/// that matches no scan entry fails the conversion.
pub fn csv_to_quant(csv: &str, scan: Option<&ScanFile>) -> Result<QuantFile> {
    let mut lines = csv.lines();
    let title = lines.next().context("CSV missing title row")?.to_string();
    let header = lines.next().context("CSV missing column header row")?;

    let columns: Vec<&str> = header.split(',').map(str::trim).collect();
    for (i, col) in columns.iter().enumerate() {
        if columns[..i].contains(col) {
            bail!("duplicate column: {}", col);
        }
    }
    let position = |name: &str| columns.iter().position(|c| *c == name);
    let pmc_col = position("PMC").context("CSV missing PMC column")?;
    let sclk_col = position("SCLK").context("CSV missing SCLK column")?;
    let rtt_col = position("RTT").context("CSV missing RTT column")?;
    let filename_col = position("filename").context("CSV missing filename column")?;

    let beam_cols = match (position("X"), position("Y"), position("Z")) {
        (Some(x), Some(y), Some(z)) => Some((x, y, z)),
        _ => None,
    };

    let value_cols: Vec<usize> = (0..columns.len())
        .filter(|i| !STRUCTURAL.contains(&columns[*i]))
        .collect();
    let labels: Vec<String> = value_cols.iter().map(|&i| columns[i].to_string()).collect();

    let data_lines: Vec<&str> = lines.filter(|l| !l.trim().is_empty()).collect();
    let first = data_lines
        .first()
        .context("CSV contains no data rows")?;
    let first_fields: Vec<&str> = first.split(',').map(str::trim).collect();
    if first_fields.len() != columns.len() {
        bail!("first data row width does not match header");
    }
    let types: Vec<ColumnType> = value_cols
        .iter()
        .map(|&i| infer_type(first_fields[i]))
        .collect();

    let mut detectors: Vec<DetectorSet> = Vec::new();
    for line in data_lines {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != columns.len() {
            bail!("row width does not match header: {}", line);
        }

        let mut pmc: i32 = fields[pmc_col]
            .parse()
            .with_context(|| format!("bad PMC: {}", fields[pmc_col]))?;
        if let (Some(scan), Some((x, y, z))) = (scan, beam_cols) {
            let coords = (
                parse_float(fields[x]).context("bad X coordinate")?,
                parse_float(fields[y]).context("bad Y coordinate")?,
                parse_float(fields[z]).context("bad Z coordinate")?,
            );
            pmc = scan
                .pmc_by_beam(coords.0, coords.1, coords.2, BEAM_TOLERANCE)
                .ok_or_else(|| {
                    anyhow!("no scan location at ({}, {}, {})", coords.0, coords.1, coords.2)
                })?;
        }

        let filename = fields[filename_col].to_string();
        let (_, detector) = decode_filename(&filename)?;

        let mut values = Vec::with_capacity(value_cols.len());
        for (slot, &i) in value_cols.iter().enumerate() {
            let field = fields[i];
            let value = match types[slot] {
                ColumnType::Int => ColumnValue::I(
                    field
                        .parse()
                        .with_context(|| format!("bad int in column {}: {}", labels[slot], field))?,
                ),
                ColumnType::Float => ColumnValue::F(parse_float(field).with_context(|| {
                    format!("bad float in column {}: {}", labels[slot], field)
                })?),
                ColumnType::Str => ColumnValue::S(field.to_string()),
            };
            values.push(value);
        }

        let record = QuantRecord {
            pmc,
            sclk: optional_int(fields[sclk_col])?,
            rtt: optional_int(fields[rtt_col])?,
            filename,
            values,
        };

        let det_name = detector.as_str();
        match detectors.iter_mut().find(|d| d.detector == det_name) {
            Some(set) => set.records.push(record),
            None => detectors.push(DetectorSet {
                detector: det_name.to_string(),
                records: vec![record],
            }),
        }
    }

    Ok(QuantFile {
        title,
        labels,
        types,
        detectors,
    })
}

/// Emit the columnar binary back as CSV, preserving value-column order.
pub fn quant_to_csv(quant: &QuantFile) -> String {
    let mut out = String::new();
    out.push_str(&quant.title);
    out.push('\n');
    out.push_str("PMC, RTT, SCLK, filename");
    for label in &quant.labels {
        out.push_str(", ");
        out.push_str(label);
    }
    out.push('\n');
    for set in &quant.detectors {
        for rec in &set.records {
            out.push_str(&format!(
                "{}, {}, {}, {}",
                rec.pmc, rec.rtt, rec.sclk, rec.filename
            ));
            for value in &rec.values {
                out.push_str(", ");
                out.push_str(&value.to_csv_field());
            }
            out.push('\n');
        }
    }
    out
}
