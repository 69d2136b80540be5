//! Run-length encoding for sorted non-negative index lists.
//!
//! PMC lists and ROI index lists travel in a compact form where `-1`
//! between two values `a` and `b` denotes the inclusive expansion
//! `a, a+1, ..., b`. Only `-1` is a legal negative; a run marker needs
//! `b > a + 1`; the sequence may not start or end with `-1`.

use anyhow::{bail, Result};

/// Expand an encoded index list. When `array_size >= 0`, every decoded
/// value must lie in `0..array_size`.
pub fn decode_index_list(encoded: &[i32], array_size: i32) -> Result<Vec<i32>> {
    let mut out: Vec<i32> = Vec::with_capacity(encoded.len());
    let mut idx = 0usize;
    while idx < encoded.len() {
        let v = encoded[idx];
        if v == -1 {
            if idx == 0 {
                bail!("index list must not start with a range marker");
            }
            if idx + 1 >= encoded.len() {
                bail!("index list must not end with a range marker");
            }
            let start = encoded[idx - 1];
            let end = encoded[idx + 1];
            if end <= start + 1 {
                bail!("invalid range {}..{} in index list", start, end);
            }
            if array_size >= 0 && end >= array_size {
                bail!("index {} out of bounds ({})", end, array_size);
            }
            // start was already emitted by the previous iteration
            for i in (start + 1)..=end {
                out.push(i);
            }
            idx += 2;
            continue;
        }
        if v < -1 {
            bail!("invalid negative index {} in index list", v);
        }
        if array_size >= 0 && v >= array_size {
            bail!("index {} out of bounds ({})", v, array_size);
        }
        out.push(v);
        idx += 1;
    }
    Ok(out)
}

/// Compress an index list. Input is sorted and de-duplicated first, so
/// `decode(encode(xs))` is the sorted set of `xs`. Runs of length 3 or
/// more collapse to `head, -1, tail`.
pub fn encode_index_list(indexes: &[i32]) -> Vec<i32> {
    let mut sorted = indexes.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut out: Vec<i32> = Vec::with_capacity(sorted.len());
    let mut i = 0usize;
    while i < sorted.len() {
        let head = sorted[i];
        let mut j = i;
        while j + 1 < sorted.len() && sorted[j + 1] == sorted[j] + 1 {
            j += 1;
        }
        let run_len = j - i + 1;
        out.push(head);
        if run_len > 2 {
            out.push(-1);
            out.push(sorted[j]);
        } else if run_len == 2 {
            out.push(sorted[j]);
        }
        i = j + 1;
    }
    out
}
