//! Fan-in of per-node worker CSVs.
//!
//! Every node emits a title row, a column header, then data rows whose
//! first column is a numeric PMC. The merge skips titles, keeps the
//! first file's headers, and orders all rows by PMC. Duplicate PMCs are
//! legitimate (separate-detector rows); all of them are kept in node
//! input order.

use anyhow::{bail, Context, Result};

pub fn combine_node_csvs(node_csvs: &[String]) -> Result<String> {
    if node_csvs.is_empty() {
        bail!("no node outputs to combine");
    }

    let mut title = "";
    let mut header = "";
    let mut column_count = 0usize;
    let mut rows: Vec<(i32, &str)> = Vec::new();

    for (node_idx, csv) in node_csvs.iter().enumerate() {
        let mut lines = csv.lines();
        let node_title = lines
            .next()
            .with_context(|| format!("node {} output missing title row", node_idx))?;
        let node_header = lines
            .next()
            .with_context(|| format!("node {} output missing header row", node_idx))?;
        if node_idx == 0 {
            title = node_title;
            header = node_header;
            column_count = header.split(',').count();
        }
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            if line.split(',').count() != column_count {
                bail!("node {} row width differs from header: {}", node_idx, line);
            }
            let pmc_field = line.split(',').next().unwrap_or("").trim();
            let pmc: i32 = pmc_field
                .parse()
                .with_context(|| format!("node {} row has non-numeric PMC: {}", node_idx, line))?;
            rows.push((pmc, line));
        }
    }

    // stable: duplicate PMCs keep node input order
    rows.sort_by_key(|(pmc, _)| *pmc);

    let mut out = String::new();
    out.push_str(title);
    out.push('\n');
    out.push_str(header);
    out.push('\n');
    for (_, line) in rows {
        out.push_str(line);
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(rows: &[&str]) -> String {
        let mut s = String::from("title row\nPMC, Fe_%, livetime\n");
        for r in rows {
            s.push_str(r);
            s.push('\n');
        }
        s
    }

    #[test]
    fn rows_merge_sorted_by_pmc() {
        let nodes = vec![
            node(&["30, 1.0, 9.0", "12, 2.0, 9.0"]),
            node(&["18, 3.0, 9.0"]),
            node(&["3, 4.0, 9.0", "40, 5.0, 9.0"]),
        ];
        let merged = combine_node_csvs(&nodes).unwrap();
        let pmcs: Vec<&str> = merged
            .lines()
            .skip(2)
            .map(|l| l.split(',').next().unwrap())
            .collect();
        assert_eq!(pmcs, vec!["3", "12", "18", "30", "40"]);
        assert!(merged.starts_with("title row\nPMC, Fe_%, livetime\n"));
    }

    #[test]
    fn duplicate_pmcs_keep_all_rows_in_input_order() {
        let nodes = vec![node(&["7, 1.0, 8.0", "7, 2.0, 9.0"])];
        let merged = combine_node_csvs(&nodes).unwrap();
        let rows: Vec<&str> = merged.lines().skip(2).collect();
        assert_eq!(rows, vec!["7, 1.0, 8.0", "7, 2.0, 9.0"]);
    }

    #[test]
    fn second_node_headers_are_dropped() {
        let nodes = vec![node(&["1, 1.0, 9.0"]), node(&["2, 2.0, 9.0"])];
        let merged = combine_node_csvs(&nodes).unwrap();
        assert_eq!(merged.lines().filter(|l| l.starts_with("PMC")).count(), 1);
    }

    #[test]
    fn bad_pmc_or_row_width_fails_the_merge() {
        assert!(combine_node_csvs(&[node(&["abc, 1.0, 9.0"])]).is_err());
        assert!(combine_node_csvs(&[node(&["3, 1.0"])]).is_err());
        assert!(combine_node_csvs(&[]).is_err());
    }
}
