use std::collections::BTreeMap;
use std::fmt::Write;

use serde::Serialize;

use crate::table::Table;

/// Format styles for the run summary.
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    Human,
    Json,
}

/// Aggregated view of one selection audit table.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SelectionSummary {
    pub total: usize,
    pub selected: usize,
    pub excluded: usize,
    pub reason_counts: Vec<ReasonCount>,
}

/// How many rows failed a given rule (a row can appear under several rules).
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ReasonCount {
    pub reason: String,
    pub count: usize,
}

/// Fold an audit table into totals and a per-reason exclusion histogram,
/// ordered by count descending, then reason name.
pub fn summarize_audit(audit: &Table) -> SelectionSummary {
    let mut selected = 0;
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();

    for idx in 0..audit.len() {
        if audit.cell(idx, "selected") == Some("true") {
            selected += 1;
            continue;
        }
        let reasons = audit.cell(idx, "reasons").unwrap_or("");
        for reason in reasons.split(';').filter(|r| !r.is_empty()) {
            *counts.entry(reason.to_string()).or_insert(0) += 1;
        }
    }

    let mut reason_counts: Vec<ReasonCount> = counts
        .into_iter()
        .map(|(reason, count)| ReasonCount { reason, count })
        .collect();
    reason_counts.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.reason.cmp(&b.reason)));

    SelectionSummary {
        total: audit.len(),
        selected,
        excluded: audit.len() - selected,
        reason_counts,
    }
}

/// Produce a summary string in the desired format.
pub fn render_summary(summary: &SelectionSummary, format: OutputFormat) -> anyhow::Result<String> {
    match format {
        OutputFormat::Human => render_human(summary),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(summary)?),
    }
}

fn render_human(summary: &SelectionSummary) -> anyhow::Result<String> {
    let mut out = String::new();
    writeln!(
        out,
        "Selected {} of {} candidate pairs ({} excluded)",
        summary.selected, summary.total, summary.excluded
    )?;
    if summary.reason_counts.is_empty() {
        writeln!(out, "No exclusion reasons recorded.")?;
    } else {
        writeln!(out, "Exclusion reasons:")?;
        for entry in &summary.reason_counts {
            writeln!(
                out,
                "  - {reason:<36} {count:>5}",
                reason = entry.reason,
                count = entry.count
            )?;
        }
    }
    Ok(out)
}
