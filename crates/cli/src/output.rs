//! Plain-text tables for terminal output.

use queuectl_core::{Job, WorkerId};
use queuectl_infra::jobs::JobSummary;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Render rows under headers with space-padded columns.
pub fn table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if let Some(w) = widths.get_mut(i) {
                *w = (*w).max(cell.chars().count());
            }
        }
    }

    let mut out = String::new();
    let header: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
    for row in std::iter::once(&header).chain(rows) {
        let line: Vec<String> = row
            .iter()
            .zip(&widths)
            .map(|(cell, w)| format!("{cell:<w$}"))
            .collect();
        out.push_str(line.join("  ").trim_end());
        out.push('\n');
    }
    out
}

pub fn jobs_table(jobs: &[Job]) -> String {
    let rows: Vec<Vec<String>> = jobs
        .iter()
        .map(|j| {
            vec![
                j.id.to_string(),
                j.state.to_string(),
                j.attempts.to_string(),
                j.command.clone(),
                j.updated_at.format(TIME_FORMAT).to_string(),
            ]
        })
        .collect();
    table(&["ID", "STATE", "ATTEMPTS", "COMMAND", "UPDATED"], &rows)
}

pub fn dlq_table(jobs: &[Job]) -> String {
    let rows: Vec<Vec<String>> = jobs
        .iter()
        .map(|j| {
            vec![
                j.id.to_string(),
                j.attempts.to_string(),
                j.command.clone(),
                j.last_error.clone().unwrap_or_default(),
                j.updated_at.format(TIME_FORMAT).to_string(),
            ]
        })
        .collect();
    table(&["ID", "ATTEMPTS", "COMMAND", "LAST ERROR", "UPDATED"], &rows)
}

pub fn status(summary: &JobSummary, workers: &[WorkerId]) -> String {
    let mut rows: Vec<Vec<String>> = summary
        .iter()
        .map(|(state, n)| vec![state.to_string(), n.to_string()])
        .collect();
    rows.push(vec!["total".to_string(), summary.total().to_string()]);

    let mut out = table(&["STATE", "JOBS"], &rows);
    out.push('\n');
    if workers.is_empty() {
        out.push_str("Active workers: none\n");
    } else {
        let ids: Vec<&str> = workers.iter().map(WorkerId::as_str).collect();
        out.push_str(&format!("Active workers: {}\n", ids.join(", ")));
    }
    out
}
