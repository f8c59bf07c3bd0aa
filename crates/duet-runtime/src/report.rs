//! Plain-text report for headless runs and replays.

use std::fmt::Write as _;

use chrono::Utc;

use crate::app::{App, Outcome};
use crate::display::{banner, compile_label, detail_rows, detailed_diff_lines, progress_label, TABLE_HEADER};

/// Widest a table cell is printed before truncation.
const MAX_CELL: usize = 40;

fn clip(cell: &str) -> String {
    if cell.chars().count() <= MAX_CELL {
        return cell.to_owned();
    }
    let mut out: String = cell.chars().take(MAX_CELL - 1).collect();
    out.push('…');
    out
}

fn write_table(out: &mut String, rows: &[[String; 4]]) {
    let mut widths = TABLE_HEADER.map(|h| h.chars().count());
    for row in rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(clip(cell).chars().count());
        }
    }
    let mut line = |cells: [&str; 4]| {
        out.push_str("    ");
        let text: Vec<String> = cells
            .iter()
            .zip(widths)
            .map(|(cell, w)| format!("{:<w$}", clip(cell)))
            .collect();
        out.push_str(text.join(" | ").trim_end());
        out.push('\n');
    };
    line(TABLE_HEADER);
    for row in rows {
        line([row[0].as_str(), row[1].as_str(), row[2].as_str(), row[3].as_str()]);
    }
}

/// Render every record and the run summary.
pub fn render(app: &App) -> String {
    let mut out = String::new();
    if !app.title().is_empty() {
        let _ = writeln!(out, "== {} ==", app.title());
    }
    if let Some(label) = compile_label(app.session()) {
        let _ = writeln!(out, "{label}");
    }

    for record in app.records() {
        let _ = writeln!(out, "{}", banner(record));
        if !record.fail_reason.is_empty() {
            let _ = writeln!(out, "    reason: {}", record.fail_reason);
        }
        if let Some(rows) = detail_rows(record) {
            write_table(&mut out, &rows);
        }
        for diff in detailed_diff_lines(record, true) {
            let _ = writeln!(out, "    {diff}");
        }
    }

    let elapsed = app.session().state().elapsed(Utc::now());
    let _ = writeln!(out, "{}  in {elapsed:.2}s", progress_label(app.session()));
    match app.outcome() {
        Some(Outcome::Passed) => out.push_str("result: PASS\n"),
        Some(Outcome::Failed) if app.records().is_empty() => out.push_str("result: FAIL (no test records)\n"),
        Some(Outcome::Failed) => out.push_str("result: FAIL\n"),
        Some(Outcome::Fatal(msg)) => {
            let _ = writeln!(out, "result: ERROR ({msg})");
        }
        None => out.push_str("result: still running\n"),
    }
    out
}
