//! Text building blocks shared by the TUI and the plain-text report.

use duet_core::{CompilePhase, Session, TestRecord, TestStatus};

/// Status indicator symbols used across TUI and report output.
pub const INDICATOR_PASS: &str = "✔";
pub const INDICATOR_FAIL: &str = "✖";
pub const INDICATOR_RUNNING: &str = "●";
pub const INDICATOR_PENDING: &str = "○";

/// Map a record status to its indicator symbol.
pub fn status_indicator(status: TestStatus) -> &'static str {
    match status {
        TestStatus::Pass => INDICATOR_PASS,
        TestStatus::Fail => INDICATOR_FAIL,
        TestStatus::Running => INDICATOR_RUNNING,
        TestStatus::Pending => INDICATOR_PENDING,
    }
}

/// `✔ PASS case-001  description (0.12s)`
pub fn banner(record: &TestRecord) -> String {
    let mut line = format!(
        "{} {} {}",
        status_indicator(record.status),
        record.status.as_str().to_ascii_uppercase(),
        record.id
    );
    if !record.description.is_empty() {
        line.push_str("  ");
        line.push_str(&record.description);
    }
    if let Some(secs) = record.duration {
        line.push_str(&format!(" ({secs:.2}s)"));
    }
    line
}

pub const TABLE_HEADER: [&str; 4] = ["Inputs", "Reference", "Candidate", "Diff"];

/// Rows of the inputs/reference/candidate/diff table, padded with empty
/// cells. `None` when all four columns are empty.
pub fn detail_rows(record: &TestRecord) -> Option<Vec<[String; 4]>> {
    if !record.has_details() {
        return None;
    }
    let diff: Vec<&str> = record.diff_summary.lines().collect();
    let height = record
        .inputs
        .len()
        .max(record.reference_output.len())
        .max(record.candidate_output.len())
        .max(diff.len());
    let cell = |column: &[String], i: usize| column.get(i).cloned().unwrap_or_default();
    let rows = (0..height)
        .map(|i| {
            [
                cell(&record.inputs, i),
                cell(&record.reference_output, i),
                cell(&record.candidate_output, i),
                diff.get(i).map(|s| (*s).to_owned()).unwrap_or_default(),
            ]
        })
        .collect();
    Some(rows)
}

/// Detailed diff lines, shown only for an expanded failure.
pub fn detailed_diff_lines(record: &TestRecord, expanded: bool) -> Vec<String> {
    if !expanded || record.status != TestStatus::Fail {
        return Vec::new();
    }
    record
        .detailed_diffs
        .iter()
        .enumerate()
        .map(|(i, diff)| format!("{:>3}. {}", i + 1, diff.summary_line()))
        .collect()
}

/// Whether a record has a detailed section to expand.
pub fn expandable(record: &TestRecord) -> bool {
    record.status == TestStatus::Fail && !record.detailed_diffs.is_empty()
}

fn phase_label(phase: CompilePhase) -> &'static str {
    match phase {
        CompilePhase::ReferenceStart => "compiling reference",
        CompilePhase::ReferenceEnd => "reference compiled",
        CompilePhase::CandidateStart => "compiling candidate",
        CompilePhase::CandidateEnd => "candidate compiled",
    }
}

/// Latest compilation phase, e.g. `compiling reference: g++ -O2`.
pub fn compile_label(session: &Session) -> Option<String> {
    let (phase, info) = session.state().compilation.as_ref()?;
    let label = phase_label(*phase);
    Some(if info.is_empty() {
        label.to_owned()
    } else {
        format!("{label}: {info}")
    })
}

/// `3/10 done  2 passed  1 failed`
pub fn progress_label(session: &Session) -> String {
    let tally = session.tally();
    let total = session
        .state()
        .test_count
        .map(|n| n.to_string())
        .unwrap_or_else(|| "?".to_owned());
    format!(
        "{}/{} done  {} passed  {} failed",
        tally.completed, total, tally.passed, tally.failed
    )
}
