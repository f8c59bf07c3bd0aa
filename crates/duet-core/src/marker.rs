//! Marker protocol: sentinel lines in the subprocess stdout.
//!
//! The parser does not build records itself. It emits the same
//! [`TestEvent`]s the socket channel decodes into, so both channels go
//! through one merge path and produce identical records.
//!
//! ```text
//! TEST_ITEM_ID: test-pepe-001
//! DESCRIPTION: NPV of three flows
//! SHARED_INPUT_BEGIN
//! rate: 0.06
//! SHARED_INPUT_END
//! CPP_STDOUT_BEGIN
//! OUTPUT: NPV: 398.67
//! CPP_STDOUT_END
//! MOJO_STDOUT_BEGIN
//! OUTPUT: NPV: 398.68
//! MOJO_STDOUT_END
//! OVERALL_STATUS: FAIL
//! FAIL_REASON: values differ
//! DIFF: 0.01
//! END_OF_TEST_ITEM
//! ```

use tracing::trace;

use crate::model::{DetailedDiff, Verdict, normalize_id};
use crate::wire::{CompilePhase, ResultUpdate, SessionSummary, TestEvent};

/// Prefix stripped from lines inside an output block.
const OUTPUT_PREFIX: &str = "OUTPUT:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MarkerState {
    #[default]
    Idle,
    InTest,
    CollectingInputs,
    CollectingReference,
    CollectingCandidate,
    CollectingSummary,
}

/// Line-oriented state machine over one transcript.
#[derive(Debug, Default)]
pub struct MarkerParser {
    state: MarkerState,
    item: Option<OpenItem>,
    block: Vec<String>,
    summary: SessionSummary,
}

/// Per-item accumulators for fields that may span several lines.
#[derive(Debug)]
struct OpenItem {
    id: String,
    reason: Vec<String>,
    diff: Vec<String>,
    detailed: Vec<DetailedDiff>,
}

impl OpenItem {
    fn new(id: String) -> Self {
        Self {
            id,
            reason: Vec::new(),
            diff: Vec::new(),
            detailed: Vec::new(),
        }
    }

    fn update(&self) -> ResultUpdate {
        ResultUpdate {
            id: self.id.clone(),
            ..ResultUpdate::default()
        }
    }
}

impl MarkerParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MarkerState {
        self.state
    }

    /// Id of the item currently open, if any.
    pub fn current_id(&self) -> Option<&str> {
        self.item.as_ref().map(|item| item.id.as_str())
    }

    /// Parse a whole transcript at once.
    pub fn parse_transcript(text: &str) -> Vec<TestEvent> {
        let mut parser = Self::new();
        let mut events: Vec<TestEvent> = text.lines().flat_map(|line| parser.feed(line)).collect();
        events.extend(parser.finish());
        events
    }

    /// Feed one line (with or without its line ending).
    pub fn feed(&mut self, raw: &str) -> Vec<TestEvent> {
        let line = raw.trim_end_matches(['\r', '\n']);
        let trimmed = line.trim();
        let mut out = Vec::new();

        // Structural sentinels are honoured in every state so a missing
        // `*_END` cannot swallow the rest of the transcript.
        if let Some(id) = value_of(trimmed, "TEST_ITEM_ID:") {
            self.close_item(&mut out);
            let id = normalize_id(id);
            if id.is_empty() {
                trace!("ignoring TEST_ITEM_ID without an id");
                return out;
            }
            out.push(TestEvent::TestStart {
                id: id.clone(),
                description: String::new(),
            });
            self.item = Some(OpenItem::new(id));
            self.state = MarkerState::InTest;
            return out;
        }
        match trimmed {
            "END_OF_TEST_ITEM" => {
                self.close_item(&mut out);
                return out;
            }
            "SHARED_INPUT_BEGIN" => {
                self.open_block(MarkerState::CollectingInputs, &mut out);
                return out;
            }
            "CPP_STDOUT_BEGIN" => {
                self.open_block(MarkerState::CollectingReference, &mut out);
                return out;
            }
            "MOJO_STDOUT_BEGIN" => {
                self.open_block(MarkerState::CollectingCandidate, &mut out);
                return out;
            }
            "RUN_SCRIPT_SUMMARY_BEGIN" => {
                self.close_item(&mut out);
                self.summary = SessionSummary::default();
                self.state = MarkerState::CollectingSummary;
                return out;
            }
            "SHARED_INPUT_END" | "CPP_STDOUT_END" | "MOJO_STDOUT_END" => {
                self.flush_block(&mut out);
                return out;
            }
            "RUN_SCRIPT_SUMMARY_END" => {
                if self.state == MarkerState::CollectingSummary {
                    out.push(TestEvent::SessionEnd(std::mem::take(&mut self.summary)));
                    self.state = MarkerState::Idle;
                }
                return out;
            }
            _ => {}
        }

        match self.state {
            MarkerState::CollectingInputs => {
                if !trimmed.is_empty() {
                    self.block.push(line.to_owned());
                }
            }
            MarkerState::CollectingReference | MarkerState::CollectingCandidate => {
                if let Some(rest) = line.trim_start().strip_prefix(OUTPUT_PREFIX) {
                    self.block.push(rest.strip_prefix(' ').unwrap_or(rest).to_owned());
                } else if !trimmed.is_empty() {
                    self.block.push(line.to_owned());
                }
            }
            MarkerState::CollectingSummary => self.summary_line(trimmed),
            MarkerState::Idle | MarkerState::InTest => {
                let line = line.trim_start();
                if let Some(event) = session_marker(line) {
                    out.push(event);
                } else if let Some(item) = self.item.as_mut() {
                    item_marker(item, line, &mut out);
                } else if !trimmed.is_empty() {
                    trace!(line = trimmed, "preamble");
                }
            }
        }
        out
    }

    /// End of input: flush whatever is still open.
    pub fn finish(&mut self) -> Vec<TestEvent> {
        let mut out = Vec::new();
        if self.state == MarkerState::CollectingSummary {
            trace!("transcript ended inside a summary block");
        }
        self.close_item(&mut out);
        self.state = MarkerState::Idle;
        out
    }

    // -----------------------------------------------------------------------
    // Blocks
    // -----------------------------------------------------------------------

    fn open_block(&mut self, state: MarkerState, out: &mut Vec<TestEvent>) {
        self.flush_block(out);
        if self.item.is_some() {
            self.state = state;
        } else {
            trace!(?state, "block outside a test item");
        }
    }

    fn flush_block(&mut self, out: &mut Vec<TestEvent>) {
        let lines = std::mem::take(&mut self.block);
        let Some(item) = self.item.as_ref() else {
            return;
        };
        let id = item.id.clone();
        match self.state {
            MarkerState::CollectingInputs => out.push(TestEvent::TestInputs { id, inputs: lines }),
            MarkerState::CollectingReference => out.push(TestEvent::TestOutputs {
                id,
                reference: lines,
                candidate: Vec::new(),
            }),
            MarkerState::CollectingCandidate => out.push(TestEvent::TestOutputs {
                id,
                reference: Vec::new(),
                candidate: lines,
            }),
            _ => return,
        }
        self.state = MarkerState::InTest;
    }

    fn close_item(&mut self, out: &mut Vec<TestEvent>) {
        self.flush_block(out);
        self.item = None;
        if self.state != MarkerState::CollectingSummary {
            self.state = MarkerState::Idle;
        }
    }

    fn summary_line(&mut self, line: &str) {
        let lower = line.to_ascii_lowercase();
        if let Some(n) = count_after(&lower, "completed:") {
            self.summary.total = n;
        } else if let Some(n) = count_after(&lower, "passed:") {
            self.summary.passed = n;
        } else if let Some(n) = count_after(&lower, "failed:") {
            self.summary.failed = n;
        } else if let Some(rest) = after(&lower, "time:") {
            if let Ok(secs) = rest.trim_end_matches('s').trim().parse::<f64>() {
                self.summary.duration = secs;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Line classifiers
// ---------------------------------------------------------------------------

fn session_marker(line: &str) -> Option<TestEvent> {
    if let Some(count) = line.strip_prefix("TESTS ") {
        return count
            .trim()
            .parse()
            .ok()
            .map(|test_count| TestEvent::SessionStart { test_count });
    }
    let phases = [
        ("CPP_COMPILE_START:", CompilePhase::ReferenceStart),
        ("CPP_COMPILE_END:", CompilePhase::ReferenceEnd),
        ("MOJO_COMPILE_START:", CompilePhase::CandidateStart),
        ("MOJO_COMPILE_END:", CompilePhase::CandidateEnd),
    ];
    phases.iter().find_map(|(prefix, phase)| {
        value_of(line, prefix).map(|info| TestEvent::Compilation {
            phase: *phase,
            info: info.to_owned(),
        })
    })
}

fn item_marker(item: &mut OpenItem, line: &str, out: &mut Vec<TestEvent>) {
    if let Some(description) = value_of(line, "DESCRIPTION:") {
        out.push(TestEvent::TestStart {
            id: item.id.clone(),
            description: description.to_owned(),
        });
    } else if let Some(status) = value_of(line, "OVERALL_STATUS:").map(str::trim) {
        match Verdict::parse(status) {
            Some(verdict) => out.push(TestEvent::TestResult(ResultUpdate {
                verdict: Some(verdict),
                ..item.update()
            })),
            None => trace!(status, "unrecognised status"),
        }
    } else if let Some(reason) = value_of(line, "FAIL_REASON:") {
        item.reason.push(reason.to_owned());
        out.push(TestEvent::TestResult(ResultUpdate {
            reason: item.reason.join("\n"),
            ..item.update()
        }));
    } else if let Some(diff) = value_of(line, "DIFF:") {
        item.diff.push(diff.to_owned());
        out.push(TestEvent::TestResult(ResultUpdate {
            diff: item.diff.join("\n"),
            ..item.update()
        }));
    } else if let Some(detail) = value_of(line, "DETAILED_DIFF:") {
        item.detailed.push(DetailedDiff::from_text(detail));
        out.push(TestEvent::TestResult(ResultUpdate {
            detailed_diffs: item.detailed.clone(),
            ..item.update()
        }));
    } else if let Some(secs) = value_of(line, "DURATION:").map(str::trim) {
        match secs.trim_end_matches('s').trim_end().parse::<f64>() {
            Ok(secs) => out.push(TestEvent::TestResult(ResultUpdate {
                duration: Some(secs),
                ..item.update()
            })),
            Err(_) => trace!(secs, "unparseable duration"),
        }
    } else if value_of(line, "CPP_EXIT_CODE:").is_some() || value_of(line, "MOJO_EXIT_CODE:").is_some() {
        // Recognised, carries nothing the record keeps.
    } else if !line.trim().is_empty() {
        trace!(id = %item.id, line, "unrecognised marker line");
    }
}

/// Value after a `KEY:` sentinel. Only the single separator space is
/// removed; the rest is kept as the producer wrote it.
fn value_of<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    line.strip_prefix(key).map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
}

fn after<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    line.find(key).map(|at| line[at + key.len()..].trim())
}

fn count_after(line: &str, key: &str) -> Option<usize> {
    after(line, key).and_then(|rest| rest.parse().ok())
}
