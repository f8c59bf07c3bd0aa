//! Per-test result model shared by the socket and marker channels.
//!
//! Every merge helper follows one rule: a field is only overwritten by a
//! non-empty value. That makes repeated and out-of-order updates harmless.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    #[default]
    Pending,
    Running,
    Pass,
    Fail,
}

impl TestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Pass | Self::Fail)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Pass => "pass",
            Self::Fail => "fail",
        }
    }
}

/// Terminal outcome reported by a producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Pass,
    Fail,
}

impl Verdict {
    /// Parse the wire/marker spelling (`PASS`, `FAIL`, case-insensitive).
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PASS" | "PASSED" => Some(Self::Pass),
            "FAIL" | "FAILED" | "ERROR" => Some(Self::Fail),
            _ => None,
        }
    }

    pub fn as_wire(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
        }
    }
}

impl From<Verdict> for TestStatus {
    fn from(v: Verdict) -> Self {
        match v {
            Verdict::Pass => TestStatus::Pass,
            Verdict::Fail => TestStatus::Fail,
        }
    }
}

// ---------------------------------------------------------------------------
// Detailed diffs
// ---------------------------------------------------------------------------

/// One entry of a failed comparison's structured diff.
///
/// Wire names keep the producer vocabulary (`cpp_*` is the reference,
/// `mojo_*` the candidate).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DetailedDiff {
    LineDiff {
        line_num: usize,
        #[serde(rename = "cpp_line", default)]
        reference_line: String,
        #[serde(rename = "mojo_line", default)]
        candidate_line: String,
    },
    LengthDiff {
        #[serde(rename = "cpp_len")]
        reference_len: usize,
        #[serde(rename = "mojo_len")]
        candidate_len: usize,
    },
    GenericDiff {
        #[serde(rename = "cpp_output", default)]
        reference_output: String,
        #[serde(rename = "mojo_output", default)]
        candidate_output: String,
        #[serde(default)]
        summary: String,
    },
}

impl DetailedDiff {
    /// Free-form diff text with no structure.
    pub fn generic(summary: impl Into<String>) -> Self {
        Self::GenericDiff {
            reference_output: String::new(),
            candidate_output: String::new(),
            summary: summary.into(),
        }
    }

    /// Decode one element of a `detailed_diffs` array. Unknown shapes are
    /// kept as a generic diff instead of being dropped.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(text) => Self::from_text(text),
            other => serde_json::from_value(other.clone())
                .unwrap_or_else(|_| Self::generic(other.to_string())),
        }
    }

    /// Decode a `DETAILED_DIFF:` marker payload: a JSON object when it parses
    /// as one, otherwise the trimmed text.
    pub fn from_text(text: &str) -> Self {
        let text = text.trim();
        match serde_json::from_str::<Value>(text) {
            Ok(value @ Value::Object(_)) => Self::from_value(&value),
            _ => Self::generic(text),
        }
    }

    /// One-line rendering for lists and plain-text reports.
    pub fn summary_line(&self) -> String {
        match self {
            Self::LineDiff {
                line_num,
                reference_line,
                candidate_line,
            } => format!("line {line_num}: {reference_line:?} != {candidate_line:?}"),
            Self::LengthDiff {
                reference_len,
                candidate_len,
            } => format!("length: reference {reference_len} lines, candidate {candidate_len} lines"),
            Self::GenericDiff {
                reference_output,
                candidate_output,
                summary,
            } => {
                if reference_output.is_empty() && candidate_output.is_empty() {
                    summary.clone()
                } else {
                    format!("{summary}: {reference_output:?} vs {candidate_output:?}")
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// `inputs` as producers send it: a mapping, a sequence or a bare scalar.
///
/// Only [`Inputs::to_lines`] looks at the variant; everything downstream
/// works on the normalised `label: value` lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Inputs {
    Mapping(serde_json::Map<String, Value>),
    Sequence(Vec<Value>),
    Scalar(Value),
}

impl Default for Inputs {
    fn default() -> Self {
        Self::Scalar(Value::Null)
    }
}

impl Inputs {
    /// Ordered display lines. Multi-line values are split and blank lines
    /// dropped, matching what the marker channel can carry.
    pub fn to_lines(&self) -> Vec<String> {
        let texts: Vec<String> = match self {
            Self::Mapping(map) => map
                .iter()
                .map(|(label, value)| format!("{label}: {}", value_text(value)))
                .collect(),
            Self::Sequence(items) => items.iter().map(value_text).collect(),
            Self::Scalar(value) => vec![value_text(value)],
        };
        texts
            .iter()
            .flat_map(|text| text.lines())
            .filter(|line| !line.trim().is_empty())
            .map(str::to_owned)
            .collect()
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Split a producer's output blob into lines (a trailing newline adds no
/// empty line).
pub fn split_output(text: &str) -> Vec<String> {
    text.lines().map(str::to_owned).collect()
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Normalise a test id so both channels agree on it.
///
/// `test_compare[test-pepe-001]` → `test-pepe-001`;
/// `tests/x.py::test_a` → `test_a`; anything else is only trimmed.
pub fn normalize_id(raw: &str) -> String {
    let raw = raw.trim();
    if let (Some(open), Some(close)) = (raw.find('['), raw.rfind(']')) {
        if open < close {
            let inner = raw[open + 1..close].trim();
            if !inner.is_empty() {
                return inner.to_owned();
            }
        }
    }
    raw.rsplit("::").next().unwrap_or(raw).trim().to_owned()
}

// ---------------------------------------------------------------------------
// TestRecord
// ---------------------------------------------------------------------------

/// Accumulated state of one test case.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct TestRecord {
    pub id: String,
    pub description: String,
    pub status: TestStatus,
    pub inputs: Vec<String>,
    pub reference_output: Vec<String>,
    pub candidate_output: Vec<String>,
    pub fail_reason: String,
    pub diff_summary: String,
    pub detailed_diffs: Vec<DetailedDiff>,
    pub duration: Option<f64>,
}

impl TestRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// A start never demotes a finished record back to running.
    pub fn mark_started(&mut self, description: &str) {
        if self.status == TestStatus::Pending {
            self.status = TestStatus::Running;
        }
        overwrite_text(&mut self.description, description);
    }

    pub fn merge_inputs(&mut self, inputs: &[String]) {
        overwrite_lines(&mut self.inputs, inputs);
    }

    pub fn merge_outputs(&mut self, reference: &[String], candidate: &[String]) {
        overwrite_lines(&mut self.reference_output, reference);
        overwrite_lines(&mut self.candidate_output, candidate);
    }

    pub fn merge_result(&mut self, update: &crate::wire::ResultUpdate) {
        if let Some(verdict) = update.verdict {
            self.status = verdict.into();
        }
        if update.duration.is_some() {
            self.duration = update.duration;
        }
        overwrite_text(&mut self.description, &update.description);
        self.merge_inputs(&update.inputs);
        self.merge_outputs(&update.reference, &update.candidate);
        overwrite_text(&mut self.fail_reason, &update.reason);
        overwrite_text(&mut self.diff_summary, &update.diff);
        if !update.detailed_diffs.is_empty() {
            self.detailed_diffs = update.detailed_diffs.clone();
        }
    }

    /// Whether any of the comparison columns has content.
    pub fn has_details(&self) -> bool {
        !(self.inputs.is_empty()
            && self.reference_output.is_empty()
            && self.candidate_output.is_empty()
            && self.diff_summary.is_empty())
    }
}

fn overwrite_text(slot: &mut String, value: &str) {
    if !value.trim().is_empty() && slot != value {
        *slot = value.to_owned();
    }
}

fn overwrite_lines(slot: &mut Vec<String>, value: &[String]) {
    if !value.is_empty() && slot.as_slice() != value {
        *slot = value.to_vec();
    }
}
