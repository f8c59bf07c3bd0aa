//! Socket wire format and its translation into [`TestEvent`]s.
//!
//! Each message is one line of JSON:
//!
//! ```json
//! {"type": "test_start", "timestamp": 1718000000.5, "data": {"id": "t1", "description": "NPV"}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::DecodeError;
use crate::model::{DetailedDiff, Inputs, Verdict, normalize_id, split_output};

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Envelope of every socket message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default)]
    pub data: Value,
}

impl WireMessage {
    /// Decode one newline-delimited message (surrounding whitespace ignored).
    pub fn decode_line(line: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(line.trim())?)
    }

    /// Encode as a single line terminated by `\n`.
    pub fn encode_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"));
        line.push('\n');
        line
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Compilation phase reported before tests run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompilePhase {
    ReferenceStart,
    ReferenceEnd,
    CandidateStart,
    CandidateEnd,
}

impl CompilePhase {
    pub const ALL: [CompilePhase; 4] = [
        Self::ReferenceStart,
        Self::ReferenceEnd,
        Self::CandidateStart,
        Self::CandidateEnd,
    ];

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "cpp_start" => Some(Self::ReferenceStart),
            "cpp_end" => Some(Self::ReferenceEnd),
            "mojo_start" => Some(Self::CandidateStart),
            "mojo_end" => Some(Self::CandidateEnd),
            _ => None,
        }
    }

    pub fn as_wire(self) -> &'static str {
        match self {
            Self::ReferenceStart => "cpp_start",
            Self::ReferenceEnd => "cpp_end",
            Self::CandidateStart => "mojo_start",
            Self::CandidateEnd => "mojo_end",
        }
    }

    /// Position in the setup sequence, 1-based.
    pub fn ordinal(self) -> u8 {
        match self {
            Self::ReferenceStart => 1,
            Self::ReferenceEnd => 2,
            Self::CandidateStart => 3,
            Self::CandidateEnd => 4,
        }
    }
}

/// Totals a producer reports at the end of a session.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionSummary {
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub passed: usize,
    #[serde(default)]
    pub failed: usize,
    #[serde(default)]
    pub duration: f64,
}

/// Everything a `test_result` can say about a test. Marker amendments reuse
/// it with `verdict: None`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultUpdate {
    pub id: String,
    pub verdict: Option<Verdict>,
    pub duration: Option<f64>,
    pub description: String,
    pub inputs: Vec<String>,
    pub reference: Vec<String>,
    pub candidate: Vec<String>,
    pub reason: String,
    pub diff: String,
    pub detailed_diffs: Vec<DetailedDiff>,
}

/// One record mutation, independent of the channel it arrived on.
#[derive(Debug, Clone, PartialEq)]
pub enum TestEvent {
    SessionStart { test_count: usize },
    TestStart { id: String, description: String },
    TestInputs { id: String, inputs: Vec<String> },
    TestOutputs {
        id: String,
        reference: Vec<String>,
        candidate: Vec<String>,
    },
    TestResult(ResultUpdate),
    SessionEnd(SessionSummary),
    Compilation { phase: CompilePhase, info: String },
}

impl TestEvent {
    /// Id of the test this event touches, if any.
    pub fn test_id(&self) -> Option<&str> {
        match self {
            Self::TestStart { id, .. }
            | Self::TestInputs { id, .. }
            | Self::TestOutputs { id, .. } => Some(id),
            Self::TestResult(update) => Some(&update.id),
            Self::SessionStart { .. } | Self::SessionEnd(_) | Self::Compilation { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionStart { .. } => "session_start",
            Self::TestStart { .. } => "test_start",
            Self::TestInputs { .. } => "test_inputs",
            Self::TestOutputs { .. } => "test_outputs",
            Self::TestResult(_) => "test_result",
            Self::SessionEnd(_) => "session_end",
            Self::Compilation { .. } => "compilation_status",
        }
    }

    pub fn from_wire(msg: &WireMessage) -> Result<Self, DecodeError> {
        Self::decode(&msg.kind, &msg.data)
    }

    /// Translate a `(type, data)` pair. Ids are normalised here so every
    /// consumer sees the same key.
    pub fn decode(kind: &str, data: &Value) -> Result<Self, DecodeError> {
        match kind {
            "session_start" => {
                let d: SessionStartData = payload(kind, data)?;
                Ok(Self::SessionStart {
                    test_count: d.test_count,
                })
            }
            "test_start" => {
                let d: TestStartData = payload(kind, data)?;
                Ok(Self::TestStart {
                    id: require_id(kind, &d.id)?,
                    description: d.description.unwrap_or_default(),
                })
            }
            "test_inputs" => {
                let d: TestInputsData = payload(kind, data)?;
                Ok(Self::TestInputs {
                    id: require_id(kind, &d.id)?,
                    inputs: d.inputs.to_lines(),
                })
            }
            "test_outputs" => {
                let d: TestOutputsData = payload(kind, data)?;
                Ok(Self::TestOutputs {
                    id: require_id(kind, &d.id)?,
                    reference: d.cpp_output.map(OutputText::into_lines).unwrap_or_default(),
                    candidate: d.mojo_output.map(OutputText::into_lines).unwrap_or_default(),
                })
            }
            "test_result" => {
                let d: TestResultData = payload(kind, data)?;
                // No status is an amendment; a status we cannot read is an error.
                let verdict = match d.status.as_deref().map(str::trim) {
                    None | Some("") => None,
                    Some(raw) => Some(Verdict::parse(raw).ok_or_else(|| DecodeError::InvalidField {
                        field: "status",
                        value: raw.to_owned(),
                    })?),
                };
                Ok(Self::TestResult(ResultUpdate {
                    id: require_id(kind, &d.id)?,
                    verdict,
                    duration: d.duration,
                    description: d.description.unwrap_or_default(),
                    inputs: d.inputs.map(|i| i.to_lines()).unwrap_or_default(),
                    reference: d.cpp_output.map(OutputText::into_lines).unwrap_or_default(),
                    candidate: d.mojo_output.map(OutputText::into_lines).unwrap_or_default(),
                    reason: d.reason.unwrap_or_default(),
                    diff: d.diff.unwrap_or_default(),
                    detailed_diffs: d
                        .detailed_diffs
                        .unwrap_or_default()
                        .iter()
                        .map(DetailedDiff::from_value)
                        .collect(),
                }))
            }
            "session_end" => Ok(Self::SessionEnd(payload(kind, data)?)),
            "compilation_status" => {
                let d: CompilationData = payload(kind, data)?;
                let phase = CompilePhase::parse(&d.phase).ok_or_else(|| DecodeError::InvalidField {
                    field: "phase",
                    value: d.phase.clone(),
                })?;
                Ok(Self::Compilation {
                    phase,
                    info: d.info.unwrap_or_default(),
                })
            }
            other => Err(DecodeError::UnknownType(other.to_owned())),
        }
    }

    /// Encode for the socket channel.
    pub fn to_wire(&self, timestamp: f64) -> WireMessage {
        let data = match self {
            Self::SessionStart { test_count } => json!({ "test_count": test_count }),
            Self::TestStart { id, description } => json!({ "id": id, "description": description }),
            Self::TestInputs { id, inputs } => json!({ "id": id, "inputs": inputs }),
            Self::TestOutputs {
                id,
                reference,
                candidate,
            } => json!({
                "id": id,
                "cpp_output": reference.join("\n"),
                "mojo_output": candidate.join("\n"),
            }),
            Self::TestResult(u) => {
                let mut data = json!({
                    "id": u.id,
                    "duration": u.duration,
                    "description": u.description,
                    "cpp_output": u.reference.join("\n"),
                    "mojo_output": u.candidate.join("\n"),
                    "inputs": u.inputs,
                });
                if let Some(verdict) = u.verdict {
                    data["status"] = json!(verdict.as_wire());
                }
                if !u.reason.is_empty() {
                    data["reason"] = json!(u.reason);
                }
                if !u.diff.is_empty() {
                    data["diff"] = json!(u.diff);
                }
                if !u.detailed_diffs.is_empty() {
                    data["detailed_diffs"] = json!(u.detailed_diffs);
                }
                data
            }
            Self::SessionEnd(summary) => json!(summary),
            Self::Compilation { phase, info } => json!({ "phase": phase.as_wire(), "info": info }),
        };
        WireMessage {
            kind: self.kind().to_owned(),
            timestamp,
            data,
        }
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SessionStartData {
    #[serde(default)]
    test_count: usize,
}

#[derive(Debug, Deserialize)]
struct TestStartData {
    #[serde(default)]
    id: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TestInputsData {
    #[serde(default)]
    id: String,
    #[serde(default)]
    inputs: Inputs,
}

#[derive(Debug, Deserialize)]
struct TestOutputsData {
    #[serde(default)]
    id: String,
    #[serde(default)]
    cpp_output: Option<OutputText>,
    #[serde(default)]
    mojo_output: Option<OutputText>,
}

#[derive(Debug, Deserialize)]
struct TestResultData {
    #[serde(default)]
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    cpp_output: Option<OutputText>,
    #[serde(default)]
    mojo_output: Option<OutputText>,
    #[serde(default)]
    inputs: Option<Inputs>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    diff: Option<String>,
    #[serde(default)]
    detailed_diffs: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct CompilationData {
    #[serde(default)]
    phase: String,
    #[serde(default)]
    info: Option<String>,
}

/// Output is normally one text blob but some producers send a line list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OutputText {
    Text(String),
    Lines(Vec<String>),
}

impl OutputText {
    fn into_lines(self) -> Vec<String> {
        match self {
            Self::Text(text) => split_output(&text),
            Self::Lines(lines) => lines,
        }
    }
}

fn payload<T: serde::de::DeserializeOwned>(kind: &str, data: &Value) -> Result<T, DecodeError> {
    let data = if data.is_null() { json!({}) } else { data.clone() };
    serde_json::from_value(data).map_err(|source| DecodeError::Payload {
        kind: kind.to_owned(),
        source,
    })
}

fn require_id(kind: &str, raw: &str) -> Result<String, DecodeError> {
    let id = normalize_id(raw);
    if id.is_empty() {
        return Err(DecodeError::MissingId {
            kind: kind.to_owned(),
        });
    }
    Ok(id)
}
