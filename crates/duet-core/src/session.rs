//! One run's worth of state: records keyed by id, session tallies, channel
//! trust and progress.
//!
//! A [`Session`] is owned by the render loop and is the only thing that
//! mutates records. Socket and marker events reach it already decoded.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::model::{TestRecord, TestStatus};
use crate::wire::{CompilePhase, SessionSummary, TestEvent};

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Records in first-seen order with an id index.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    records: Vec<TestRecord>,
    index: HashMap<String, usize>,
}

/// Completed / passed / failed counts over a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tally {
    pub completed: usize,
    pub passed: usize,
    pub failed: usize,
}

impl Registry {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&TestRecord> {
        self.index.get(id).map(|&i| &self.records[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &TestRecord> {
        self.records.iter()
    }

    pub fn as_slice(&self) -> &[TestRecord] {
        &self.records
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.index.clear();
    }

    /// Record for `id`, created on first reference.
    pub fn entry(&mut self, id: &str) -> &mut TestRecord {
        let i = match self.index.get(id) {
            Some(&i) => i,
            None => {
                self.records.push(TestRecord::new(id));
                let i = self.records.len() - 1;
                self.index.insert(id.to_owned(), i);
                i
            }
        };
        &mut self.records[i]
    }

    /// Merge one test-level event. Session-level events are ignored here.
    pub fn apply(&mut self, event: &TestEvent) {
        let Some(id) = event.test_id() else {
            return;
        };
        if !self.index.contains_key(id) && !matches!(event, TestEvent::TestStart { .. }) {
            debug!(id, kind = event.kind(), "event before test_start, creating record");
        }
        let record = self.entry(id);
        match event {
            TestEvent::TestStart { description, .. } => record.mark_started(description),
            TestEvent::TestInputs { inputs, .. } => record.merge_inputs(inputs),
            TestEvent::TestOutputs {
                reference,
                candidate,
                ..
            } => record.merge_outputs(reference, candidate),
            TestEvent::TestResult(update) => record.merge_result(update),
            TestEvent::SessionStart { .. } | TestEvent::SessionEnd(_) | TestEvent::Compilation { .. } => {}
        }
    }

    pub fn tally(&self) -> Tally {
        self.records.iter().fold(Tally::default(), |mut t, r| {
            match r.status {
                TestStatus::Pass => t.passed += 1,
                TestStatus::Fail => t.failed += 1,
                TestStatus::Pending | TestStatus::Running => return t,
            }
            t.completed += 1;
            t
        })
    }
}

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// Session-level facts, from `session_start` to `session_end`.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub test_count: Option<usize>,
    pub tally: Tally,
    pub started_at: Option<DateTime<Utc>>,
    pub duration: Option<f64>,
    pub ended: bool,
    /// Totals as the producer reported them at `session_end`.
    pub reported: Option<SessionSummary>,
    /// Latest compilation phase and its info text.
    pub compilation: Option<(CompilePhase, String)>,
}

impl SessionState {
    fn apply(&mut self, event: &TestEvent) {
        match event {
            TestEvent::SessionStart { test_count } => {
                self.test_count = Some(*test_count);
                self.started_at.get_or_insert_with(Utc::now);
            }
            TestEvent::SessionEnd(summary) => {
                self.ended = true;
                self.duration = Some(summary.duration);
                self.reported = Some(*summary);
                if self.test_count.is_none() {
                    self.test_count = Some(summary.total);
                }
            }
            TestEvent::Compilation { phase, info } => {
                let newer = self
                    .compilation
                    .as_ref()
                    .is_none_or(|(seen, _)| phase.ordinal() >= seen.ordinal());
                if newer {
                    self.compilation = Some((*phase, info.clone()));
                }
            }
            _ => {}
        }
    }

    /// Seconds since the run started, or the reported duration once ended.
    pub fn elapsed(&self, now: DateTime<Utc>) -> f64 {
        if let (true, Some(duration)) = (self.ended, self.duration) {
            return duration;
        }
        self.started_at
            .map(|t| (now - t).num_milliseconds().max(0) as f64 / 1000.0)
            .unwrap_or(0.0)
    }
}

// ---------------------------------------------------------------------------
// ChannelTrust
// ---------------------------------------------------------------------------

/// Which channel owns the record set for this session.
///
/// Starts untrusted (markers authoritative) and flips exactly once, on the
/// first socket message that decodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelTrust(bool);

impl ChannelTrust {
    pub fn is_socket_trusted(self) -> bool {
        self.0
    }

    /// Returns true when this call flipped the flag.
    pub fn trust_socket(&mut self) -> bool {
        !std::mem::replace(&mut self.0, true)
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Share of the bar reserved for compilation when it is reported.
pub const SETUP_SHARE: u8 = 20;
/// Highest value before `session_end`.
const RUNNING_CAP: u8 = 99;

/// Percentage that never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress(u8);

impl Progress {
    pub fn value(self) -> u8 {
        self.0
    }

    /// Recompute from `state` and keep the larger value.
    pub fn observe(&mut self, state: &SessionState) -> u8 {
        self.0 = self.0.max(Self::compute(state));
        self.0
    }

    fn compute(state: &SessionState) -> u8 {
        if state.ended {
            return 100;
        }
        let (setup, base) = match &state.compilation {
            Some((phase, _)) => (phase.ordinal() * (SETUP_SHARE / 4), SETUP_SHARE),
            None => (0, 0),
        };
        let tests = match state.test_count {
            Some(total) if total > 0 && state.tally.completed > 0 => {
                let done = state.tally.completed.min(total);
                let span = usize::from(RUNNING_CAP - base);
                usize::from(base) + done * span / total
            }
            _ => 0,
        };
        let value = usize::from(setup).max(tests).min(usize::from(RUNNING_CAP));
        u8::try_from(value).unwrap_or(RUNNING_CAP)
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Everything one run accumulates. Replaced wholesale by [`Session::reset`].
#[derive(Debug, Default)]
pub struct Session {
    state: SessionState,
    trust: ChannelTrust,
    socket: Registry,
    marker: Registry,
    progress: Progress,
    socket_messages: usize,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything and start a new run.
    pub fn reset(&mut self) {
        *self = Self::default();
        self.state.started_at = Some(Utc::now());
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn trust(&self) -> ChannelTrust {
        self.trust
    }

    pub fn progress(&self) -> u8 {
        self.progress.value()
    }

    /// Number of socket messages accepted this session.
    pub fn socket_messages(&self) -> usize {
        self.socket_messages
    }

    /// The authoritative record set.
    pub fn records(&self) -> &Registry {
        if self.trust.is_socket_trusted() {
            &self.socket
        } else {
            &self.marker
        }
    }

    pub fn tally(&self) -> Tally {
        self.state.tally
    }

    /// Apply a decoded socket event. The first one makes the socket
    /// authoritative and discards marker-derived data.
    pub fn apply_socket(&mut self, event: &TestEvent) {
        if self.trust.trust_socket() {
            info!(discarded = self.marker.len(), "socket channel active, dropping marker records");
            self.marker.clear();
            let started_at = self.state.started_at;
            self.state = SessionState {
                started_at,
                ..SessionState::default()
            };
        }
        self.socket_messages += 1;
        self.socket.apply(event);
        self.state.apply(event);
        self.refresh();
    }

    /// Apply a marker-derived event. Returns false when the socket already
    /// owns this session and the event was dropped.
    pub fn apply_marker(&mut self, event: &TestEvent) -> bool {
        if self.trust.is_socket_trusted() {
            return false;
        }
        self.marker.apply(event);
        self.state.apply(event);
        self.refresh();
        true
    }

    fn refresh(&mut self) {
        self.state.tally = self.records().tally();
        self.progress.observe(&self.state);
    }
}
