//! Run state owned by the render loop.
//!
//! The listener thread and the subprocess pump only send events; [`App`] is
//! the single place where the session is mutated.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use duet_core::{EventRouter, Session, TestRecord};
use tracing::{debug, error, info, warn};

use crate::discovery::Script;
use crate::listener::ListenerEvent;
use crate::process::{RunEvent, RunOutput};

/// How long to keep draining socket events after the subprocess exited while
/// a producer connection is still open.
pub const SETTLE_WINDOW: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Scripts,
    Results,
}

/// How a finished run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    Failed,
    Fatal(String),
}

impl Outcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Passed => 0,
            Self::Failed => 1,
            Self::Fatal(_) => 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingExit {
    exit_code: Option<i32>,
    deadline: Instant,
}

pub struct App {
    session: Session,
    router: EventRouter,
    run_id: u64,
    running: bool,
    title: String,
    fatal: Option<String>,
    pending_exit: Option<PendingExit>,
    socket_peer: Option<SocketAddr>,

    pub view: View,
    pub scripts: Vec<Script>,
    pub script_selected: usize,
    pub selected: usize,
    pub expanded: bool,
    pub should_quit: bool,
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

impl App {
    pub fn new() -> Self {
        Self {
            session: Session::new(),
            router: EventRouter::new(),
            run_id: 0,
            running: false,
            title: String::new(),
            fatal: None,
            pending_exit: None,
            socket_peer: None,
            view: View::Results,
            scripts: Vec::new(),
            script_selected: 0,
            selected: 0,
            expanded: false,
            should_quit: false,
        }
    }

    /// Start with the script browser.
    pub fn with_scripts(scripts: Vec<Script>) -> Self {
        Self {
            scripts,
            view: View::Scripts,
            ..Self::new()
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn records(&self) -> &[TestRecord] {
        self.session.records().as_slice()
    }

    pub fn selected_record(&self) -> Option<&TestRecord> {
        self.records().get(self.selected)
    }

    pub fn selected_script(&self) -> Option<&Script> {
        self.scripts.get(self.script_selected)
    }

    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn fatal(&self) -> Option<&str> {
        self.fatal.as_deref()
    }

    pub fn socket_peer(&self) -> Option<SocketAddr> {
        self.socket_peer
    }

    /// `None` while a run is in flight.
    pub fn outcome(&self) -> Option<Outcome> {
        if self.running {
            return None;
        }
        if let Some(fatal) = &self.fatal {
            return Some(Outcome::Fatal(fatal.clone()));
        }
        let tally = self.session.tally();
        if self.records().is_empty() || tally.failed > 0 || tally.completed < self.records().len() {
            Some(Outcome::Failed)
        } else {
            Some(Outcome::Passed)
        }
    }

    // -----------------------------------------------------------------------
    // Run lifecycle
    // -----------------------------------------------------------------------

    /// Reset the session for a new run and return its generation.
    pub fn begin_run(&mut self, title: impl Into<String>) -> u64 {
        self.run_id += 1;
        self.session.reset();
        self.router.reset();
        self.running = true;
        self.title = title.into();
        self.fatal = None;
        self.pending_exit = None;
        self.socket_peer = None;
        self.selected = 0;
        self.expanded = false;
        self.view = View::Results;
        info!(run = self.run_id, title = %self.title, "run started");
        self.run_id
    }

    /// The run could not start at all.
    pub fn fail_run(&mut self, message: impl Into<String>) {
        let message = message.into();
        error!(run = self.run_id, error = %message, "run failed");
        self.fatal = Some(message);
        self.running = false;
        self.pending_exit = None;
    }

    pub fn handle_run_event(&mut self, event: RunEvent, now: Instant) {
        match event {
            RunEvent::Line { run, line } => {
                if run != self.run_id {
                    return;
                }
                self.router.consume_raw_line(&mut self.session, &line);
            }
            RunEvent::Finished { run, result } => {
                if run != self.run_id {
                    debug!(run, current = self.run_id, "ignoring exit of stale run");
                    return;
                }
                match result {
                    Ok(RunOutput { exit_code, .. }) => self.process_exited(exit_code, now),
                    Err(err) => self.fail_run(err.to_string()),
                }
            }
        }
    }

    fn process_exited(&mut self, exit_code: Option<i32>, now: Instant) {
        if self.socket_peer.is_some() {
            debug!(run = self.run_id, "process exited, settling socket");
            self.pending_exit = Some(PendingExit {
                exit_code,
                deadline: now + SETTLE_WINDOW,
            });
        } else {
            self.finish_run(exit_code);
        }
    }

    fn finish_run(&mut self, exit_code: Option<i32>) {
        self.pending_exit = None;
        if !self.running {
            return;
        }
        self.running = false;
        if let Err(err) = self.router.finish(&mut self.session, exit_code) {
            error!(run = self.run_id, error = %err, "run failed");
            self.fatal = Some(err.to_string());
            return;
        }
        let tally = self.session.tally();
        info!(
            run = self.run_id,
            code = ?exit_code,
            records = self.records().len(),
            passed = tally.passed,
            failed = tally.failed,
            "run finished"
        );
        self.clamp_selection();
    }

    /// Close out a settling run once its window has passed.
    pub fn tick(&mut self, now: Instant) {
        if let Some(pending) = self.pending_exit {
            if now >= pending.deadline {
                self.finish_run(pending.exit_code);
            }
        }
    }

    pub fn handle_listener_event(&mut self, event: ListenerEvent) {
        match event {
            ListenerEvent::Connected { peer } => {
                info!(%peer, "producer connected");
                self.socket_peer = Some(peer);
            }
            ListenerEvent::Message { peer, message } => {
                // Only the producer that connected during this run may speak.
                if self.socket_peer != Some(peer) {
                    warn!(%peer, kind = %message.kind, run = self.run_id, "dropping message from a stale producer");
                    return;
                }
                if let Err(err) = self.router.consume_wire(&mut self.session, &message) {
                    warn!(%peer, kind = %message.kind, error = %err, "dropping socket message");
                }
            }
            ListenerEvent::Rejected { peer } => {
                warn!(%peer, "producer rejected, another one is connected");
            }
            ListenerEvent::Disconnected { peer } => {
                debug!(%peer, "producer disconnected");
                if self.socket_peer == Some(peer) {
                    self.socket_peer = None;
                    if let Some(pending) = self.pending_exit {
                        self.finish_run(pending.exit_code);
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Navigation
    // -----------------------------------------------------------------------

    fn list_len(&self) -> usize {
        match self.view {
            View::Scripts => self.scripts.len(),
            View::Results => self.records().len(),
        }
    }

    fn cursor(&mut self) -> &mut usize {
        match self.view {
            View::Scripts => &mut self.script_selected,
            View::Results => &mut self.selected,
        }
    }

    /// Move selection down (j / Down).
    pub fn next(&mut self) {
        let len = self.list_len();
        if len > 0 {
            let cursor = self.cursor();
            *cursor = (*cursor + 1).min(len - 1);
        }
    }

    /// Move selection up (k / Up).
    pub fn previous(&mut self) {
        let cursor = self.cursor();
        *cursor = cursor.saturating_sub(1);
    }

    pub fn toggle_expanded(&mut self) {
        self.expanded = !self.expanded;
    }

    /// Switch between the script browser and the results, when there are
    /// scripts to browse.
    pub fn toggle_view(&mut self) {
        if self.scripts.is_empty() {
            return;
        }
        self.view = match self.view {
            View::Scripts => View::Results,
            View::Results => View::Scripts,
        };
    }

    /// Keep the record cursor inside the list after it changed.
    pub fn clamp_selection(&mut self) {
        let len = self.records().len();
        if len == 0 {
            self.selected = 0;
        } else if self.selected >= len {
            self.selected = len - 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duet_core::{TestEvent, TestStatus, WireMessage};
    use serde_json::json;
    use std::path::PathBuf;

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn line(run: u64, text: &str) -> RunEvent {
        RunEvent::Line {
            run,
            line: text.to_owned(),
        }
    }

    fn exited(run: u64, code: Option<i32>) -> RunEvent {
        RunEvent::Finished {
            run,
            result: Ok(RunOutput {
                exit_code: code,
                transcript: String::new(),
            }),
        }
    }

    fn message(kind: &str, data: serde_json::Value) -> ListenerEvent {
        ListenerEvent::Message {
            peer: peer(),
            message: WireMessage {
                kind: kind.to_owned(),
                timestamp: 0.0,
                data,
            },
        }
    }

    fn script(name: &str) -> Script {
        Script {
            category: "cashflows".into(),
            path: PathBuf::from(format!("ql/cashflows/tests/{name}")),
        }
    }

    // -----------------------------------------------------------------------
    // Run lifecycle
    // -----------------------------------------------------------------------

    #[test]
    fn marker_run_finishes_on_exit() {
        let mut app = App::new();
        let run = app.begin_run("run_tests.sh");
        let now = Instant::now();
        app.handle_run_event(line(run, "TEST_ITEM_ID: t3"), now);
        app.handle_run_event(line(run, "OVERALL_STATUS: PASS"), now);
        assert!(app.is_running());
        assert_eq!(app.outcome(), None);

        app.handle_run_event(exited(run, Some(0)), now);
        assert!(!app.is_running());
        assert_eq!(app.records().len(), 1);
        assert_eq!(app.records()[0].status, TestStatus::Pass);
        assert_eq!(app.outcome(), Some(Outcome::Passed));
    }

    #[test]
    fn stale_run_events_are_ignored() {
        let mut app = App::new();
        let old = app.begin_run("first");
        let new = app.begin_run("second");
        let now = Instant::now();
        app.handle_run_event(line(old, "TEST_ITEM_ID: stale"), now);
        app.handle_run_event(exited(old, Some(0)), now);
        assert!(app.is_running());
        assert!(app.records().is_empty());

        app.handle_run_event(line(new, "TEST_ITEM_ID: fresh"), now);
        app.handle_run_event(line(new, "OVERALL_STATUS: FAIL"), now);
        app.handle_run_event(exited(new, Some(1)), now);
        assert_eq!(app.records()[0].id, "fresh");
        assert_eq!(app.outcome(), Some(Outcome::Failed));
    }

    #[test]
    fn silent_crash_is_fatal() {
        let mut app = App::new();
        let run = app.begin_run("crash");
        app.handle_run_event(exited(run, Some(139)), Instant::now());
        let outcome = app.outcome().unwrap();
        assert!(matches!(outcome, Outcome::Fatal(ref msg) if msg.contains("139")));
        assert_eq!(outcome.exit_code(), 2);
    }

    #[test]
    fn no_records_counts_as_failure() {
        let mut app = App::new();
        let run = app.begin_run("empty");
        app.handle_run_event(line(run, "collected 0 items"), Instant::now());
        app.handle_run_event(exited(run, Some(0)), Instant::now());
        assert_eq!(app.outcome(), Some(Outcome::Failed));
    }

    #[test]
    fn unfinished_records_count_as_failure() {
        let mut app = App::new();
        let run = app.begin_run("partial");
        let now = Instant::now();
        app.handle_run_event(line(run, "TEST_ITEM_ID: a"), now);
        app.handle_run_event(line(run, "OVERALL_STATUS: PASS"), now);
        app.handle_run_event(line(run, "TEST_ITEM_ID: b"), now);
        app.handle_run_event(exited(run, Some(1)), now);
        assert_eq!(app.outcome(), Some(Outcome::Failed));
    }

    #[test]
    fn spawn_failure_is_fatal() {
        let mut app = App::new();
        app.begin_run("missing");
        app.fail_run("failed to start missing: not found");
        assert_eq!(
            app.outcome(),
            Some(Outcome::Fatal("failed to start missing: not found".into()))
        );
        let run = app.begin_run("again");
        assert_eq!(run, 2);
        assert_eq!(app.fatal(), None);
    }

    // -----------------------------------------------------------------------
    // Socket handling
    // -----------------------------------------------------------------------

    #[test]
    fn socket_messages_take_over_from_markers() {
        let mut app = App::new();
        let run = app.begin_run("plugin");
        let now = Instant::now();
        app.handle_run_event(line(run, "TEST_ITEM_ID: m1"), now);
        app.handle_listener_event(ListenerEvent::Connected { peer: peer() });
        app.handle_listener_event(message("test_start", json!({"id": "test_compare[s1]"})));
        app.handle_listener_event(message("test_result", json!({"id": "s1", "status": "PASS"})));
        app.handle_run_event(line(run, "TEST_ITEM_ID: m2"), now);

        let ids: Vec<_> = app.records().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["s1"]);
    }

    #[test]
    fn bad_socket_message_is_dropped() {
        let mut app = App::new();
        app.begin_run("plugin");
        app.handle_listener_event(ListenerEvent::Connected { peer: peer() });
        app.handle_listener_event(message("test_result", json!({"id": "x", "status": "MAYBE"})));
        app.handle_listener_event(message("bogus", json!({})));
        assert!(app.records().is_empty());
        assert!(!app.session().trust().is_socket_trusted());
    }

    #[test]
    fn exit_waits_for_socket_to_settle() {
        let mut app = App::new();
        let run = app.begin_run("plugin");
        let start = Instant::now();
        app.handle_listener_event(ListenerEvent::Connected { peer: peer() });
        app.handle_listener_event(message("test_start", json!({"id": "t1"})));
        app.handle_run_event(exited(run, Some(0)), start);
        assert!(app.is_running());

        // Trailing message inside the window still lands.
        app.handle_listener_event(message("test_result", json!({"id": "t1", "status": "PASS"})));
        app.tick(start + Duration::from_millis(100));
        assert!(app.is_running());

        app.tick(start + SETTLE_WINDOW);
        assert!(!app.is_running());
        assert_eq!(app.outcome(), Some(Outcome::Passed));
    }

    #[test]
    fn disconnect_ends_settle_early() {
        let mut app = App::new();
        let run = app.begin_run("plugin");
        let now = Instant::now();
        app.handle_listener_event(ListenerEvent::Connected { peer: peer() });
        app.handle_listener_event(message("test_result", json!({"id": "t1", "status": "FAIL"})));
        app.handle_run_event(exited(run, Some(1)), now);
        assert!(app.is_running());

        app.handle_listener_event(ListenerEvent::Disconnected { peer: peer() });
        assert!(!app.is_running());
        assert_eq!(app.socket_peer(), None);
        assert_eq!(app.outcome(), Some(Outcome::Failed));
    }

    #[test]
    fn disconnect_of_other_peer_keeps_settling() {
        let mut app = App::new();
        let run = app.begin_run("plugin");
        app.handle_listener_event(ListenerEvent::Connected { peer: peer() });
        app.handle_run_event(exited(run, Some(0)), Instant::now());
        app.handle_listener_event(ListenerEvent::Disconnected {
            peer: "127.0.0.1:50001".parse().unwrap(),
        });
        assert!(app.is_running());
    }

    #[test]
    fn socket_only_run_is_not_silent() {
        let mut app = App::new();
        let run = app.begin_run("plugin");
        app.handle_listener_event(ListenerEvent::Connected { peer: peer() });
        app.handle_listener_event(message("session_start", json!({"test_count": 1})));
        app.handle_listener_event(ListenerEvent::Disconnected { peer: peer() });
        app.handle_run_event(exited(run, Some(1)), Instant::now());
        assert_eq!(app.outcome(), Some(Outcome::Failed));
    }

    #[test]
    fn previous_producer_cannot_touch_new_run() {
        let mut app = App::new();
        app.begin_run("first");
        app.handle_listener_event(ListenerEvent::Connected { peer: peer() });

        let run = app.begin_run("second");
        assert_eq!(app.socket_peer(), None);
        app.handle_listener_event(message("test_result", json!({"id": "old-1", "status": "PASS"})));
        let now = Instant::now();
        app.handle_run_event(line(run, "TEST_ITEM_ID: new-1"), now);
        app.handle_run_event(line(run, "OVERALL_STATUS: FAIL"), now);

        assert!(!app.session().trust().is_socket_trusted());
        let ids: Vec<_> = app.records().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["new-1"]);
    }

    #[test]
    fn messages_need_a_connected_peer() {
        let mut app = App::new();
        app.begin_run("plugin");
        app.handle_listener_event(message("test_start", json!({"id": "t1"})));
        assert!(app.records().is_empty());

        app.handle_listener_event(ListenerEvent::Connected { peer: peer() });
        app.handle_listener_event(message("test_start", json!({"id": "t1"})));
        assert_eq!(app.records().len(), 1);
    }

    // -----------------------------------------------------------------------
    // Navigation
    // -----------------------------------------------------------------------

    fn app_with_records(n: usize) -> App {
        let mut app = App::new();
        app.begin_run("nav");
        app.handle_listener_event(ListenerEvent::Connected { peer: peer() });
        for i in 0..n {
            let event = TestEvent::TestStart {
                id: format!("t{i}"),
                description: String::new(),
            };
            app.handle_listener_event(ListenerEvent::Message {
                peer: peer(),
                message: event.to_wire(0.0),
            });
        }
        app
    }

    #[test]
    fn next_clamps_at_last_element() {
        let mut app = app_with_records(2);
        app.next();
        app.next();
        app.next();
        assert_eq!(app.selected, 1);
        assert_eq!(app.selected_record().unwrap().id, "t1");
    }

    #[test]
    fn next_noop_on_empty() {
        let mut app = App::new();
        app.next();
        assert_eq!(app.selected, 0);
    }

    #[test]
    fn previous_clamps_at_zero() {
        let mut app = app_with_records(3);
        app.selected = 2;
        app.previous();
        app.previous();
        app.previous();
        assert_eq!(app.selected, 0);
    }

    #[test]
    fn navigation_follows_view() {
        let mut app = App::with_scripts(vec![script("test_a.sh"), script("test_b.sh")]);
        assert_eq!(app.view, View::Scripts);
        app.next();
        assert_eq!(app.script_selected, 1);
        assert_eq!(app.selected, 0);
        assert_eq!(app.selected_script().unwrap().name(), "test_b.sh");

        app.begin_run("test_b.sh");
        assert_eq!(app.view, View::Results);
        app.toggle_view();
        assert_eq!(app.view, View::Scripts);
    }

    #[test]
    fn toggle_view_needs_scripts() {
        let mut app = App::new();
        app.toggle_view();
        assert_eq!(app.view, View::Results);
    }

    #[test]
    fn new_run_resets_selection_and_expansion() {
        let mut app = app_with_records(3);
        app.selected = 2;
        app.toggle_expanded();
        app.begin_run("again");
        assert_eq!(app.selected, 0);
        assert!(!app.expanded);
        assert!(app.records().is_empty());
    }
}
