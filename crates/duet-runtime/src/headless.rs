//! Headless runs: drive one session to completion without a terminal UI.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::warn;

use crate::app::{App, Outcome};
use crate::listener::ListenerEvent;
use crate::process::{ProcessRunner, RunEvent, RunOutput};

const TICK: Duration = Duration::from_millis(50);

/// Run `runner` and fold its output and any socket traffic into `app`
/// until the run has settled. Ctrl-C ends the wait early.
pub async fn run(
    app: &mut App,
    runner: ProcessRunner,
    listener_rx: &mut mpsc::UnboundedReceiver<ListenerEvent>,
) -> Outcome {
    let run = app.begin_run(runner.display());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _task = runner.launch(run, tx);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    while app.is_running() {
        tokio::select! {
            Some(event) = rx.recv() => app.handle_run_event(event, Instant::now()),
            Some(event) = listener_rx.recv() => app.handle_listener_event(event),
            _ = tokio::time::sleep(TICK) => app.tick(Instant::now()),
            _ = &mut ctrl_c => {
                warn!(run, "interrupted");
                app.fail_run("interrupted");
            }
        }
    }

    // Messages already delivered still count.
    while let Ok(event) = listener_rx.try_recv() {
        app.handle_listener_event(event);
    }
    app.outcome().unwrap_or(Outcome::Failed)
}

/// Feed a saved transcript through the marker path as if a process had
/// printed it and exited cleanly.
pub fn replay(app: &mut App, title: &str, transcript: &str) -> Outcome {
    let run = app.begin_run(title);
    let now = Instant::now();
    for line in transcript.lines() {
        app.handle_run_event(
            RunEvent::Line {
                run,
                line: line.to_owned(),
            },
            now,
        );
    }
    app.handle_run_event(
        RunEvent::Finished {
            run,
            result: Ok(RunOutput {
                exit_code: Some(0),
                transcript: transcript.to_owned(),
            }),
        },
        now,
    );
    app.outcome().unwrap_or(Outcome::Failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use duet_core::{TestEvent, TestStatus, WireMessage};

    fn sh(script: &str) -> ProcessRunner {
        ProcessRunner::new("sh", ["-c", script])
    }

    #[tokio::test]
    async fn marker_output_drives_outcome() {
        let mut app = App::new();
        let (_tx, mut rx) = mpsc::unbounded_channel();
        let outcome = run(
            &mut app,
            sh("echo 'TESTS 2'; echo 'TEST_ITEM_ID: a'; echo 'OVERALL_STATUS: PASS'; \
                echo 'TEST_ITEM_ID: b'; echo 'OVERALL_STATUS: FAIL'; exit 1"),
            &mut rx,
        )
        .await;
        assert_eq!(outcome, Outcome::Failed);
        let statuses: Vec<_> = app.records().iter().map(|r| (r.id.as_str(), r.status)).collect();
        assert_eq!(statuses, vec![("a", TestStatus::Pass), ("b", TestStatus::Fail)]);
    }

    #[tokio::test]
    async fn silent_crash_is_fatal() {
        let mut app = App::new();
        let (_tx, mut rx) = mpsc::unbounded_channel();
        let outcome = run(&mut app, sh("exit 3"), &mut rx).await;
        assert!(matches!(outcome, Outcome::Fatal(_)));
    }

    #[tokio::test]
    async fn spawn_failure_is_fatal() {
        let mut app = App::new();
        let (_tx, mut rx) = mpsc::unbounded_channel();
        let outcome = run(&mut app, ProcessRunner::new("duet-no-such-binary", Vec::<String>::new()), &mut rx).await;
        assert!(matches!(outcome, Outcome::Fatal(ref msg) if msg.contains("duet-no-such-binary")));
    }

    #[tokio::test]
    async fn socket_events_win_over_markers() {
        let mut app = App::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let peer = "127.0.0.1:40000".parse().unwrap();
        let send = |event: TestEvent| {
            let message: WireMessage = event.to_wire(1.0);
            tx.send(ListenerEvent::Message { peer, message }).unwrap();
        };
        tx.send(ListenerEvent::Connected { peer }).unwrap();
        send(TestEvent::SessionStart { test_count: 1 });
        send(TestEvent::TestStart {
            id: "s1".into(),
            description: String::new(),
        });
        send(TestEvent::TestResult(duet_core::ResultUpdate {
            id: "s1".into(),
            verdict: Some(duet_core::Verdict::Pass),
            ..Default::default()
        }));

        // Marker lines arrive after the socket has spoken and are dropped.
        let outcome = run(&mut app, sh("sleep 0.2; echo 'TEST_ITEM_ID: m1'"), &mut rx).await;
        assert_eq!(outcome, Outcome::Passed);
        let ids: Vec<_> = app.records().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["s1"]);
    }

    #[test]
    fn replay_builds_records() {
        let mut app = App::new();
        let outcome = replay(&mut app, "saved.txt", "preamble\nTEST_ITEM_ID: t3\nOVERALL_STATUS: PASS\n");
        assert_eq!(outcome, Outcome::Passed);
        assert_eq!(app.records().len(), 1);
        assert_eq!(app.title(), "saved.txt");
    }

    #[test]
    fn empty_replay_fails_without_being_fatal() {
        let mut app = App::new();
        assert_eq!(replay(&mut app, "empty", ""), Outcome::Failed);
    }
}
