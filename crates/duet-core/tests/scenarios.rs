use duet_core::{DetailedDiff, EventRouter, FatalRunError, Session, TestStatus};
use serde_json::json;
use std::fs;
use std::path::PathBuf;

fn fixture(name: &str) -> String {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name);
    fs::read_to_string(&path).unwrap_or_else(|e| panic!("failed to read fixture {:?}: {}", path, e))
}

fn send(router: &mut EventRouter, session: &mut Session, line: &str) {
    let msg: serde_json::Value = serde_json::from_str(line).unwrap();
    let kind = msg["type"].as_str().unwrap();
    router.consume_message(session, kind, &msg["data"]).unwrap();
}

#[test]
fn duplicate_result_yields_one_record() {
    let mut session = Session::new();
    let mut router = EventRouter::new();
    for line in [
        r#"{"type":"session_start","timestamp":1.0,"data":{"test_count":2}}"#,
        r#"{"type":"test_start","timestamp":1.1,"data":{"id":"t1"}}"#,
        r#"{"type":"test_result","timestamp":1.2,"data":{"id":"t1","status":"PASS"}}"#,
        r#"{"type":"test_result","timestamp":1.3,"data":{"id":"t1","status":"PASS"}}"#,
    ] {
        send(&mut router, &mut session, line);
    }
    assert_eq!(session.records().len(), 1);
    assert_eq!(session.records().get("t1").unwrap().status, TestStatus::Pass);
    assert_eq!(session.tally().completed, 1);
    assert_eq!(session.progress(), 49);
}

#[test]
fn outputs_then_failing_result() {
    let mut session = Session::new();
    let mut router = EventRouter::new();
    send(
        &mut router,
        &mut session,
        r#"{"type":"test_outputs","timestamp":0,"data":{"id":"t2","cpp_output":"NPV: 398.67","mojo_output":"NPV: 398.68"}}"#,
    );
    send(
        &mut router,
        &mut session,
        r#"{"type":"test_result","timestamp":0,"data":{"id":"t2","status":"FAIL","diff":"0.01"}}"#,
    );
    let record = session.records().get("t2").unwrap();
    assert_eq!(record.status, TestStatus::Fail);
    assert_eq!(record.reference_output, vec!["NPV: 398.67"]);
    assert_eq!(record.candidate_output, vec!["NPV: 398.68"]);
    assert_eq!(record.diff_summary, "0.01");
}

#[test]
fn inputs_after_result_fill_empty_fields_only() {
    let mut session = Session::new();
    let mut router = EventRouter::new();
    router
        .consume_message(
            &mut session,
            "test_result",
            &json!({"id": "t4", "status": "FAIL", "reason": "differs"}),
        )
        .unwrap();
    router
        .consume_message(
            &mut session,
            "test_inputs",
            &json!({"id": "test_npv[t4]", "inputs": {"rate": 0.05}}),
        )
        .unwrap();
    router
        .consume_message(&mut session, "test_inputs", &json!({"id": "t4", "inputs": []}))
        .unwrap();
    let record = session.records().get("t4").unwrap();
    assert_eq!(record.inputs, vec!["rate: 0.05"]);
    assert_eq!(record.fail_reason, "differs");
    assert_eq!(record.status, TestStatus::Fail);
}

#[test]
fn raw_transcript_only() {
    let mut session = Session::new();
    let mut router = EventRouter::new();
    for line in "TEST_ITEM_ID: t3\nOVERALL_STATUS: PASS\n".lines() {
        router.consume_raw_line(&mut session, line);
    }
    router.finish(&mut session, Some(0)).unwrap();

    assert_eq!(session.records().len(), 1);
    let record = session.records().get("t3").unwrap();
    assert_eq!(record.status, TestStatus::Pass);
    assert!(record.inputs.is_empty());
    assert!(record.reference_output.is_empty());
    assert!(record.candidate_output.is_empty());
}

#[test]
fn saved_transcript_replays() {
    let mut session = Session::new();
    let mut router = EventRouter::new();
    for line in fixture("cashflow_transcript.txt").lines() {
        router.consume_raw_line(&mut session, line);
    }
    router.finish(&mut session, Some(1)).unwrap();

    let ids: Vec<_> = session.records().iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["test-pepe-001", "test-pepe-002"]);

    let first = session.records().get("test-pepe-001").unwrap();
    assert_eq!(first.status, TestStatus::Pass);
    assert_eq!(first.reference_output.len(), 3);
    assert_eq!(first.reference_output, first.candidate_output);

    let second = session.records().get("test-pepe-002").unwrap();
    assert_eq!(second.status, TestStatus::Fail);
    assert_eq!(second.inputs, vec!["flows: [100, 150, 200]", "rate: 0.06"]);
    assert_eq!(second.diff_summary, "0.01 (C++: 398.67, Mojo: 398.68)");
    assert!(matches!(second.detailed_diffs[..], [DetailedDiff::LineDiff { line_num: 1, .. }]));

    let state = session.state();
    assert_eq!(state.test_count, Some(2));
    assert!(state.ended);
    assert_eq!(state.duration, Some(0.2));
    assert_eq!(session.progress(), 100);
}

#[test]
fn silent_crash_is_fatal_but_partial_output_is_not() {
    let mut session = Session::new();
    let mut router = EventRouter::new();
    assert_eq!(
        router.finish(&mut session, Some(127)),
        Err(FatalRunError::Silent { exit_code: Some(127) })
    );

    let mut session = Session::new();
    let mut router = EventRouter::new();
    for line in ["TEST_ITEM_ID: a", "OVERALL_STATUS: PASS", "END_OF_TEST_ITEM", "TEST_ITEM_ID: b"] {
        router.consume_raw_line(&mut session, line);
    }
    assert!(router.finish(&mut session, None).is_ok());
    assert_eq!(session.records().get("a").unwrap().status, TestStatus::Pass);
    assert_eq!(session.records().get("b").unwrap().status, TestStatus::Running);
}
