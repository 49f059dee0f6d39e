//! End-to-end run behaviour through the orchestrator
//!
//! - Resume never re-executes completed units
//! - An existing unit artifact beats a stale checkpoint
//! - A permanently failing unit does not stop the run
//! - Dedup across units in the final artifact
//! - Completion order does not change the result
//! - Cancellation persists exactly the completed units
//! - Output of failed or aborted units never reaches the final artifact

mod common;

use common::*;
use npsa_orchestration::record::{read_records, write_records};
use npsa_orchestration::{CancelPolicy, RunRegistry, RunStatus};
use pretty_assertions::assert_eq;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn as_set(units: &[String]) -> HashSet<String> {
    units.iter().cloned().collect()
}

#[tokio::test]
async fn test_example_three_unit_run() {
    let harness = Harness::new(&["A", "B", "C"]);
    let pipeline = Arc::new(
        ScriptedPipeline::new()
            .records(
                "A",
                vec![
                    contact("Ann", "Lee", Some("ann@adams.k12.oh.us"), ""),
                    contact("Bo", "Li", None, "https://www.adams.k12.oh.us/staff"),
                ],
            )
            .fail("B", "search quota exhausted")
            .records(
                "C",
                vec![contact("Bo", "Li", None, "http://adams.k12.oh.us/contact")],
            ),
    );
    let orchestrator = harness.orchestrator(pipeline, Arc::new(RunRegistry::new()));

    let (run_id, status) = start_and_wait(&orchestrator, "ohio").await;
    assert_eq!(status, RunStatus::Completed);

    let checkpoint = harness.store.load_checkpoint(&run_id).await.unwrap().unwrap();
    assert_eq!(checkpoint.completed_units, units(&["A", "B", "C"]));
    assert_eq!(checkpoint.next_index, 3);

    let snapshot = orchestrator.status(&run_id).await.unwrap();
    assert_eq!(snapshot.status, RunStatus::Completed);
    assert_eq!(snapshot.records_found, 2);
    assert_eq!(snapshot.records_with_channel, 1);
    assert_eq!(snapshot.records_without_channel, 1);
    assert_eq!(snapshot.failed_units, 1);
    assert_eq!(snapshot.eta_secs, 0);

    let meta = harness.store.load_metadata(&run_id).await.unwrap().unwrap();
    assert_eq!(meta.status, RunStatus::Completed);
    assert_eq!(meta.completed_units, 3);
    assert!(meta.completed_at.is_some());

    let artifact = orchestrator.final_artifact(&run_id).await.unwrap();
    assert!(artifact.ends_with("Ohio_leads_final.csv"));
    assert_eq!(read_records(&artifact).unwrap().len(), 2);
}

#[tokio::test]
async fn test_resume_executes_only_remaining_units() {
    let harness = Harness::new(&["A", "B", "C", "D", "E"]);
    let registry = Arc::new(RunRegistry::new());
    let first = Arc::new(
        ScriptedPipeline::new()
            .records("A", vec![contact("Ann", "Lee", Some("ann@a.org"), "")])
            .cancel_on("C", registry.clone()),
    );
    let orchestrator = harness.orchestrator(first.clone(), registry);

    let (run_id, status) = start_and_wait(&orchestrator, "ohio").await;
    assert_eq!(status, RunStatus::Cancelled);
    assert_eq!(first.calls(), units(&["A", "B", "C"]));

    // New process, same store and run directory
    let second = Arc::new(ScriptedPipeline::new());
    let restarted = harness.orchestrator(second.clone(), Arc::new(RunRegistry::new()));
    assert_eq!(resume_and_wait(&restarted, &run_id).await, RunStatus::Completed);

    assert_eq!(second.calls(), units(&["D", "E"]));
    let checkpoint = harness.store.load_checkpoint(&run_id).await.unwrap().unwrap();
    assert_eq!(checkpoint.completed_units.len(), 5);

    // A's records from the first session are part of the final result
    let artifact = restarted.final_artifact(&run_id).await.unwrap();
    assert_eq!(read_records(&artifact).unwrap().len(), 1);
}

#[tokio::test]
async fn test_artifact_wins_over_stale_checkpoint() {
    let harness = Harness::new(&["A", "B", "C", "D"]);
    let registry = Arc::new(RunRegistry::new());
    let first = Arc::new(ScriptedPipeline::new().cancel_on("B", registry.clone()));
    let orchestrator = harness.orchestrator(first, registry);

    let (run_id, status) = start_and_wait(&orchestrator, "ohio").await;
    assert_eq!(status, RunStatus::Cancelled);
    let checkpoint = harness.store.load_checkpoint(&run_id).await.unwrap().unwrap();
    assert_eq!(checkpoint.completed_units, units(&["A", "B"]));

    // C finished its pipeline but the process died before the checkpoint write
    write_records(
        &harness.layout().unit_artifact(&run_id, "C"),
        &[contact("Cy", "Ng", Some("cy@c.org"), "")],
    )
    .unwrap();

    let second = Arc::new(ScriptedPipeline::new());
    let restarted = harness.orchestrator(second.clone(), Arc::new(RunRegistry::new()));
    assert_eq!(resume_and_wait(&restarted, &run_id).await, RunStatus::Completed);

    assert_eq!(second.call_count("C"), 0);
    assert_eq!(second.calls(), units(&["D"]));
    let artifact = restarted.final_artifact(&run_id).await.unwrap();
    let records = read_records(&artifact).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].contact_channel.as_deref(), Some("cy@c.org"));
}

#[tokio::test]
async fn test_failing_unit_is_tolerated_and_not_retried() {
    let harness = Harness::new(&["A", "B", "C"]);
    let pipeline = Arc::new(
        ScriptedPipeline::new()
            .records("A", vec![contact("Ann", "Lee", Some("ann@a.org"), "")])
            .fail("B", "county page unreachable")
            .records("C", vec![contact("Cy", "Ng", Some("cy@c.org"), "")]),
    );
    let orchestrator = harness.orchestrator(pipeline.clone(), Arc::new(RunRegistry::new()));

    let (run_id, status) = start_and_wait(&orchestrator, "ohio").await;
    assert_eq!(status, RunStatus::Completed);
    assert_eq!(pipeline.call_count("B"), 1);

    let checkpoint = harness.store.load_checkpoint(&run_id).await.unwrap().unwrap();
    assert!(checkpoint.completed_units.contains(&"B".to_string()));

    let artifact = orchestrator.final_artifact(&run_id).await.unwrap();
    let channels: HashSet<String> = read_records(&artifact)
        .unwrap()
        .into_iter()
        .filter_map(|r| r.contact_channel)
        .collect();
    assert_eq!(channels, as_set(&units(&["ann@a.org", "cy@c.org"])));
}

#[tokio::test]
async fn test_failed_unit_partial_output_is_excluded() {
    let harness = Harness::new(&["A", "B", "C"]);
    let pipeline = Arc::new(
        ScriptedPipeline::new()
            .records("A", vec![contact("Ann", "Lee", Some("ann@a.org"), "")])
            .fail_after_writing(
                "B",
                vec![contact("Half", "Done", Some("bad@b.org"), "")],
                "browser crashed mid-county",
            )
            .records("C", vec![contact("Cy", "Ng", Some("cy@c.org"), "")]),
    );
    let orchestrator = harness.orchestrator(pipeline, Arc::new(RunRegistry::new()));

    let (run_id, status) = start_and_wait(&orchestrator, "ohio").await;
    assert_eq!(status, RunStatus::Completed);
    assert!(!harness.layout().has_unit_artifact(&run_id, "B"));

    let snapshot = orchestrator.status(&run_id).await.unwrap();
    assert_eq!(snapshot.failed_units, 1);
    assert_eq!(snapshot.records_found, 2);

    let artifact = orchestrator.final_artifact(&run_id).await.unwrap();
    let channels: HashSet<String> = read_records(&artifact)
        .unwrap()
        .into_iter()
        .filter_map(|r| r.contact_channel)
        .collect();
    assert_eq!(channels, as_set(&units(&["ann@a.org", "cy@c.org"])));
}

#[tokio::test]
async fn test_aborted_unit_is_executed_again_on_resume() {
    let harness = Harness::new(&["A", "B"]).cancel_policy(CancelPolicy::Abort);
    let first = Arc::new(ScriptedPipeline::new().hang_after_writing(
        "A",
        vec![contact("Ann", "Lee", Some("half@a.org"), "")],
    ));
    let orchestrator = harness.orchestrator(first, Arc::new(RunRegistry::new()));

    let run_id = orchestrator.start_run("ohio").await.unwrap();
    let partial = harness.layout().unit_artifact(&run_id, "A");
    while !partial.exists() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    orchestrator.cancel_run(&run_id).unwrap();
    assert_eq!(orchestrator.wait(&run_id).await.unwrap(), RunStatus::Cancelled);
    assert!(!partial.exists());

    let second = Arc::new(
        ScriptedPipeline::new().records("A", vec![contact("Ann", "Lee", Some("ann@a.org"), "")]),
    );
    let restarted = harness.orchestrator(second.clone(), Arc::new(RunRegistry::new()));
    assert_eq!(resume_and_wait(&restarted, &run_id).await, RunStatus::Completed);
    assert_eq!(second.call_count("A"), 1);

    let artifact = restarted.final_artifact(&run_id).await.unwrap();
    let channels: Vec<String> = read_records(&artifact)
        .unwrap()
        .into_iter()
        .filter_map(|r| r.contact_channel)
        .collect();
    assert_eq!(channels, units(&["ann@a.org"]));
}

#[tokio::test]
async fn test_failure_from_earlier_session_stays_failed() {
    let harness = Harness::new(&["A", "B", "C"]);
    let registry = Arc::new(RunRegistry::new());
    let first = Arc::new(
        ScriptedPipeline::new()
            .fail_after_writing(
                "A",
                vec![contact("Half", "Done", Some("bad@a.org"), "")],
                "quota",
            )
            .cancel_on("B", registry.clone()),
    );
    let orchestrator = harness.orchestrator(first, registry);
    let (run_id, status) = start_and_wait(&orchestrator, "ohio").await;
    assert_eq!(status, RunStatus::Cancelled);

    let second = Arc::new(ScriptedPipeline::new());
    let restarted = harness.orchestrator(second.clone(), Arc::new(RunRegistry::new()));
    assert_eq!(resume_and_wait(&restarted, &run_id).await, RunStatus::Completed);
    assert_eq!(second.call_count("A"), 0);

    let snapshot = restarted.status(&run_id).await.unwrap();
    assert_eq!(snapshot.failed_units, 1);
    let artifact = restarted.final_artifact(&run_id).await.unwrap();
    assert!(read_records(&artifact).unwrap().is_empty());
}

#[tokio::test]
async fn test_final_artifact_is_deduplicated() {
    let harness = Harness::new(&["A", "B"]);
    let pipeline = Arc::new(
        ScriptedPipeline::new()
            .records(
                "A",
                vec![
                    contact("Ann", "Lee", Some("Ann@Adams.org"), ""),
                    contact("Bo", "Li", None, "https://www.adams.org/staff"),
                ],
            )
            .records(
                "B",
                vec![
                    contact("Ann", "Lee", Some("  ann@adams.ORG\u{200B}"), ""),
                    contact(" bo ", "LI", None, "adams.org/about"),
                    contact("Bo", "Li", None, "https://brown.org"),
                ],
            ),
    );
    let orchestrator = harness.orchestrator(pipeline, Arc::new(RunRegistry::new()));

    let (run_id, status) = start_and_wait(&orchestrator, "ohio").await;
    assert_eq!(status, RunStatus::Completed);

    let records = read_records(&orchestrator.final_artifact(&run_id).await.unwrap()).unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].contact_channel.as_deref(), Some("ann@adams.org"));
    // Same name at a different source domain is a different person
    assert_eq!(
        records.iter().filter(|r| r.contact_channel.is_none()).count(),
        2
    );
}

#[tokio::test]
async fn test_completion_order_does_not_change_result() {
    let script = || {
        ScriptedPipeline::new()
            .records(
                "A",
                vec![
                    contact("Ann", "Lee", Some("ann@x.org"), ""),
                    contact("Bo", "Li", None, "x.org"),
                ],
            )
            .records("B", vec![contact("Bo", "Li", None, "www.x.org")])
            .records(
                "C",
                vec![
                    contact("ANN", "LEE", Some("ann@x.org"), ""),
                    contact("Cy", "Ng", Some("cy@x.org"), ""),
                ],
            )
    };

    // Sequential: A, B, C
    let sequential = Harness::new(&["A", "B", "C"]);
    let orchestrator = sequential.orchestrator(Arc::new(script()), Arc::new(RunRegistry::new()));
    let (seq_id, status) = start_and_wait(&orchestrator, "ohio").await;
    assert_eq!(status, RunStatus::Completed);
    let seq_bytes = std::fs::read(orchestrator.final_artifact(&seq_id).await.unwrap()).unwrap();
    let seq_ck = sequential.store.load_checkpoint(&seq_id).await.unwrap().unwrap();

    // Parallel, finishing C, B, A
    let parallel = Harness::new(&["A", "B", "C"]).parallelism(3);
    let pipeline = Arc::new(
        script()
            .delay("A", Duration::from_millis(300))
            .delay("B", Duration::from_millis(150))
            .delay("C", Duration::from_millis(10)),
    );
    let orchestrator = parallel.orchestrator(pipeline, Arc::new(RunRegistry::new()));
    let (par_id, status) = start_and_wait(&orchestrator, "ohio").await;
    assert_eq!(status, RunStatus::Completed);
    let par_bytes = std::fs::read(orchestrator.final_artifact(&par_id).await.unwrap()).unwrap();
    let par_ck = parallel.store.load_checkpoint(&par_id).await.unwrap().unwrap();

    assert_eq!(seq_ck.completed_units, par_ck.completed_units);
    assert_eq!(
        String::from_utf8(seq_bytes).unwrap(),
        String::from_utf8(par_bytes).unwrap()
    );
}

#[tokio::test]
async fn test_cancellation_persists_exactly_completed_units() {
    let harness = Harness::new(&["A", "B", "C", "D", "E"]).parallelism(2);
    let registry = Arc::new(RunRegistry::new());
    let pipeline = Arc::new(
        ScriptedPipeline::new()
            .delay("A", Duration::from_millis(50))
            .cancel_on("B", registry.clone()),
    );
    let orchestrator = harness.orchestrator(pipeline.clone(), registry);

    let (run_id, status) = start_and_wait(&orchestrator, "ohio").await;
    assert_eq!(status, RunStatus::Cancelled);

    // Drain policy: A and B were already dispatched and finish; nothing else starts
    assert_eq!(as_set(&pipeline.calls()), as_set(&units(&["A", "B"])));
    let checkpoint = harness.store.load_checkpoint(&run_id).await.unwrap().unwrap();
    assert_eq!(checkpoint.completed_units, units(&["A", "B"]));

    let meta = harness.store.load_metadata(&run_id).await.unwrap().unwrap();
    assert_eq!(meta.status, RunStatus::Cancelled);
    assert_eq!(meta.completed_units, 2);
    assert!(orchestrator.final_artifact(&run_id).await.is_err());
}

#[tokio::test]
async fn test_abort_policy_leaves_stopped_units_for_resume() {
    let harness = Harness::new(&["A", "B", "C"])
        .parallelism(2)
        .cancel_policy(CancelPolicy::Abort);
    let registry = Arc::new(RunRegistry::new());
    let pipeline = Arc::new(
        ScriptedPipeline::new()
            .hang("A")
            .hang("B")
            .cancel_on("B", registry.clone()),
    );
    let orchestrator = harness.orchestrator(pipeline, registry);

    let (run_id, status) = start_and_wait(&orchestrator, "ohio").await;
    assert_eq!(status, RunStatus::Cancelled);
    let checkpoint = harness.store.load_checkpoint(&run_id).await.unwrap().unwrap();
    assert!(checkpoint.completed_units.is_empty());

    let second = Arc::new(ScriptedPipeline::new());
    let restarted = harness.orchestrator(second.clone(), Arc::new(RunRegistry::new()));
    assert_eq!(resume_and_wait(&restarted, &run_id).await, RunStatus::Completed);
    assert_eq!(as_set(&second.calls()), as_set(&units(&["A", "B", "C"])));
}

#[tokio::test]
async fn test_checkpoint_cadence_every_k() {
    let harness = Harness::new(&["A", "B", "C", "D", "E"]).checkpoint_every(2);
    let registry = Arc::new(RunRegistry::new());
    let pipeline = Arc::new(ScriptedPipeline::new().cancel_on("C", registry.clone()));
    let orchestrator = harness.orchestrator(pipeline, registry);

    let (run_id, status) = start_and_wait(&orchestrator, "ohio").await;
    assert_eq!(status, RunStatus::Cancelled);

    // The cancellation path always persists, regardless of cadence
    let checkpoint = harness.store.load_checkpoint(&run_id).await.unwrap().unwrap();
    assert_eq!(checkpoint.completed_units, units(&["A", "B", "C"]));
}
