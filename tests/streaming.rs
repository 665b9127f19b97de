use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::broadcast::error::TryRecvError;

use weft::prelude::*;
use weft::{sequential, EventBus, EventWatchers};
use weft_test_utils::{count_kind, event_kinds, upper_reverse_workflow, ScriptedAgent};

fn review_gate() -> Workflow {
    WorkflowBuilder::new("review")
        .add_executor(
            FunctionExecutor::new("review")
                .handler::<String, _, _>(|draft, ctx| async move {
                    ctx.request_info(&format!("publish '{}'?", draft))?;
                    Ok(())
                })
                .handler::<bool, _, _>(|publish, ctx| async move {
                    ctx.yield_output(&if publish { "published" } else { "discarded" }.to_string())
                })
                .shareable(),
        )
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_event_bus_sees_every_event_in_order() {
    let bus = Arc::new(EventBus::new(64));
    let mut rx = bus.subscribe();

    let result = upper_reverse_workflow()
        .run_with(
            &"bus".to_string(),
            RunOptions::default().with_event_bus(bus.clone()),
        )
        .await
        .unwrap();

    let mut published = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => published.push(event),
            Err(TryRecvError::Empty) => break,
            Err(e) => panic!("unexpected receive error: {:?}", e),
        }
    }
    assert_eq!(published, result.events);
}

#[tokio::test]
async fn test_watchers_fire_per_kind_and_for_any() {
    let outputs = Arc::new(AtomicUsize::new(0));
    let all = Arc::new(AtomicUsize::new(0));

    let mut watchers = EventWatchers::new();
    let seen_outputs = outputs.clone();
    let seen_all = all.clone();
    watchers
        .on(EventKind::Output, move |_| {
            seen_outputs.fetch_add(1, Ordering::SeqCst);
        })
        .on_any(move |_| {
            seen_all.fetch_add(1, Ordering::SeqCst);
        });

    let result = upper_reverse_workflow()
        .run_with(&"watch".to_string(), RunOptions::default().with_watchers(watchers))
        .await
        .unwrap();

    assert_eq!(outputs.load(Ordering::SeqCst), 1);
    assert_eq!(all.load(Ordering::SeqCst), result.events.len());
}

#[tokio::test]
async fn test_stream_halts_then_finishes_after_response() {
    let wf = review_gate();
    let mut run = wf.stream(&"draft".to_string(), RunOptions::default()).unwrap();

    let first = run.drain_until_idle().await;
    assert_eq!(first.first().unwrap().kind(), EventKind::Started);
    let request_id = match first.last().unwrap() {
        WorkflowEvent::Halted {
            pending_requests, ..
        } => pending_requests[0].clone(),
        other => panic!("expected a halt, got {:?}", other),
    };

    run.respond_with(&request_id, &true).await.unwrap();
    let rest: Vec<WorkflowEvent> = run.into_stream().collect().await;

    assert_eq!(rest.last().unwrap().kind(), EventKind::Completed);
    assert!(rest.iter().any(|e| matches!(
        e,
        WorkflowEvent::Output { payload, .. } if payload.decode::<String>().unwrap() == "published"
    )));
}

#[tokio::test]
async fn test_stream_reports_agent_progress() {
    let drafter = ScriptedAgent::replying("drafter", "first draft");
    let editor = ScriptedAgent::replying("editor", "final copy");
    let wf = sequential(vec![drafter.as_agent(), editor.as_agent()]).unwrap();

    let events: Vec<WorkflowEvent> = wf
        .stream(&"write a note".to_string(), RunOptions::default())
        .unwrap()
        .into_stream()
        .collect()
        .await;

    assert_eq!(count_kind(&events, EventKind::AgentRunUpdate), 2);
    assert_eq!(count_kind(&events, EventKind::AgentRunResponse), 2);
    let kinds = event_kinds(&events);
    let output_at = kinds.iter().position(|k| *k == EventKind::Output).unwrap();
    let last_update = kinds
        .iter()
        .rposition(|k| *k == EventKind::AgentRunUpdate)
        .unwrap();
    assert!(last_update < output_at);
    assert_eq!(*kinds.last().unwrap(), EventKind::Completed);
}

#[tokio::test]
async fn test_finished_stream_hands_back_its_executors() {
    let wf = WorkflowBuilder::new("upper")
        .add_executor(FunctionExecutor::output("upper", |s: String| Ok(s.to_uppercase())))
        .build()
        .unwrap();

    let mut run = wf.stream(&"a".to_string(), RunOptions::default()).unwrap();
    let mut last = None;
    while let Some(event) = run.next_event().await {
        last = Some(event.kind());
    }
    assert_eq!(last, Some(EventKind::Completed));

    // The handle is still alive and still answers commands.
    assert!(run.checkpoint().await.is_ok());
    let again = wf.run(&"b".to_string()).await.unwrap();
    assert_eq!(again.status, RunStatus::Completed);
    assert_eq!(again.output::<String>().unwrap().unwrap(), "B");
}
