use std::sync::Arc;

use weft::prelude::*;
use weft::types::ToolDefinition;
use weft::{concurrent, sequential, AgentExecutor, AgentOutput, HandoffBuilder};
use weft_test_utils::{event_kinds, ScriptedAgent};

#[tokio::test]
async fn test_agent_turn_stamps_author_and_reports() {
    let writer = ScriptedAgent::replying("writer", "a haiku");
    let lookup = ToolDefinition {
        name: "lookup".to_string(),
        description: "Look something up.".to_string(),
        input_schema: serde_json::json!({ "type": "object" }),
    };
    let wf = WorkflowBuilder::new("writer")
        .add_executor(
            AgentExecutor::new(writer.as_agent())
                .with_tools(vec![lookup])
                .with_output(AgentOutput::Yield),
        )
        .build()
        .unwrap();

    let result = wf.run(&"write".to_string()).await.unwrap();
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(writer.tools_offered()[0][0].name, "lookup");
    assert_eq!(writer.views()[0], vec![ChatMessage::user("write")]);

    let transcript: Vec<ChatMessage> = result.output().unwrap().unwrap();
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[1].author_name.as_deref(), Some("writer"));
    assert_eq!(transcript[1].role, Role::Assistant);

    let kinds = event_kinds(&result.events);
    let update = kinds.iter().position(|k| *k == EventKind::AgentRunUpdate).unwrap();
    let response = kinds.iter().position(|k| *k == EventKind::AgentRunResponse).unwrap();
    assert!(update < response);
}

#[tokio::test]
async fn test_handoff_relabels_peer_turns_and_keeps_tool_calls() {
    let triage = ScriptedAgent::new("triage", vec![ScriptedAgent::transfer_turn("billing")]);
    let billing = ScriptedAgent::replying("billing", "Your refund is on its way.");
    let (triage_agent, billing_agent) = (triage.as_agent(), billing.as_agent());

    let wf = HandoffBuilder::new(triage_agent.clone())
        .add_handoff(&triage_agent, &billing_agent, "")
        .build()
        .unwrap();
    let result = wf.run(&"I was charged twice".to_string()).await.unwrap();
    assert_eq!(result.status, RunStatus::Completed);

    let offered = &triage.tools_offered()[0];
    assert_eq!(offered.len(), 1);
    assert_eq!(offered[0].name, "transfer_to_billing");
    assert_eq!(offered[0].description, "Hand the conversation over to billing.");
    assert!(billing.tools_offered()[0].is_empty());

    let billing_view = &billing.views()[0];
    assert_eq!(billing_view.len(), 2);
    assert_eq!(billing_view[1].role, Role::User);
    assert_eq!(billing_view[1].text(), "Passing you to billing.");
    assert!(billing_view.iter().all(|m| m.tool_uses().is_empty()));

    let transcript: Vec<ChatMessage> = result.output().unwrap().unwrap();
    let roles: Vec<Role> = transcript.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Assistant, Role::Assistant, Role::Assistant]
    );
    assert_eq!(transcript[2].tool_uses()[0].1, "transfer_to_billing");
    assert_eq!(transcript[3].text(), "Your refund is on its way.");
}

#[tokio::test]
async fn test_handoff_agent_sees_its_own_turns() {
    let triage = ScriptedAgent::new(
        "triage",
        vec![
            ScriptedAgent::transfer_turn("billing"),
            vec![ChatMessage::assistant_text("Anything else?")],
        ],
    );
    let billing = ScriptedAgent::new(
        "billing",
        vec![vec![
            ChatMessage::assistant_text("Refunded."),
            ChatMessage::tool_call("call-back", "transfer_to_triage", serde_json::json!({})),
        ]],
    );
    let (triage_agent, billing_agent) = (triage.as_agent(), billing.as_agent());

    let wf = HandoffBuilder::new(triage_agent.clone())
        .add_handoff(&triage_agent, &billing_agent, "Billing questions")
        .add_handoff(&billing_agent, &triage_agent, "Back to the front desk")
        .build()
        .unwrap();
    let result = wf.run(&"refund please".to_string()).await.unwrap();
    assert_eq!(result.status, RunStatus::Completed);

    let views = triage.views();
    assert_eq!(views.len(), 2);
    let second_view = &views[1];
    assert_eq!(second_view.len(), 4);
    assert_eq!(second_view[1].role, Role::Assistant);
    assert_eq!(second_view[1].author_name.as_deref(), Some("triage"));
    assert_eq!(second_view[2].tool_uses()[0].1, "transfer_to_billing");
    assert_eq!(second_view[3].role, Role::User);
    assert_eq!(second_view[3].author_name.as_deref(), Some("billing"));
    assert!(second_view[3].tool_uses().is_empty());
}

#[tokio::test]
async fn test_each_agent_sees_previous_replies() {
    let drafter = ScriptedAgent::replying("drafter", "draft one");
    let editor = ScriptedAgent::replying("editor", "edited");
    let wf = sequential(vec![drafter.as_agent(), editor.as_agent()]).unwrap();

    let result = wf.run(&"topic".to_string()).await.unwrap();
    assert_eq!(result.status, RunStatus::Completed);

    assert_eq!(drafter.views()[0].len(), 1);
    let editor_view = &editor.views()[0];
    assert_eq!(editor_view.len(), 2);
    assert_eq!(editor_view[1].text(), "draft one");
    assert_eq!(editor_view[1].author_name.as_deref(), Some("drafter"));

    let transcript: Vec<ChatMessage> = result.output().unwrap().unwrap();
    let texts: Vec<String> = transcript.iter().map(ChatMessage::text).collect();
    assert_eq!(texts, vec!["topic", "draft one", "edited"]);
}

#[tokio::test]
async fn test_replies_are_joined_in_agent_order() {
    let alpha = ScriptedAgent::replying("alpha", "from alpha");
    let beta = ScriptedAgent::replying("beta", "from beta");
    let wf = concurrent(vec![alpha.as_agent(), beta.as_agent()]).unwrap();

    let result = wf.run(&"question".to_string()).await.unwrap();
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(alpha.views()[0], vec![ChatMessage::user("question")]);
    assert_eq!(beta.views()[0], vec![ChatMessage::user("question")]);

    let combined: Vec<ChatMessage> = result.output().unwrap().unwrap();
    let texts: Vec<String> = combined.iter().map(ChatMessage::text).collect();
    assert_eq!(texts, vec!["from alpha", "from beta"]);
    assert!(combined.iter().all(|m| m.role == Role::Assistant));
}

#[test]
fn test_single_agent_is_rejected() {
    let only: Arc<dyn Agent> = ScriptedAgent::replying("solo", "hi");
    assert!(matches!(
        concurrent(vec![only]),
        Err(WeftError::WorkflowDefinition(_))
    ));
}
