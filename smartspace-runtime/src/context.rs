//! Model context assembly.
//!
//! A run's working memory is rebuilt from its own event log on every step,
//! so a resumed or recovered run sees exactly what an uninterrupted one
//! would. Calls are grouped by the step that requested them.

use smartspace_core::{AgentProfile, Event, EventPayload, IdentityId};
use smartspace_llm::{ContextMessage, ToolCallRequest};
use std::collections::HashMap;

/// How a call ended, as far as the model is concerned.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Result {
        result: serde_json::Value,
        is_error: bool,
    },
    Failed(String),
    Expired,
}

impl CallOutcome {
    fn render(&self) -> String {
        match self {
            CallOutcome::Result { result, .. } => result.to_string(),
            CallOutcome::Failed(reason) => serde_json::json!({ "error": reason }).to_string(),
            CallOutcome::Expired => {
                serde_json::json!({ "error": "tool call expired without a result" }).to_string()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptCall {
    pub request: ToolCallRequest,
    pub outcome: Option<CallOutcome>,
}

/// Steps and tool traffic of one run, folded from its event log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunTranscript {
    /// Completed reasoning steps.
    pub steps: u32,
    /// Calls grouped by the step that requested them, oldest first.
    pub batches: Vec<Vec<TranscriptCall>>,
}

impl RunTranscript {
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut transcript = RunTranscript::default();
        let mut current: Vec<TranscriptCall> = Vec::new();
        let mut index: HashMap<String, (usize, usize)> = HashMap::new();

        for event in events {
            match &event.payload {
                EventPayload::RunStep { step, .. } => {
                    transcript.steps = transcript.steps.max(*step);
                    if !current.is_empty() {
                        transcript.batches.push(std::mem::take(&mut current));
                    }
                }
                EventPayload::ToolCallRequested {
                    call_id,
                    tool_name,
                    args,
                    ..
                } => {
                    index.insert(call_id.clone(), (transcript.batches.len(), current.len()));
                    current.push(TranscriptCall {
                        request: ToolCallRequest::new(
                            call_id.clone(),
                            tool_name.clone(),
                            args.clone(),
                        ),
                        outcome: None,
                    });
                }
                EventPayload::ToolResultRecorded {
                    call_id,
                    result,
                    is_error,
                    ..
                } => {
                    let outcome = CallOutcome::Result {
                        result: result.clone(),
                        is_error: *is_error,
                    };
                    set_outcome(&mut transcript, &mut current, &index, call_id, outcome, true);
                }
                EventPayload::ToolCallFailed { call_id, reason, .. } => {
                    let outcome = CallOutcome::Failed(reason.clone());
                    set_outcome(&mut transcript, &mut current, &index, call_id, outcome, false);
                }
                EventPayload::ToolCallExpired { call_id, .. } => {
                    set_outcome(
                        &mut transcript,
                        &mut current,
                        &index,
                        call_id,
                        CallOutcome::Expired,
                        false,
                    );
                }
                _ => {}
            }
        }
        if !current.is_empty() {
            transcript.batches.push(current);
        }
        transcript
    }

    /// Total calls requested so far.
    pub fn call_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    pub fn calls(&self) -> impl Iterator<Item = &TranscriptCall> {
        self.batches.iter().flatten()
    }
}

/// Record `outcome` for `call_id`. A recorded result always wins over a
/// failure or expiry, and a later result replaces an earlier one.
fn set_outcome(
    transcript: &mut RunTranscript,
    current: &mut [TranscriptCall],
    index: &HashMap<String, (usize, usize)>,
    call_id: &str,
    outcome: CallOutcome,
    is_result: bool,
) {
    let Some(&(batch, pos)) = index.get(call_id) else {
        return;
    };
    let slot = if batch == transcript.batches.len() {
        current.get_mut(pos)
    } else {
        transcript.batches.get_mut(batch).and_then(|b| b.get_mut(pos))
    };
    if let Some(call) = slot {
        let has_result = matches!(call.outcome, Some(CallOutcome::Result { .. }));
        if is_result || !has_result {
            call.outcome = Some(outcome);
        }
    }
}

/// Assemble the messages handed to the model.
///
/// `timeline` is the slice of space messages the run may see; `names` maps
/// senders to display names.
pub fn build_messages(
    profile: &AgentProfile,
    agent_id: IdentityId,
    timeline: &[Event],
    names: &HashMap<IdentityId, String>,
    transcript: &RunTranscript,
) -> Vec<ContextMessage> {
    let mut messages = Vec::with_capacity(timeline.len() + transcript.call_count() * 2 + 1);
    if !profile.system_prompt.is_empty() {
        messages.push(ContextMessage::system(profile.system_prompt.clone()));
    }

    let named = |msg: ContextMessage, sender: &IdentityId| match names.get(sender) {
        Some(name) => msg.with_name(name.clone()),
        None => msg,
    };

    for event in timeline {
        match &event.payload {
            EventPayload::UserMessage { sender, content } => {
                messages.push(named(ContextMessage::user(content.clone()), sender));
            }
            EventPayload::AssistantMessage {
                sender, content, ..
            } if *sender == agent_id => {
                messages.push(ContextMessage::assistant(content.clone()));
            }
            EventPayload::AssistantMessage {
                sender, content, ..
            } => {
                messages.push(named(ContextMessage::user(content.clone()), sender));
            }
            EventPayload::SystemMessage { content, .. } => {
                messages.push(ContextMessage::system(content.clone()));
            }
            _ => {}
        }
    }

    for batch in &transcript.batches {
        let requests = batch.iter().map(|c| c.request.clone()).collect();
        messages.push(ContextMessage::assistant_tool_calls(requests));
        for call in batch {
            let content = call
                .outcome
                .as_ref()
                .map(CallOutcome::render)
                .unwrap_or_else(|| serde_json::json!({ "error": "no result" }).to_string());
            messages.push(ContextMessage::tool(call.request.call_id.clone(), content));
        }
    }

    messages
}
