//! Conversation threads
//!
//! A thread is the append-only audit trail of one request: every message,
//! every run submitted against it, and every run event, in creation order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::{EventLog, RunEvent};

/// Message role in a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Agent,
    Tool,
}

/// A message in a thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,

    /// Position in the thread, starting at 1
    pub seq: u64,

    pub role: MessageRole,

    pub content: String,

    /// Run that produced or consumed this message
    pub run_id: Option<Uuid>,

    /// Agent that wrote the message (agent messages only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    /// Tool call answered by this message (tool messages only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    pub created_at: DateTime<Utc>,
}

/// Record of a run submitted against a thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub run_id: Uuid,
    pub agent_name: String,
    /// Run that delegated to this one
    pub parent_run_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// An append-only conversation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    id: Uuid,
    messages: Vec<Message>,
    runs: Vec<RunRecord>,
    events: EventLog,
}

impl Thread {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            messages: Vec::new(),
            runs: Vec::new(),
            events: EventLog::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn runs(&self) -> &[RunRecord] {
        &self.runs
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Most recent message written by an agent
    pub fn last_agent_message(&self) -> Option<&Message> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::Agent)
    }

    pub(crate) fn append_user(&mut self, content: &str, run_id: Uuid) -> &Message {
        self.append(MessageRole::User, content, Some(run_id), None, None)
    }

    pub(crate) fn append_agent(&mut self, author: &str, content: &str, run_id: Uuid) -> &Message {
        self.append(
            MessageRole::Agent,
            content,
            Some(run_id),
            Some(author.to_string()),
            None,
        )
    }

    pub(crate) fn append_tool(&mut self, tool_call_id: &str, content: &str, run_id: Uuid) -> &Message {
        self.append(
            MessageRole::Tool,
            content,
            Some(run_id),
            None,
            Some(tool_call_id.to_string()),
        )
    }

    pub(crate) fn record_run(&mut self, record: RunRecord) {
        self.runs.push(record);
    }

    pub(crate) fn record_event(&mut self, event: RunEvent) -> u64 {
        self.events.push(event)
    }

    fn append(
        &mut self,
        role: MessageRole,
        content: &str,
        run_id: Option<Uuid>,
        author: Option<String>,
        tool_call_id: Option<String>,
    ) -> &Message {
        let seq = self.messages.len() as u64 + 1;
        self.messages.push(Message {
            id: Uuid::new_v4(),
            seq,
            role,
            content: content.to_string(),
            run_id,
            author,
            tool_call_id,
            created_at: Utc::now(),
        });
        &self.messages[self.messages.len() - 1]
    }
}

impl Default for Thread {
    fn default() -> Self {
        Self::new()
    }
}
