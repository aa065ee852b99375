// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Shared types for the agent session runtime.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fine-grained phase of one live session, persisted per (namespace, task).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionSubstate {
    #[default]
    Idle,
    Running,
    AwaitingPermission,
    AwaitingUser,
}

impl ExecutionSubstate {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionSubstate::Idle => "idle",
            ExecutionSubstate::Running => "running",
            ExecutionSubstate::AwaitingPermission => "awaiting_permission",
            ExecutionSubstate::AwaitingUser => "awaiting_user",
        }
    }

    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Any state may drop to `Idle`, and re-writing the current state is a
    /// no-op. `AwaitingUser -> Running` covers follow-up prompts.
    pub fn can_transition_to(&self, next: ExecutionSubstate) -> bool {
        use ExecutionSubstate::*;

        if *self == next || next == Idle {
            return true;
        }
        matches!(
            (self, next),
            (Idle, Running)
                | (Running, AwaitingPermission)
                | (Running, AwaitingUser)
                | (AwaitingPermission, Running)
                | (AwaitingUser, Running)
        )
    }
}

impl fmt::Display for ExecutionSubstate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionSubstate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(ExecutionSubstate::Idle),
            "running" => Ok(ExecutionSubstate::Running),
            "awaiting_permission" => Ok(ExecutionSubstate::AwaitingPermission),
            "awaiting_user" => Ok(ExecutionSubstate::AwaitingUser),
            other => Err(format!("unknown substate: {}", other)),
        }
    }
}

/// Out-of-band command delivered through the control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AcpCommand {
    Prompt { text: String },
    Permission { option_id: String },
    Cancel,
    Stop,
}

impl AcpCommand {
    pub fn prompt(text: impl Into<String>) -> Self {
        AcpCommand::Prompt { text: text.into() }
    }

    pub fn permission(option_id: impl Into<String>) -> Self {
        AcpCommand::Permission {
            option_id: option_id.into(),
        }
    }

    /// Tag name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            AcpCommand::Prompt { .. } => "prompt",
            AcpCommand::Permission { .. } => "permission",
            AcpCommand::Cancel => "cancel",
            AcpCommand::Stop => "stop",
        }
    }
}

/// Kind of a logged protocol event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PromptSent,
    PromptError,
    TurnEnd,
    PermissionRequest,
    PermissionSelected,
    PermissionCancelled,
    AgentMessageChunk,
    AgentThoughtChunk,
    ToolCall,
    ToolCallUpdate,
    UserMessageChunk,
    Plan,
    ModeUpdate,
    AvailableCommands,
    SessionUpdate,
}

impl EventType {
    /// Map a protocol `sessionUpdate` tag to an event type.
    pub fn classify(tag: &str) -> EventType {
        match tag {
            "agent_message_chunk" => EventType::AgentMessageChunk,
            "agent_thought_chunk" => EventType::AgentThoughtChunk,
            "tool_call" => EventType::ToolCall,
            "tool_call_update" => EventType::ToolCallUpdate,
            "user_message_chunk" => EventType::UserMessageChunk,
            "plan" => EventType::Plan,
            "current_mode_update" | "mode_update" => EventType::ModeUpdate,
            "available_commands_update" | "available_commands" => EventType::AvailableCommands,
            _ => EventType::SessionUpdate,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PromptSent => "prompt_sent",
            EventType::PromptError => "prompt_error",
            EventType::TurnEnd => "turn_end",
            EventType::PermissionRequest => "permission_request",
            EventType::PermissionSelected => "permission_selected",
            EventType::PermissionCancelled => "permission_cancelled",
            EventType::AgentMessageChunk => "agent_message_chunk",
            EventType::AgentThoughtChunk => "agent_thought_chunk",
            EventType::ToolCall => "tool_call",
            EventType::ToolCallUpdate => "tool_call_update",
            EventType::UserMessageChunk => "user_message_chunk",
            EventType::Plan => "plan",
            EventType::ModeUpdate => "mode_update",
            EventType::AvailableCommands => "available_commands",
            EventType::SessionUpdate => "session_update",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logged protocol event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcpEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub session_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl AcpEvent {
    /// Create an event stamped with the current UTC time.
    pub fn new(event_type: EventType, session_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            session_id: session_id.into(),
            payload,
        }
    }
}

/// How a prompt turn ended, as reported by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnEnd {
    EndTurn,
    MaxTokens,
    MaxTurnRequests,
    Refusal,
    Cancelled,
}

impl TurnEnd {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnEnd::EndTurn => "end_turn",
            TurnEnd::MaxTokens => "max_tokens",
            TurnEnd::MaxTurnRequests => "max_turn_requests",
            TurnEnd::Refusal => "refusal",
            TurnEnd::Cancelled => "cancelled",
        }
    }
}

/// One option offered by a permission request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionOption {
    pub id: String,
    pub name: String,
}

impl PermissionOption {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Inbound permission request, stripped of protocol framing.
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionRequest {
    pub options: Vec<PermissionOption>,
    /// Full request as received, for the event log.
    pub payload: serde_json::Value,
}

impl PermissionRequest {
    pub fn new(options: Vec<PermissionOption>) -> Self {
        let payload = serde_json::json!({ "options": options });
        Self { options, payload }
    }

    pub fn offers(&self, option_id: &str) -> bool {
        self.options.iter().any(|o| o.id == option_id)
    }
}

/// Answer to a permission request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionOutcome {
    Selected(String),
    Cancelled,
}
