//! Deterministic scripted agent.
//!
//! Plays back a fixed list of [`ScriptStep`]s, one per engine step. Used by
//! the daemon's builtin registration (scripts come from the `[agents]`
//! config tables) and by tests that need predictable lifecycles.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use warden_core::config::ScriptStep;
use warden_core::descriptor::AgentConstructor;
use warden_core::{Agent, AgentStep, ExecutionContext, WardenError};

pub struct ScriptedAgent {
    steps: VecDeque<ScriptStep>,
}

impl ScriptedAgent {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps: steps.into(),
        }
    }

    /// Constructor closure for registry descriptors. Each run gets a fresh
    /// playback of the same script.
    pub fn constructor(steps: Vec<ScriptStep>) -> AgentConstructor {
        Arc::new(move || Box::new(ScriptedAgent::new(steps.clone())))
    }

    /// The script used when a config entry declares no steps.
    pub fn default_script(agent_name: &str) -> Vec<ScriptStep> {
        vec![
            ScriptStep::Thinking {
                text: format!("{agent_name} is considering the request"),
            },
            ScriptStep::Finish {
                summary: format!("{agent_name} finished"),
            },
        ]
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn next_step(&mut self, _context: &ExecutionContext) -> Result<AgentStep, WardenError> {
        match self.steps.pop_front() {
            Some(ScriptStep::Thinking { text }) => Ok(AgentStep::Thinking { text }),
            Some(ScriptStep::Tool { tool, arguments }) => {
                Ok(AgentStep::ToolCall { tool, arguments })
            }
            Some(ScriptStep::Finish { summary }) => Ok(AgentStep::Finish { summary }),
            Some(ScriptStep::Fail { message }) => {
                Err(WardenError::EngineExecutionFailure(message))
            }
            // A script that runs off the end still terminates the run.
            None => Ok(AgentStep::Finish {
                summary: "script exhausted".to_string(),
            }),
        }
    }

    async fn run_tool(
        &mut self,
        _context: &ExecutionContext,
        tool: &str,
        arguments: &serde_json::Value,
    ) -> Result<serde_json::Value, WardenError> {
        Ok(json!({ "tool": tool, "echo": arguments }))
    }
}
