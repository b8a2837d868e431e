use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Top-level daemon configuration, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WardenConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Agent types registered at startup, keyed by name.
    #[serde(default)]
    pub agents: HashMap<String, AgentEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Finished run records retained for status queries; the oldest are
    /// evicted beyond this. Live runs are never evicted.
    #[serde(default = "default_run_index_capacity")]
    pub run_index_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            run_index_capacity: default_run_index_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Step ceiling per run; exceeding it fails the run.
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    /// Wall-clock bound per run.
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            run_timeout_secs: default_run_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Bounded outgoing queue per connection.
    #[serde(default = "default_connection_queue_capacity")]
    pub connection_queue_capacity: usize,
    /// Bounded reconnect buffer per user with no live connection.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Buffered events older than this are pruned.
    #[serde(default = "default_buffer_ttl_secs")]
    pub buffer_ttl_secs: u64,
    /// How long a publish may wait on one full connection queue before
    /// dropping the event for that connection.
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            connection_queue_capacity: default_connection_queue_capacity(),
            buffer_capacity: default_buffer_capacity(),
            buffer_ttl_secs: default_buffer_ttl_secs(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
        }
    }
}

/// One `[agents.<name>]` table entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEntry {
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_agent_version")]
    pub version: String,
    /// Names of other agent types this one depends on.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Deterministic step script for the builtin scripted agent. Empty
    /// means the default think-then-finish script.
    #[serde(default)]
    pub steps: Vec<ScriptStep>,
}

/// One step of a scripted agent, as written in config or tests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScriptStep {
    Thinking {
        text: String,
    },
    Tool {
        tool: String,
        #[serde(default)]
        arguments: serde_json::Value,
    },
    Finish {
        summary: String,
    },
    /// Fail the run with an agent-level error.
    Fail {
        message: String,
    },
}

impl Default for AgentEntry {
    fn default() -> Self {
        Self {
            description: String::new(),
            version: default_agent_version(),
            dependencies: Vec::new(),
            metadata: HashMap::new(),
            steps: Vec::new(),
        }
    }
}

fn default_agent_version() -> String {
    "1.0.0".to_string()
}

fn default_bind_addr() -> String {
    "127.0.0.1:7411".to_string()
}

fn default_run_index_capacity() -> usize {
    1024
}

fn default_max_steps() -> u32 {
    32
}

fn default_run_timeout_secs() -> u64 {
    300
}

fn default_connection_queue_capacity() -> usize {
    64
}

fn default_buffer_capacity() -> usize {
    256
}

fn default_buffer_ttl_secs() -> u64 {
    60
}

fn default_delivery_timeout_ms() -> u64 {
    100
}
