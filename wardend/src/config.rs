use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use warden_core::config::WardenConfig;

/// Load and deserialize config from a TOML file.
pub fn load_config(path: &Path) -> Result<WardenConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config: {}", path.display()))?;
    let config: WardenConfig =
        toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))?;
    Ok(config)
}

/// Validate config for internal consistency:
/// - agent dependency lists reference agents that are defined
/// - queue/buffer capacities and step ceiling are non-zero
/// - the bind address parses
pub fn validate_config(config: &WardenConfig) -> Result<()> {
    for (name, entry) in &config.agents {
        for dep in &entry.dependencies {
            if !config.agents.contains_key(dep) {
                anyhow::bail!(
                    "agent '{name}' depends on '{dep}' which is not defined in [agents]"
                );
            }
        }
    }

    if config.engine.max_steps == 0 {
        anyhow::bail!("engine.max_steps must be at least 1");
    }
    if config.engine.run_timeout_secs == 0 {
        anyhow::bail!("engine.run_timeout_secs must be at least 1");
    }
    if config.gateway.connection_queue_capacity == 0 {
        anyhow::bail!("gateway.connection_queue_capacity must be at least 1");
    }
    if config.gateway.buffer_capacity == 0 {
        anyhow::bail!("gateway.buffer_capacity must be at least 1");
    }
    if config.server.run_index_capacity == 0 {
        anyhow::bail!("server.run_index_capacity must be at least 1");
    }

    config
        .server
        .bind_addr
        .parse::<SocketAddr>()
        .with_context(|| format!("server.bind_addr '{}' is not a socket address", config.server.bind_addr))?;

    info!("config validation passed");
    Ok(())
}
