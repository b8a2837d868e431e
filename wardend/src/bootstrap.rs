use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::info;

use warden_core::config::WardenConfig;
use warden_core::AgentDescriptor;
use warden_engine::scripted::ScriptedAgent;
use warden_engine::AgentClassRegistry;

/// Register every `[agents.<name>]` entry, freeze the registry, and fail
/// fast on any conflict or unresolved dependency. Startup never proceeds
/// with a partial catalogue.
pub fn build_registry(config: &WardenConfig) -> Result<Arc<AgentClassRegistry>> {
    let registry = Arc::new(AgentClassRegistry::new());

    for (name, entry) in &config.agents {
        let steps = if entry.steps.is_empty() {
            ScriptedAgent::default_script(name)
        } else {
            entry.steps.clone()
        };
        let mut descriptor = AgentDescriptor::new(
            name.clone(),
            entry.description.clone(),
            ScriptedAgent::constructor(steps),
        )
        .with_version(entry.version.clone())
        .with_dependencies(entry.dependencies.iter().cloned());
        for (key, value) in &entry.metadata {
            descriptor = descriptor.with_metadata(key.clone(), value.clone());
        }
        registry
            .register(descriptor)
            .map_err(|err| anyhow!("registering agent '{name}': {err}"))?;
    }

    registry.freeze();

    let missing = registry.validate_dependencies();
    if !missing.is_empty() {
        anyhow::bail!("unresolved agent dependencies: {missing:?}");
    }

    info!(agents = registry.len(), "agent registry frozen");
    Ok(registry)
}
