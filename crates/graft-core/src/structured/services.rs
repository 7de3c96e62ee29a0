//! Container-service manifest merging with host-port collision detection.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::Context;
use serde_yaml::{Mapping, Value};

use crate::error::EngineError;

/// Merge new services into the compose file.
///
/// Services already defined by name are skipped; a new service declaring a
/// host port any existing service uses aborts the merge.
pub fn merge_services(compose_path: &Path, services: &Mapping) -> anyhow::Result<()> {
    let mut compose: Mapping = if compose_path.exists() {
        let content = fs::read_to_string(compose_path)
            .with_context(|| format!("Failed to read {}", compose_path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", compose_path.display()))?
    } else {
        let mut fresh = Mapping::new();
        fresh.insert(Value::from("version"), Value::from("3"));
        fresh
    };

    let mut existing = match compose.get("services") {
        Some(Value::Mapping(map)) => map.clone(),
        _ => Mapping::new(),
    };

    let mut used_ports: BTreeSet<String> = BTreeSet::new();
    for definition in existing.values() {
        for port in host_ports(definition) {
            used_ports.insert(port);
        }
    }

    for (name, definition) in services {
        if existing.contains_key(name) {
            continue;
        }
        for port in host_ports(definition) {
            if used_ports.contains(&port) {
                let name = name.as_str().unwrap_or("<service>");
                return Err(EngineError::Incompatible(format!(
                    "Port collision: host port {port} from service \"{name}\" is already in use"
                ))
                .into());
            }
            used_ports.insert(port);
        }
        existing.insert(name.clone(), definition.clone());
    }

    compose.insert(Value::from("services"), Value::Mapping(existing));
    let output = serde_yaml::to_string(&compose).context("Failed to serialize compose file")?;
    fs::write(compose_path, output)
        .with_context(|| format!("Failed to write {}", compose_path.display()))?;
    Ok(())
}

/// Extract host ports from a service definition's `ports` list.
///
/// Mappings are `HOST:CONTAINER` (possibly with a protocol suffix) or a bare
/// port, which exposes no fixed host port.
fn host_ports(definition: &Value) -> Vec<String> {
    let mut ports = Vec::new();
    let Value::Mapping(service) = definition else {
        return ports;
    };
    let Some(Value::Sequence(entries)) = service.get("ports") else {
        return ports;
    };
    for entry in entries {
        let text = match entry {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => continue,
        };
        let parts: Vec<&str> = text.split(':').collect();
        if parts.len() >= 2 {
            ports.push(parts[0].to_string());
        }
    }
    ports
}
