//! # CLI Command Implementations
//!
//! This module contains the actual implementations of CLI commands.

use crate::config::{BackendKind, Config, read_bounded};
use crate::scenario::{Scenario, ScenarioRunner};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use entlink_core::{
    DistributionRole, EncodedId, LinkError, LinkReference, LinkResult, RedbStore, Residence,
    SiteId, TypeId, Value, primitives::MAX_PROPAGATION_DEPTH, reference_from_bytes,
    reference_to_bytes,
};
use std::path::Path;

// =============================================================================
// HELPERS
// =============================================================================

/// Integers become `Value::Int`, anything else `Value::Text`.
#[must_use]
pub fn parse_key(raw: &str) -> Value {
    raw.trim()
        .parse::<i64>()
        .map_or_else(|_| Value::text(raw), Value::Int)
}

pub fn parse_role(raw: &str) -> LinkResult<DistributionRole> {
    match raw.to_ascii_lowercase().as_str() {
        "owner" => Ok(DistributionRole::Owner),
        "replica" => Ok(DistributionRole::Replica),
        "forwarder" => Ok(DistributionRole::Forwarder),
        other => Err(LinkError::Serialization(format!(
            "Unknown role '{}' (expected owner, replica or forwarder)",
            other
        ))),
    }
}

/// Encode an entity reference to base64.
pub fn encode_reference(
    type_id: u32,
    key: &str,
    site: Option<u32>,
    role: DistributionRole,
) -> LinkResult<String> {
    let reference = LinkReference::Entity {
        type_id: Some(TypeId(type_id)),
        residence: site.map(|s| Residence::at(SiteId(s))),
        decoration: role.mask_bits(),
        primary_id: EncodedId::from_value(Some(&parse_key(key))),
    };
    Ok(STANDARD.encode(reference_to_bytes(&reference)?))
}

/// Decode a base64 reference.
pub fn decode_reference(data: &str) -> LinkResult<LinkReference> {
    let bytes = STANDARD
        .decode(data.trim())
        .map_err(|e| LinkError::Serialization(format!("Invalid base64: {}", e)))?;
    reference_from_bytes(&bytes)
}

fn print_json(value: &impl serde::Serialize) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_default()
    );
}

// =============================================================================
// RUN COMMAND
// =============================================================================

/// Run a scenario and print its report.
pub fn cmd_run(config_path: &Path, scenario_path: &Path, json_mode: bool) -> LinkResult<()> {
    let config = Config::load(config_path)?;
    let scenario = Scenario::parse(&read_bounded(scenario_path)?)?;

    tracing::info!(
        scenario = %scenario_path.display(),
        steps = scenario.steps.len(),
        "running scenario"
    );
    let report = ScenarioRunner::new(&config)?.run(&scenario)?;

    if json_mode {
        print_json(&report);
    } else {
        println!("{}", report);
    }

    match report.failures() {
        0 => Ok(()),
        n => Err(LinkError::Serialization(format!(
            "{} step(s) did not match their expectation",
            n
        ))),
    }
}

// =============================================================================
// ENCODE / DECODE COMMANDS
// =============================================================================

pub fn cmd_encode(
    type_id: u32,
    key: &str,
    site: Option<u32>,
    role: &str,
    json_mode: bool,
) -> LinkResult<()> {
    let encoded = encode_reference(type_id, key, site, parse_role(role)?)?;
    if json_mode {
        print_json(&serde_json::json!({ "reference": encoded }));
    } else {
        println!("{}", encoded);
    }
    Ok(())
}

pub fn cmd_decode(data: &str, json_mode: bool) -> LinkResult<()> {
    let reference = decode_reference(data)?;
    if json_mode {
        print_json(&reference);
        return Ok(());
    }

    match &reference {
        LinkReference::Site(site) => println!("Site reference: {}", site),
        LinkReference::Entity {
            type_id,
            residence,
            decoration,
            primary_id,
        } => {
            println!("Entity Reference");
            println!("================");
            println!("Type:       {:?}", type_id);
            println!("Residence:  {:?}", residence);
            println!("Role:       {:?}", reference.role());
            println!("Decoration: {:#010x}", decoration);
            println!("Primary id: {:?}", primary_id);
        }
    }
    Ok(())
}

// =============================================================================
// INSPECT COMMAND
// =============================================================================

/// List images held by the configured redb store.
pub fn cmd_inspect(config_path: &Path, json_mode: bool) -> LinkResult<()> {
    let config = Config::load(config_path)?;
    let path = match (config.storage.backend, &config.storage.path) {
        (BackendKind::Redb, Some(path)) => path.clone(),
        _ => {
            return Err(LinkError::Serialization(
                "inspect requires the redb storage backend".to_string(),
            ));
        }
    };

    let store = RedbStore::open(&path)?;
    let images = store.images()?;

    if json_mode {
        print_json(&serde_json::json!({
            "path": path.to_string_lossy(),
            "images": images,
            "stores": store.store_count()?,
            "purges": store.purge_count()?,
        }));
        return Ok(());
    }

    println!("Store:  {}", path.display());
    println!("Images: {}", images.len());
    println!("Stores: {}", store.store_count()?);
    println!("Purges: {}", store.purge_count()?);
    for image in &images {
        println!("  {:?}", image);
    }
    Ok(())
}

// =============================================================================
// CHECK-CONFIG COMMAND
// =============================================================================

pub fn cmd_check_config(config_path: &Path, json_mode: bool) -> LinkResult<()> {
    let config = Config::load(config_path)?;
    if json_mode {
        print_json(&config);
        return Ok(());
    }
    println!("Effective Configuration");
    println!("=======================");
    println!("Local site: {}", config.site());
    println!("Backend:    {:?}", config.storage.backend);
    if let Some(path) = &config.storage.path {
        println!("Path:       {}", path.display());
    }
    match config.limits.max_propagation_depth {
        Some(depth) => println!("Max depth:  {}", depth),
        None => println!("Max depth:  {} (default)", MAX_PROPAGATION_DEPTH),
    }
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_parse_as_int_or_text() {
        assert_eq!(parse_key("42"), Value::Int(42));
        assert_eq!(parse_key("abc"), Value::text("abc"));
    }

    #[test]
    fn roles_parse_case_insensitively() {
        assert_eq!(parse_role("Replica").expect("role"), DistributionRole::Replica);
        assert!(parse_role("leader").is_err());
    }

    #[test]
    fn encode_then_decode() {
        let encoded =
            encode_reference(3, "17", Some(2), DistributionRole::Forwarder).expect("encode");
        let decoded = decode_reference(&encoded).expect("decode");
        assert_eq!(decoded.site(), Some(SiteId(2)));
        assert_eq!(decoded.role(), Some(DistributionRole::Forwarder));
        assert!(matches!(
            decoded,
            LinkReference::Entity {
                primary_id: EncodedId::Narrow(17),
                ..
            }
        ));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_reference("not base64!").is_err());
        assert!(decode_reference(&STANDARD.encode(b"XXXX\x01")).is_err());
    }
}
