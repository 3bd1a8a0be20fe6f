use std::collections::BTreeSet;

use krill_core::{quantity::parse_bytes, Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::{ClusterSpec, RoleSpec, Storage};

static DNS_LABEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static regex"));
static LISTENER_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]{1,11}$").expect("static regex"));

/// Ports used by inter-broker replication and metrics; listeners may not claim them.
const RESERVED_PORTS: [u16; 2] = [9091, 9404];

/// Cluster names end up as prefixes of derived object names (`<name>-zookeeper-nodes` etc.).
const MAX_CLUSTER_NAME: usize = 40;

/// Enforce the invariants the desired-state builder assumes.
pub fn validate(spec: &ClusterSpec) -> Result<()> {
    let name = &spec.key.name;
    if name.len() > MAX_CLUSTER_NAME || !DNS_LABEL.is_match(name) {
        return Err(Error::invalid_spec(format!("cluster name '{}' must be a DNS label of at most {} characters", name, MAX_CLUSTER_NAME)));
    }
    validate_role("kafka", &spec.kafka.role)?;
    validate_role("zookeeper", &spec.zookeeper.role)?;

    let mut names = BTreeSet::new();
    let mut ports = BTreeSet::new();
    for l in &spec.kafka.listeners {
        if !LISTENER_NAME.is_match(&l.name) {
            return Err(Error::invalid_spec(format!("listener name '{}' must be 1-11 lowercase alphanumerics", l.name)));
        }
        if !names.insert(l.name.as_str()) {
            return Err(Error::invalid_spec(format!("duplicate listener name '{}'", l.name)));
        }
        if RESERVED_PORTS.contains(&l.port) || l.port < 1024 {
            return Err(Error::invalid_spec(format!("listener '{}' uses reserved port {}", l.name, l.port)));
        }
        if !ports.insert(l.port) {
            return Err(Error::invalid_spec(format!("listener port {} declared twice", l.port)));
        }
    }
    debug!(cluster = %spec.key, generation = spec.generation, "spec validated");
    Ok(())
}

fn validate_role(role: &str, r: &RoleSpec) -> Result<()> {
    if r.replicas < 1 {
        return Err(Error::invalid_spec(format!("{}.replicas must be at least 1 (got {})", role, r.replicas)));
    }
    match &r.storage {
        Storage::PersistentClaim { size, .. } => { parse_bytes(size)?; }
        Storage::Ephemeral { size_limit: Some(limit) } if !limit.is_empty() => { parse_bytes(limit)?; }
        Storage::Ephemeral { .. } => {}
    }
    if let Some(res) = &r.resources {
        for key in ["memory"] {
            if let Some(v) = res.limit(key) { parse_bytes(&v)?; }
            if let Some(v) = res.request(key) { parse_bytes(&v)?; }
        }
    }
    Ok(())
}

/// Storage may grow but never shrink, and neither its type nor its class may change.
///
/// A class change is refused rather than rolled: existing claims keep their class, so a new
/// claim template would only apply to members created later and the role would end up on
/// mixed storage. `deleteClaim` is free to change.
pub fn check_storage_transition(role: &str, previous: &Storage, next: &Storage) -> Result<()> {
    match (previous, next) {
        (
            Storage::PersistentClaim { size: old_size, class: old_class, .. },
            Storage::PersistentClaim { size: new_size, class: new_class, .. },
        ) => {
            if parse_bytes(new_size)? < parse_bytes(old_size)? {
                return Err(Error::invalid_spec(format!("{} storage cannot shrink from {} to {}", role, old_size, new_size)));
            }
            if old_class != new_class {
                return Err(Error::invalid_spec(format!(
                    "{} storage class cannot change from {:?} to {:?}",
                    role, old_class, new_class
                )));
            }
            Ok(())
        }
        (Storage::Ephemeral { .. }, Storage::Ephemeral { .. }) => Ok(()),
        _ => Err(Error::invalid_spec(format!("{} storage type cannot change once the cluster exists", role))),
    }
}
