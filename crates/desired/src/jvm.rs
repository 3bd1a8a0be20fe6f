//! Heap sizing and JVM performance options, expressed as container environment.
//!
//! Explicit `-Xms`/`-Xmx` always win. Without an explicit maximum, a declared memory
//! limit turns into a dynamic heap: the container entrypoint sizes the heap from
//! `DYNAMIC_HEAP_FRACTION` of the limit, capped at `DYNAMIC_HEAP_MAX`.

use krill_core::{quantity::parse_bytes, Result};
use krill_schema::{JvmOptions, RoleSpec};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub const ENV_HEAP_OPTS: &str = "KAFKA_HEAP_OPTS";
pub const ENV_DYNAMIC_HEAP_FRACTION: &str = "DYNAMIC_HEAP_FRACTION";
pub const ENV_DYNAMIC_HEAP_MAX: &str = "DYNAMIC_HEAP_MAX";
pub const ENV_PERFORMANCE_OPTS: &str = "KAFKA_JVM_PERFORMANCE_OPTS";

/// Per-role dynamic heap policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeapPolicy {
    /// Fraction of the container memory limit given to the heap.
    pub fraction: f64,
    /// Upper bound on the dynamic heap, in bytes.
    pub max_bytes: u64,
}

/// Heap environment for one role, in a fixed order.
pub fn heap_options(jvm: Option<&JvmOptions>, memory_limit: Option<u64>, policy: &HeapPolicy, default_xms: &str) -> Vec<(String, String)> {
    let xms = jvm.and_then(|j| j.xms.as_deref()).filter(|s| !s.is_empty());
    let xmx = jvm.and_then(|j| j.xmx.as_deref()).filter(|s| !s.is_empty());
    let mut out = Vec::new();
    let mut opts = Vec::new();
    if let Some(xms) = xms {
        opts.push(format!("-Xms{}", xms));
    }
    match (xmx, memory_limit) {
        (Some(xmx), _) => opts.push(format!("-Xmx{}", xmx)),
        (None, Some(limit)) => {
            let dynamic = ((limit as f64) * policy.fraction) as u64;
            out.push((ENV_DYNAMIC_HEAP_FRACTION.to_string(), policy.fraction.to_string()));
            out.push((ENV_DYNAMIC_HEAP_MAX.to_string(), dynamic.min(policy.max_bytes).to_string()));
        }
        (None, None) if xms.is_none() => opts.push(format!("-Xms{}", default_xms)),
        (None, None) => {}
    }
    if !opts.is_empty() {
        out.insert(0, (ENV_HEAP_OPTS.to_string(), opts.join(" ")));
    }
    out
}

/// `-server` and `-XX` flags. Boolean values (or the strings "true"/"false") become `+`/`-` toggles.
pub fn performance_options(jvm: Option<&JvmOptions>) -> Option<String> {
    let jvm = jvm?;
    let mut parts = Vec::new();
    if jvm.server_enabled() {
        parts.push("-server".to_string());
    }
    for (key, value) in &jvm.xx {
        let flag = match value {
            Json::Bool(true) => format!("-XX:+{}", key),
            Json::Bool(false) => format!("-XX:-{}", key),
            Json::String(s) if s.eq_ignore_ascii_case("true") => format!("-XX:+{}", key),
            Json::String(s) if s.eq_ignore_ascii_case("false") => format!("-XX:-{}", key),
            Json::String(s) => format!("-XX:{}={}", key, s),
            other => format!("-XX:{}={}", key, other),
        };
        parts.push(flag);
    }
    if parts.is_empty() { None } else { Some(parts.join(" ")) }
}

/// Full JVM environment for a role: heap first, then performance options.
pub fn jvm_env(role: &RoleSpec, policy: &HeapPolicy, default_xms: &str) -> Result<Vec<(String, String)>> {
    let limit = match role.resources.as_ref().and_then(|r| r.limit("memory")) {
        Some(q) => Some(parse_bytes(&q)?),
        None => None,
    };
    let mut env = heap_options(role.jvm_options.as_ref(), limit, policy, default_xms);
    if let Some(perf) = performance_options(role.jvm_options.as_ref()) {
        env.push((ENV_PERFORMANCE_OPTS.to_string(), perf));
    }
    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const KAFKA: HeapPolicy = HeapPolicy { fraction: 0.5, max_bytes: 5_000_000_000 };

    fn jvm(v: serde_json::Value) -> JvmOptions { serde_json::from_value(v).unwrap() }

    fn lookup<'a>(env: &'a [(String, String)], key: &str) -> Option<&'a str> {
        env.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    #[test]
    fn explicit_bounds_disable_dynamic_heap() {
        let env = heap_options(Some(&jvm(json!({"-Xmx": "4", "-Xms": "4"}))), Some(16_000_000_000), &KAFKA, "128M");
        assert_eq!(lookup(&env, ENV_HEAP_OPTS), Some("-Xms4 -Xmx4"));
        assert_eq!(lookup(&env, ENV_DYNAMIC_HEAP_FRACTION), None);
        assert_eq!(lookup(&env, ENV_DYNAMIC_HEAP_MAX), None);
    }

    #[test]
    fn single_bound_without_limit() {
        let env = heap_options(Some(&jvm(json!({"-Xms": "4"}))), None, &KAFKA, "128M");
        assert_eq!(env, vec![(ENV_HEAP_OPTS.to_string(), "-Xms4".to_string())]);
        let env = heap_options(Some(&jvm(json!({"-Xmx": "4"}))), None, &KAFKA, "128M");
        assert_eq!(env, vec![(ENV_HEAP_OPTS.to_string(), "-Xmx4".to_string())]);
    }

    #[test]
    fn nothing_declared_uses_default_initial_heap() {
        let env = heap_options(None, None, &KAFKA, "128M");
        assert_eq!(env, vec![(ENV_HEAP_OPTS.to_string(), "-Xms128M".to_string())]);
    }

    #[test]
    fn memory_limit_with_initial_heap_goes_dynamic() {
        let env = heap_options(Some(&jvm(json!({"-Xms": "4"}))), Some(16_000_000_000), &KAFKA, "128M");
        assert_eq!(lookup(&env, ENV_HEAP_OPTS), Some("-Xms4"));
        assert_eq!(lookup(&env, ENV_DYNAMIC_HEAP_FRACTION), Some("0.5"));
        assert_eq!(lookup(&env, ENV_DYNAMIC_HEAP_MAX), Some("5000000000"));
    }

    #[test]
    fn memory_limit_alone_sets_only_dynamic_vars() {
        let policy = HeapPolicy { fraction: 0.7, max_bytes: 10_000_000_000 };
        let env = heap_options(None, Some(16_000_000_000), &policy, "128M");
        assert_eq!(lookup(&env, ENV_HEAP_OPTS), None);
        assert_eq!(lookup(&env, ENV_DYNAMIC_HEAP_FRACTION), Some("0.7"));
        assert_eq!(lookup(&env, ENV_DYNAMIC_HEAP_MAX), Some("10000000000"));
    }

    #[test]
    fn small_limit_stays_below_cap() {
        let env = heap_options(None, Some(2_000_000_000), &KAFKA, "128M");
        assert_eq!(lookup(&env, ENV_DYNAMIC_HEAP_MAX), Some("1000000000"));
    }

    #[test]
    fn performance_flags_render_in_order() {
        let o = jvm(json!({
            "-server": true,
            "-XX": {"key1": "value1", "key2": "true", "key3": false, "key4": 10}
        }));
        assert_eq!(performance_options(Some(&o)).as_deref(), Some("-server -XX:key1=value1 -XX:+key2 -XX:-key3 -XX:key4=10"));
        let o = jvm(json!({"-server": "true"}));
        assert_eq!(performance_options(Some(&o)).as_deref(), Some("-server"));
        assert_eq!(performance_options(Some(&JvmOptions::default())), None);
        assert_eq!(performance_options(None), None);
    }
}
