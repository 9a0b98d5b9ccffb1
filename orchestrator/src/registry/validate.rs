//! Service spec validation

use std::collections::{BTreeMap, HashMap};

use crate::errors::OrchestratorError;
use crate::models::service::ServiceSpec;

const MAX_NAME_LEN: usize = 63;

fn invalid(msg: impl Into<String>) -> OrchestratorError {
    OrchestratorError::InvalidSpec(msg.into())
}

/// Check a single spec in isolation
pub fn validate_spec(spec: &ServiceSpec) -> Result<(), OrchestratorError> {
    validate_name(&spec.name)?;

    if spec.image.repository.trim().is_empty() {
        return Err(invalid(format!("{}: image repository is empty", spec.name)));
    }
    if spec.port == 0 {
        return Err(invalid(format!("{}: port must be non-zero", spec.name)));
    }
    if spec.networks.is_empty() {
        return Err(invalid(format!("{}: at least one network is required", spec.name)));
    }
    for network in &spec.networks {
        if network.trim().is_empty() {
            return Err(invalid(format!("{}: empty network name", spec.name)));
        }
    }
    if spec.depends_on.iter().any(|d| d == &spec.name) {
        return Err(invalid(format!("{}: service depends on itself", spec.name)));
    }

    if let Some(route) = &spec.route {
        let host_ok = !route.host.is_empty()
            && !route.host.contains(|c: char| c.is_whitespace() || c == '`');
        if !host_ok {
            return Err(invalid(format!("{}: invalid route host {:?}", spec.name, route.host)));
        }
        if route.entrypoint.trim().is_empty() {
            return Err(invalid(format!("{}: route entrypoint is empty", spec.name)));
        }
    }

    let hc = &spec.health_check;
    if hc.retries == 0 {
        return Err(invalid(format!("{}: health check retries must be at least 1", spec.name)));
    }
    if hc.interval.is_zero() || hc.timeout.is_zero() {
        return Err(invalid(format!(
            "{}: health check interval and timeout must be non-zero",
            spec.name
        )));
    }
    if hc.http.is_some() && hc.command.is_some() {
        return Err(invalid(format!(
            "{}: health check takes either http or command, not both",
            spec.name
        )));
    }
    if let Some(path) = &hc.http {
        if !path.starts_with('/') {
            return Err(invalid(format!("{}: health check path must start with '/'", spec.name)));
        }
    }
    if let Some(cmd) = &hc.command {
        if cmd.is_empty() {
            return Err(invalid(format!("{}: health check command is empty", spec.name)));
        }
    }

    Ok(())
}

fn validate_name(name: &str) -> Result<(), OrchestratorError> {
    let mut chars = name.chars();
    let first_ok = chars
        .next()
        .map(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .unwrap_or(false);
    let rest_ok = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');

    if name.is_empty() {
        return Err(invalid("service name is empty"));
    }
    if !first_ok || !rest_ok || name.len() > MAX_NAME_LEN {
        return Err(invalid(format!(
            "invalid service name {name:?}: use lowercase letters, digits, '-' and '_'"
        )));
    }
    Ok(())
}

/// Check cross-service constraints over the whole registry
pub fn validate_graph(specs: &BTreeMap<String, ServiceSpec>) -> Result<(), OrchestratorError> {
    // Unique port per network
    let mut claimed: HashMap<(&str, u16), &str> = HashMap::new();
    for spec in specs.values() {
        for network in &spec.networks {
            if let Some(other) = claimed.insert((network.as_str(), spec.port), spec.name.as_str()) {
                return Err(invalid(format!(
                    "port {} on network {} is used by both {} and {}",
                    spec.port, network, other, spec.name
                )));
            }
        }
    }

    // Resolvable dependencies
    for spec in specs.values() {
        for dep in &spec.depends_on {
            if !specs.contains_key(dep) {
                return Err(invalid(format!(
                    "{}: unknown dependency {}",
                    spec.name, dep
                )));
            }
        }
    }

    if let Some(cycle) = find_cycle(specs) {
        return Err(invalid(format!("dependency cycle: {}", cycle.join(" -> "))));
    }

    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

fn find_cycle(specs: &BTreeMap<String, ServiceSpec>) -> Option<Vec<String>> {
    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut path: Vec<&str> = Vec::new();

    for name in specs.keys() {
        if let Some(cycle) = visit(name, specs, &mut marks, &mut path) {
            return Some(cycle);
        }
    }
    None
}

fn visit<'a>(
    name: &'a str,
    specs: &'a BTreeMap<String, ServiceSpec>,
    marks: &mut HashMap<&'a str, Mark>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    match marks.get(name) {
        Some(Mark::Done) => return None,
        Some(Mark::Visiting) => {
            let start = path.iter().position(|n| *n == name).unwrap_or(0);
            let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
            cycle.push(name.to_string());
            return Some(cycle);
        }
        None => {}
    }

    marks.insert(name, Mark::Visiting);
    path.push(name);

    if let Some(spec) = specs.get(name) {
        for dep in &spec.depends_on {
            if let Some(cycle) = visit(dep, specs, marks, path) {
                return Some(cycle);
            }
        }
    }

    path.pop();
    marks.insert(name, Mark::Done);
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, port: u16, deps: &[&str]) -> ServiceSpec {
        let mut spec: ServiceSpec = serde_yaml::from_str(&format!(
            "name: {name}\nimage: acme/{name}:1\nnetworks: [internal]\nport: {port}\n"
        ))
        .unwrap();
        spec.depends_on = deps.iter().map(|d| d.to_string()).collect();
        spec
    }

    fn graph(specs: Vec<ServiceSpec>) -> BTreeMap<String, ServiceSpec> {
        specs.into_iter().map(|s| (s.name.clone(), s)).collect()
    }

    #[test]
    fn test_rejects_bad_names() {
        for name in ["", "Api", "-api", "api service", "api.v2"] {
            let mut s = spec("api", 80, &[]);
            s.name = name.to_string();
            assert!(validate_spec(&s).is_err(), "{name:?} should be rejected");
        }
        assert!(validate_spec(&spec("api-2_x", 80, &[])).is_ok());
    }

    #[test]
    fn test_rejects_bad_health_check() {
        let mut s = spec("api", 80, &[]);
        s.health_check.retries = 0;
        assert!(validate_spec(&s).is_err());

        let mut s = spec("api", 80, &[]);
        s.health_check.http = Some("healthz".into());
        assert!(validate_spec(&s).is_err());

        let mut s = spec("api", 80, &[]);
        s.health_check.http = Some("/healthz".into());
        s.health_check.command = Some(vec!["true".into()]);
        assert!(validate_spec(&s).is_err());
    }

    #[test]
    fn test_port_unique_per_network() {
        let g = graph(vec![spec("a", 80, &[]), spec("b", 80, &[])]);
        let err = validate_graph(&g).unwrap_err();
        assert!(err.to_string().contains("port 80"));

        let mut b = spec("b", 80, &[]);
        b.networks = vec!["other".into()];
        assert!(validate_graph(&graph(vec![spec("a", 80, &[]), b])).is_ok());
    }

    #[test]
    fn test_unknown_dependency() {
        let g = graph(vec![spec("api", 80, &["db"])]);
        assert!(matches!(validate_graph(&g), Err(OrchestratorError::InvalidSpec(_))));
    }

    #[test]
    fn test_dependency_cycle() {
        let g = graph(vec![
            spec("a", 1, &["b"]),
            spec("b", 2, &["c"]),
            spec("c", 3, &["a"]),
        ]);
        let err = validate_graph(&g).unwrap_err().to_string();
        assert!(err.contains("a -> b -> c -> a"), "{err}");
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let g = graph(vec![
            spec("db", 1, &[]),
            spec("cache", 2, &["db"]),
            spec("api", 3, &["db", "cache"]),
        ]);
        assert!(validate_graph(&g).is_ok());
    }
}
