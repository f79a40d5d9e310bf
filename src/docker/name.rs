//! Container name codec
//!
//! Containers owned by the agent are named `mesos-<slaveId>.<containerId>`,
//! with executor helper containers carrying an additional `.executor` token.
//! The legacy form `mesos-<containerId>` (no slave id) is still parsed for
//! one deprecation cycle, and the Docker API is inconsistent about a leading
//! slash on names, so both forms are accepted.

use crate::types::{ContainerId, SlaveId};

/// Prefix identifying containers owned by the agent.
pub const NAME_PREFIX: &str = "mesos-";

/// Token appended to executor helper container names.
pub const EXECUTOR_SUFFIX: &str = "executor";

/// Name of the container running the executor's workload.
pub fn container_name(slave_id: &SlaveId, container_id: &ContainerId) -> String {
    format!("{}{}.{}", NAME_PREFIX, slave_id, container_id)
}

/// Name of the container running the executor helper (nested-in-Docker mode).
pub fn executor_name(slave_id: &SlaveId, container_id: &ContainerId) -> String {
    format!("{}.{}", container_name(slave_id, container_id), EXECUTOR_SUFFIX)
}

/// A successfully decoded container name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    /// The container this name belongs to
    pub container_id: ContainerId,

    /// True for the `.executor` helper container
    pub executor: bool,

    /// True for the deprecated `mesos-<containerId>` form
    pub legacy: bool,
}

/// Decode a Docker container name.
///
/// Returns `None` for names this agent does not own; such containers must be
/// ignored during recovery.
pub fn parse(name: &str) -> Option<ParsedName> {
    let name = name.strip_prefix('/').unwrap_or(name);
    let rest = name.strip_prefix(NAME_PREFIX)?;

    let mut segments: Vec<&str> = rest.split('.').collect();

    let executor = segments.last() == Some(&EXECUTOR_SUFFIX);
    if executor {
        segments.pop();
    }

    // The container id is the last non-executor segment; a single remaining
    // segment means the legacy slave-less form.
    let container_id = match segments.as_slice() {
        [id] if !id.is_empty() => ContainerId(id.to_string()),
        [slave, id] if !slave.is_empty() && !id.is_empty() => ContainerId(id.to_string()),
        _ => return None,
    };

    Some(ParsedName {
        container_id,
        executor,
        legacy: segments.len() == 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slave() -> SlaveId {
        SlaveId::from("s1")
    }

    fn container() -> ContainerId {
        ContainerId::from("c-42")
    }

    #[test]
    fn test_round_trip() {
        let name = container_name(&slave(), &container());
        assert_eq!(name, "mesos-s1.c-42");

        let parsed = parse(&name).unwrap();
        assert_eq!(parsed.container_id, container());
        assert!(!parsed.executor);
        assert!(!parsed.legacy);
    }

    #[test]
    fn test_executor_round_trip() {
        let name = executor_name(&slave(), &container());
        assert_eq!(name, "mesos-s1.c-42.executor");

        let parsed = parse(&name).unwrap();
        assert_eq!(parsed.container_id, container());
        assert!(parsed.executor);
    }

    #[test]
    fn test_leading_slash() {
        let parsed = parse("/mesos-s1.c-42").unwrap();
        assert_eq!(parsed.container_id, container());
    }

    #[test]
    fn test_legacy_form() {
        let parsed = parse("mesos-c-42").unwrap();
        assert_eq!(parsed.container_id, container());
        assert!(parsed.legacy);
        assert!(!parsed.executor);

        let parsed = parse("mesos-c-42.executor").unwrap();
        assert_eq!(parsed.container_id, container());
        assert!(parsed.legacy);
        assert!(parsed.executor);
    }

    #[test]
    fn test_foreign_names_rejected() {
        assert_eq!(parse("redis"), None);
        assert_eq!(parse("/registry"), None);
        assert_eq!(parse("mesos-"), None);
        assert_eq!(parse("mesos-s1.c1.c2.executor"), None);
        assert_eq!(parse("mesos-.c1"), None);
    }
}
