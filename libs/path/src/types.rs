//! Typed runtime ID definitions.
//!
//! Tasks and deployments are runtime artifacts, not declarative state, so
//! they get opaque ULID-based IDs rather than tree paths.

use crate::define_id;

define_id!(TaskId, "task");
define_id!(DeploymentId, "deploy");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_roundtrip() {
        let id = TaskId::new();
        let parsed = TaskId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_parse_rejects_wrong_prefix() {
        let id = TaskId::new();
        let err = DeploymentId::parse(&id.to_string()).unwrap_err();
        assert!(matches!(err, crate::PathError::InvalidPrefix { .. }));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(TaskId::parse("").is_err());
        assert!(TaskId::parse("task").is_err());
        assert!(TaskId::parse("task_notaulid").is_err());
    }

    #[test]
    fn test_ids_sort_by_creation_time() {
        let a = DeploymentId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = DeploymentId::new();
        assert!(a < b);
    }
}
