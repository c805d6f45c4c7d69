//! Typed identifier definitions.

use crate::{define_id, define_name, IdError};

// =============================================================================
// Names
// =============================================================================

define_name!(ProviderId);
define_name!(WorkerGroup);
define_name!(WorkerId);

// =============================================================================
// Generated IDs
// =============================================================================

define_id!(ErrorId, "err");
define_id!(CredentialId, "cred");
define_id!(RequestId, "req");

// =============================================================================
// Worker Pool ID
// =============================================================================

/// Identity of a worker pool: `{provisioner}/{worker_type}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerPoolId {
    provisioner: String,
    worker_type: String,
}

impl WorkerPoolId {
    /// Builds a pool id from its two halves.
    pub fn new(provisioner: &str, worker_type: &str) -> Result<Self, IdError> {
        crate::macros::validate_name(provisioner)?;
        crate::macros::validate_name(worker_type)?;
        Ok(Self {
            provisioner: provisioner.to_string(),
            worker_type: worker_type.to_string(),
        })
    }

    /// Parses a pool id from `{provisioner}/{worker_type}`.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        let Some((provisioner, worker_type)) = s.split_once('/') else {
            return Err(IdError::MissingSeparator('/'));
        };
        Self::new(provisioner, worker_type)
    }

    /// The namespace half of the id.
    #[must_use]
    pub fn provisioner(&self) -> &str {
        &self.provisioner
    }

    /// The type half of the id.
    #[must_use]
    pub fn worker_type(&self) -> &str {
        &self.worker_type
    }
}

impl std::fmt::Display for WorkerPoolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provisioner, self.worker_type)
    }
}

impl std::str::FromStr for WorkerPoolId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for WorkerPoolId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for WorkerPoolId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MAX_NAME_LEN;
    use proptest::prelude::*;

    #[test]
    fn test_error_id_roundtrip() {
        let id = ErrorId::new();
        let s = id.to_string();
        assert!(s.starts_with("err_"));
        let parsed: ErrorId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_credential_id_invalid_prefix() {
        let result: Result<CredentialId, _> = "err_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(result.unwrap_err(), IdError::InvalidPrefix { .. }));
    }

    #[test]
    fn test_generated_id_missing_separator() {
        let result: Result<RequestId, _> = "req01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(result.unwrap_err(), IdError::MissingSeparator('_')));
    }

    #[test]
    fn test_generated_id_invalid_ulid() {
        let result: Result<ErrorId, _> = "err_invalid".parse();
        assert!(matches!(result.unwrap_err(), IdError::InvalidUlid(_)));
    }

    #[test]
    fn test_worker_pool_id_roundtrip() {
        let id: WorkerPoolId = "foo/bar".parse().unwrap();
        assert_eq!(id.provisioner(), "foo");
        assert_eq!(id.worker_type(), "bar");
        assert_eq!(id.to_string(), "foo/bar");

        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"foo/bar\"");
        let parsed: WorkerPoolId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_worker_pool_id_requires_slash() {
        assert!(matches!(
            WorkerPoolId::parse("foobar").unwrap_err(),
            IdError::MissingSeparator('/')
        ));
        assert!(WorkerPoolId::parse("foo/").unwrap_err().is_empty());
        assert!(WorkerPoolId::parse("foo/bar/baz").is_err());
    }

    #[test]
    fn test_name_rules() {
        assert!(WorkerId::parse("abc123").is_ok());
        assert!(WorkerId::parse("i-0a1b_C").is_ok());
        assert!(WorkerId::parse("").unwrap_err().is_empty());
        assert!(matches!(
            WorkerId::parse("has space").unwrap_err(),
            IdError::InvalidCharacter { ch: ' ', .. }
        ));
        let long = "a".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(
            ProviderId::parse(&long).unwrap_err(),
            IdError::TooLong { .. }
        ));
    }

    #[test]
    fn test_name_rejected_on_deserialize() {
        let result: Result<WorkerGroup, _> = serde_json::from_str("\"us/east\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_all_generated_prefixes_unique() {
        let prefixes = [ErrorId::PREFIX, CredentialId::PREFIX, RequestId::PREFIX];
        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(prefixes.len(), unique.len());
    }

    proptest! {
        #[test]
        fn prop_valid_names_roundtrip(s in "[a-zA-Z0-9_-]{1,38}") {
            let id = WorkerId::parse(&s).unwrap();
            prop_assert_eq!(id.as_str(), s.as_str());
            let parsed: WorkerId = id.to_string().parse().unwrap();
            prop_assert_eq!(parsed, id);
        }

        #[test]
        fn prop_pool_ids_roundtrip(a in "[a-z0-9-]{1,20}", b in "[a-z0-9_]{1,20}") {
            let id = WorkerPoolId::new(&a, &b).unwrap();
            let parsed = WorkerPoolId::parse(&id.to_string()).unwrap();
            prop_assert_eq!(parsed, id);
        }
    }
}
