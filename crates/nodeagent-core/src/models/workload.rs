//! Workload metadata types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Stable platform identifier of a workload.
///
/// Immutable for the workload's lifetime. Also stored as the owner tag of the
/// workload's probe IP set entries.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkloadUid(String);

impl WorkloadUid {
    pub fn new(uid: impl Into<String>) -> Self {
        Self(uid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkloadUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkloadUid {
    fn from(uid: &str) -> Self {
        Self::new(uid)
    }
}

/// Metadata the dataplane needs to identify a workload.
///
/// Derived once from the platform object and replaced wholesale on re-add.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkloadInfo {
    /// Platform namespace (tenant), not the network namespace.
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub service_account: String,
}

/// Platform-specific reference to a workload's network namespace.
///
/// On Linux this is the path of a namespace file, e.g. `/proc/<pid>/ns/net`
/// or a bind mount under `/var/run/netns`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceRef(String);

impl NamespaceRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NamespaceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A workload as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    pub uid: WorkloadUid,
    #[serde(flatten)]
    pub info: WorkloadInfo,
    /// Addresses assigned to the workload.
    #[serde(default)]
    pub addresses: Vec<IpAddr>,
    /// Network namespace, if the platform already knows it.
    #[serde(default)]
    pub netns: Option<NamespaceRef>,
}

impl Workload {
    pub fn new(uid: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uid: WorkloadUid::new(uid),
            info: WorkloadInfo {
                namespace: namespace.into(),
                name: name.into(),
                service_account: String::new(),
            },
            addresses: Vec::new(),
            netns: None,
        }
    }

    pub fn with_addresses(mut self, addresses: impl IntoIterator<Item = IpAddr>) -> Self {
        self.addresses = addresses.into_iter().collect();
        self
    }

    pub fn with_netns(mut self, netns: impl Into<String>) -> Self {
        self.netns = Some(NamespaceRef::new(netns));
        self
    }

    pub fn with_service_account(mut self, service_account: impl Into<String>) -> Self {
        self.info.service_account = service_account.into();
        self
    }
}

/// One row of the node-local workload listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSummary {
    pub uid: WorkloadUid,
    #[serde(flatten)]
    pub info: WorkloadInfo,
    /// Stable id of the held namespace, absent until the namespace is known.
    #[serde(default)]
    pub netns_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workload_json_shape() {
        let json = r#"{
            "uid": "2b1f",
            "namespace": "default",
            "name": "web-0",
            "addresses": ["10.0.0.5"],
            "netns": "/proc/42/ns/net"
        }"#;
        let workload: Workload = serde_json::from_str(json).unwrap();

        assert_eq!(workload.uid.as_str(), "2b1f");
        assert_eq!(workload.info.name, "web-0");
        assert_eq!(workload.info.service_account, "");
        assert_eq!(workload.addresses, vec!["10.0.0.5".parse::<IpAddr>().unwrap()]);
        assert_eq!(workload.netns, Some(NamespaceRef::new("/proc/42/ns/net")));
    }

    #[test]
    fn test_workload_optional_fields_default() {
        let workload: Workload =
            serde_json::from_str(r#"{"uid": "a", "namespace": "ns", "name": "n"}"#).unwrap();
        assert!(workload.addresses.is_empty());
        assert!(workload.netns.is_none());
    }

    #[test]
    fn test_uid_is_transparent() {
        let uid = WorkloadUid::new("pod-1");
        assert_eq!(serde_json::to_string(&uid).unwrap(), r#""pod-1""#);
        assert_eq!(uid.to_string(), "pod-1");
    }
}
