//! Kernel probe set managed through the `ipset` utility.
//!
//! The set is a `hash:ip` set with comment support; the owner identity is
//! stored as the entry comment. `hash:ip` keys by address only, so the
//! protocol is not part of the kernel entry and reads back as TCP.

use super::{IpSetBackend, IpSetEntry};
use crate::config::{IpFamily, IpSetConfig};
use crate::error::{NodeAgentError, Result};
use crate::models::WorkloadUid;
use async_trait::async_trait;
use std::net::IpAddr;
use std::process::Output;
use tokio::process::Command;
use tracing::debug;

/// Diagnostic printed by `ipset add` when the address is already a member.
const ALREADY_ADDED: &str = "already added";

/// `ipset`-backed probe set.
#[derive(Debug, Clone)]
pub struct IpsetCli {
    name: String,
    family: IpFamily,
    binary: String,
}

impl IpsetCli {
    pub fn new(name: impl Into<String>, family: IpFamily) -> Self {
        Self {
            name: name.into(),
            family,
            binary: IpSetConfig::IPSET_BINARY.to_string(),
        }
    }

    /// Use a different `ipset` executable.
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    async fn run(&self, args: &[&str]) -> Result<Output> {
        debug!("Running {} {}", self.binary, args.join(" "));
        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(IpSetConfig::COMMAND_TIMEOUT, output).await {
            Err(_) => Err(NodeAgentError::IpSet {
                message: format!(
                    "{} {} timed out after {:?}",
                    self.binary,
                    args.join(" "),
                    IpSetConfig::COMMAND_TIMEOUT
                ),
            }),
            Ok(Err(e)) => Err(NodeAgentError::IpSet {
                message: format!("failed to execute {}: {}", self.binary, e),
            }),
            Ok(Ok(output)) => Ok(output),
        }
    }

    async fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args).await?;
        if !output.status.success() {
            return Err(command_failed(args, &output));
        }
        Ok(output)
    }

    async fn owner_of(&self, address: IpAddr) -> Option<WorkloadUid> {
        self.list()
            .await
            .ok()?
            .into_iter()
            .find(|entry| entry.address == address)
            .map(|entry| entry.owner)
    }
}

fn command_failed(args: &[&str], output: &Output) -> NodeAgentError {
    NodeAgentError::IpSet {
        message: format!(
            "ipset {} failed ({}): {}",
            args.first().copied().unwrap_or_default(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ),
    }
}

/// Parse `ipset list <name> -output save` into entries of `name`.
fn parse_save_output(name: &str, text: &str) -> Vec<IpSetEntry> {
    text.lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            if tokens.next() != Some("add") || tokens.next() != Some(name) {
                return None;
            }
            let address: IpAddr = tokens.next()?.parse().ok()?;
            let owner = match line.split_once(" comment ") {
                Some((_, comment)) => comment.trim().trim_matches('"').to_string(),
                None => String::new(),
            };
            Some(IpSetEntry::new(address, WorkloadUid::new(owner)))
        })
        .collect()
}

#[async_trait]
impl IpSetBackend for IpsetCli {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(&self) -> Result<()> {
        self.run_checked(&[
            "create",
            &self.name,
            "hash:ip",
            "family",
            self.family.as_str(),
            "comment",
            "-exist",
        ])
        .await?;
        Ok(())
    }

    async fn add(&self, entry: &IpSetEntry, replace: bool) -> Result<()> {
        let address = entry.address.to_string();
        let comment = entry.owner.to_string();
        let mut args = vec!["add", self.name.as_str(), address.as_str(), "comment", comment.as_str()];
        if replace {
            args.push("-exist");
        }

        let output = self.run(&args).await?;
        if output.status.success() {
            return Ok(());
        }
        if String::from_utf8_lossy(&output.stderr).contains(ALREADY_ADDED) {
            let owner = self
                .owner_of(entry.address)
                .await
                .map(|uid| uid.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(NodeAgentError::AddressCollision {
                address: entry.address,
                uid: entry.owner.clone(),
                owner,
            });
        }
        Err(command_failed(&args, &output))
    }

    async fn delete_address(&self, address: IpAddr) -> Result<()> {
        let address = address.to_string();
        self.run_checked(&["del", &self.name, &address, "-exist"]).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<IpSetEntry>> {
        let output = self
            .run_checked(&["list", &self.name, "-output", "save"])
            .await?;
        Ok(parse_save_output(
            &self.name,
            &String::from_utf8_lossy(&output.stdout),
        ))
    }

    async fn flush(&self) -> Result<()> {
        self.run_checked(&["flush", &self.name]).await?;
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        self.run_checked(&["destroy", &self.name]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_save_output() {
        let text = "\
create nodeagent-probes hash:ip family inet hashsize 1024 maxelem 65536 comment
add nodeagent-probes 10.244.1.7 comment \"2b1f-uid\"
add nodeagent-probes 10.244.1.9 comment \"9c0e-uid\"
add other-set 10.0.0.1 comment \"x\"
add nodeagent-probes 10.244.1.10
";
        let entries = parse_save_output("nodeagent-probes", text);

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].address, "10.244.1.7".parse::<IpAddr>().unwrap());
        assert_eq!(entries[0].owner.as_str(), "2b1f-uid");
        assert_eq!(entries[1].owner.as_str(), "9c0e-uid");
        assert_eq!(entries[2].owner.as_str(), "");
    }

    #[test]
    fn test_parse_ignores_garbage() {
        assert!(parse_save_output("s", "add s not-an-ip\n\nrandom text").is_empty());
    }

    #[tokio::test]
    async fn test_missing_binary_is_ipset_error() {
        let cli = IpsetCli::new("probes", IpFamily::Inet)
            .with_binary("/nonexistent/definitely-not-ipset");
        assert!(matches!(
            cli.create().await,
            Err(NodeAgentError::IpSet { .. })
        ));
    }
}
