//! `nodeagent ctl` subcommands.

use crate::cli::CtlCommand;
use anyhow::{Context, Result};
use nodeagent::{IngressClient, Workload};
use std::path::Path;

async fn read_workload(path: &Path) -> Result<Workload> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parsing workload in {}", path.display()))
}

pub async fn run(ingress_socket: &Path, command: CtlCommand) -> Result<()> {
    let client = IngressClient::connect(ingress_socket)
        .await
        .with_context(|| format!("connecting to agent at {}", ingress_socket.display()))?;

    match command {
        CtlCommand::Status => {
            let status = client.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        CtlCommand::List => {
            for workload in client.list_workloads().await? {
                println!(
                    "{}\t{}/{}\t{}",
                    workload.uid,
                    workload.info.namespace,
                    workload.info.name,
                    workload.netns_id.as_deref().unwrap_or("-")
                );
            }
        }
        CtlCommand::Add { file } => {
            let workload = read_workload(&file).await?;
            client.add_workload(&workload).await?;
            println!("enrolled {}", workload.uid);
        }
        CtlCommand::Remove { file } => {
            let workload = read_workload(&file).await?;
            client.remove_workload(&workload).await?;
            println!("removed {}", workload.uid);
        }
    }
    Ok(())
}
