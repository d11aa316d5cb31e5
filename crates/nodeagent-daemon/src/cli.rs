//! Command-line arguments.

use clap::{Args, Parser, Subcommand, ValueEnum};
use nodeagent::config::{IngressConfig, IpSetConfig, ListenerConfig};
use nodeagent::{AgentConfig, IpFamily, IpSetBackendKind};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "nodeagent")]
#[command(about = "Enrolls node-local workloads with the mesh dataplane")]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "NODEAGENT_JSON_LOGS")]
    pub json_logs: bool,

    /// Ingress socket of the agent
    #[arg(
        long,
        global = true,
        env = "NODEAGENT_INGRESS_SOCKET",
        default_value = IngressConfig::DEFAULT_SOCKET_PATH
    )]
    pub ingress_socket: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub run: RunArgs,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the agent (default)
    Run,
    /// Talk to a running agent
    #[command(subcommand)]
    Ctl(CtlCommand),
}

#[derive(Subcommand, Debug)]
pub enum CtlCommand {
    /// Print readiness, connections and metrics
    Status,
    /// List workloads known to the dataplane side
    List,
    /// Enroll the workload described in a JSON file
    Add {
        /// JSON file with one workload
        file: PathBuf,
    },
    /// Unenroll the workload described in a JSON file
    Remove {
        /// JSON file with one workload
        file: PathBuf,
    },
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Seqpacket socket the dataplane connects to
    #[arg(
        long,
        env = "NODEAGENT_DATAPLANE_SOCKET",
        default_value = ListenerConfig::DEFAULT_SOCKET_PATH
    )]
    pub dataplane_socket: PathBuf,

    /// Name of the health-probe IP set
    #[arg(long, env = "NODEAGENT_IPSET_NAME", default_value = IpSetConfig::DEFAULT_SET_NAME)]
    pub ipset_name: String,

    /// Address family of the IP set
    #[arg(long, env = "NODEAGENT_IPSET_FAMILY", value_enum, default_value_t = FamilyArg::Inet)]
    pub ipset_family: FamilyArg,

    /// Where the IP set lives
    #[arg(long, env = "NODEAGENT_IPSET_BACKEND", value_enum, default_value_t = BackendArg::Kernel)]
    pub ipset_backend: BackendArg,

    /// JSON file listing the workloads already running on this node
    #[arg(long, env = "NODEAGENT_INITIAL_WORKLOADS")]
    pub initial_workloads: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FamilyArg {
    Inet,
    Inet6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendArg {
    Kernel,
    Memory,
}

impl Cli {
    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            dataplane_socket: self.run.dataplane_socket.clone(),
            ingress_socket: self.ingress_socket.clone(),
            ipset_name: self.run.ipset_name.clone(),
            ipset_family: match self.run.ipset_family {
                FamilyArg::Inet => IpFamily::Inet,
                FamilyArg::Inet6 => IpFamily::Inet6,
            },
            ipset_backend: match self.run.ipset_backend {
                BackendArg::Kernel => IpSetBackendKind::Kernel,
                BackendArg::Memory => IpSetBackendKind::Memory,
            },
            initial_workloads: self.run.initial_workloads.clone(),
            ..AgentConfig::default()
        }
    }
}
