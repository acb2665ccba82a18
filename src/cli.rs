use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "kube-rightsize")]
#[command(about = "In-place right-sizing operator for Kubernetes workloads")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Display application version
    Version,

    /// Check cluster connectivity, permissions, and resize support
    Check,

    /// Manage the RightSizerConfig / RightSizerPolicy CRDs
    Crd {
        #[command(subcommand)]
        action: CrdAction,
    },

    /// Start the right-sizing operator
    Start,
}

#[derive(Subcommand)]
pub enum CrdAction {
    /// Print the CRD YAML to stdout
    Generate,

    /// Install the CRDs into the connected cluster
    Install,
}
