//! Command line interface for edgectl, built on clap.
//!
//! Defines [`Cli`] with the [`Command`] subcommands (convert, revert, status)
//! and the global flags shared by all of them.

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{ArgGroup, Args, Parser, Subcommand};

use crate::nodes::EdgeSelection;

/// edgectl: switch a Kubernetes cluster into edge-autonomous mode and back.
#[derive(Debug, Parser)]
#[command(name = "edgectl", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to a TOML configuration file (defaults to ./edgectl.toml if present).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Kubeconfig context to use instead of the current one.
    #[arg(long, global = true)]
    pub context: Option<String>,

    /// Servant image run on every edge node.
    #[arg(long, global = true)]
    pub servant_image: Option<String>,

    /// Print what would change without taking the lock or writing anything.
    #[arg(long, global = true, default_value_t = false)]
    pub dry_run: bool,

    /// Do not check the server version against the supported minimum.
    #[arg(long, global = true, default_value_t = false)]
    pub skip_version_check: bool,

    /// Enable debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Convert the cluster to edge-autonomous mode.
    Convert(ConvertArgs),

    /// Revert an edge-autonomous cluster to standard mode.
    Revert,

    /// Show edge membership, lock holder and server version.
    Status,
}

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("selection").required(true).args(["cloud_nodes", "edge_nodes"])))]
pub struct ConvertArgs {
    /// Comma-separated nodes that stay cloud nodes; every other node becomes an edge node.
    #[arg(long, value_delimiter = ',')]
    pub cloud_nodes: Vec<String>,

    /// Comma-separated nodes that become edge nodes; every other node stays a cloud node.
    #[arg(long, value_delimiter = ',')]
    pub edge_nodes: Vec<String>,

    /// Mark edge nodes as autonomous so their workloads survive a lost connection.
    #[arg(long, default_value_t = false)]
    pub autonomous: bool,
}

impl ConvertArgs {
    /// The node selection, rejecting lists that are empty once trimmed:
    /// an empty cloud list would make every node an edge node.
    pub fn selection(&self) -> Result<EdgeSelection> {
        fn names(list: &[String]) -> BTreeSet<String> {
            list.iter()
                .map(|n| n.trim())
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .collect()
        }
        let (flag, selection) = if self.edge_nodes.is_empty() {
            ("--cloud-nodes", EdgeSelection::CloudNodes(names(&self.cloud_nodes)))
        } else {
            ("--edge-nodes", EdgeSelection::EdgeNodes(names(&self.edge_nodes)))
        };
        let named = match &selection {
            EdgeSelection::CloudNodes(n) | EdgeSelection::EdgeNodes(n) => n,
        };
        if named.is_empty() {
            bail!("{flag} needs at least one node name");
        }
        Ok(selection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_convert_with_cloud_nodes() {
        let cli = Cli::parse_from(["edgectl", "convert", "--cloud-nodes", "master-1,master-2"]);
        match cli.command {
            Command::Convert(args) => {
                assert!(!args.autonomous);
                assert_eq!(
                    args.selection().unwrap(),
                    EdgeSelection::CloudNodes(["master-1".into(), "master-2".into()].into())
                );
            }
            _ => panic!("expected Convert command"),
        }
    }

    #[test]
    fn cli_parses_convert_with_edge_nodes() {
        let cli = Cli::parse_from(["edgectl", "convert", "--edge-nodes", "e1", "--autonomous"]);
        match cli.command {
            Command::Convert(args) => {
                assert!(args.autonomous);
                assert_eq!(
                    args.selection().unwrap(),
                    EdgeSelection::EdgeNodes(["e1".into()].into())
                );
            }
            _ => panic!("expected Convert command"),
        }
    }

    #[test]
    fn convert_requires_exactly_one_selection() {
        assert!(Cli::try_parse_from(["edgectl", "convert"]).is_err());
        assert!(
            Cli::try_parse_from(["edgectl", "convert", "--cloud-nodes", "a", "--edge-nodes", "b"])
                .is_err()
        );
    }

    #[test]
    fn blank_node_lists_are_rejected() {
        for argv in [
            ["edgectl", "convert", "--cloud-nodes", ","],
            ["edgectl", "convert", "--cloud-nodes", " "],
            ["edgectl", "convert", "--edge-nodes", " , "],
        ] {
            let cli = Cli::parse_from(argv);
            match cli.command {
                Command::Convert(args) => assert!(args.selection().is_err(), "{argv:?}"),
                _ => panic!("expected Convert command"),
            }
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "edgectl",
            "--servant-image",
            "registry.local/servant:v2",
            "--context",
            "edge-lab",
            "--dry-run",
            "--skip-version-check",
            "--verbose",
            "revert",
        ]);
        assert!(cli.verbose);
        assert!(cli.dry_run);
        assert!(cli.skip_version_check);
        assert_eq!(cli.servant_image.as_deref(), Some("registry.local/servant:v2"));
        assert_eq!(cli.context.as_deref(), Some("edge-lab"));
        assert!(matches!(cli.command, Command::Revert));
    }

    #[test]
    fn cli_parses_status() {
        let cli = Cli::parse_from(["edgectl", "status", "--config", "/etc/edgectl.toml"]);
        assert!(matches!(cli.command, Command::Status));
        assert_eq!(cli.config, Some(PathBuf::from("/etc/edgectl.toml")));
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
