//! Shared group configuration.
//!
//! Every member of a group, coordinator and workers alike, is configured
//! with the same [`Config`]; only the rank differs between processes. The
//! struct is a [`clap::Args`] so binaries can flatten it into their CLI:
//!
//! ```no_run
//! use clap::Parser;
//! use dapply::config::Config;
//!
//! #[derive(Parser, Debug)]
//! pub struct Cli {
//!     #[command(flatten)]
//!     pub options: Config,
//! }
//!
//! let cli = Cli::parse();
//! ```
//!
//! [`Session::from_config`](crate::session::Session::from_config) turns a
//! [`Config`] into a ready-to-join session.

use clap::{Args, ValueEnum};

const DEFAULT_GROUP_KEY: &str = "dapply";
const DEFAULT_GROUP_SIZE: usize = 4;
const HELP_HEADING: &str = "dapply options";

/// Group configuration.
#[derive(Args, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Config {
    /// Serialization format for function references, shared arguments, task
    /// payloads and control messages.
    #[arg(long, short, help_heading = HELP_HEADING, value_enum, default_value_t = Serializer::Postcard)]
    pub serializer: Serializer,

    /// Transport used to form the process group.
    #[arg(long, short, help_heading = HELP_HEADING, value_enum, default_value_t = Transport::InMemory)]
    pub transport: Transport,

    /// Number of processes in the group. For the in-memory transport this is
    /// the number of emulated processes, coordinator included.
    #[arg(long, short, help_heading = HELP_HEADING, default_value_t = DEFAULT_GROUP_SIZE)]
    pub group_size: usize,

    /// Rank of this process within the group (AMQP transport only).
    #[arg(long, short, help_heading = HELP_HEADING, env = "DAPPLY_RANK", required_if_eq("transport", "amqp"))]
    pub rank: Option<usize>,

    /// Namespace for the queues backing the group. Every member of a group
    /// must use the same key.
    #[arg(long, help_heading = HELP_HEADING, default_value = DEFAULT_GROUP_KEY)]
    pub group_key: String,

    /// URI of the AMQP broker, if the AMQP transport is selected.
    #[arg(long, help_heading = HELP_HEADING, env = "AMQP_URI", required_if_eq("transport", "amqp"))]
    pub amqp_uri: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            serializer: Default::default(),
            transport: Default::default(),
            group_size: DEFAULT_GROUP_SIZE,
            rank: None,
            group_key: DEFAULT_GROUP_KEY.to_string(),
            amqp_uri: None,
        }
    }
}

/// Available serialization formats.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum, Default)]
pub enum Serializer {
    #[default]
    Postcard,
    Cbor,
}

/// Available group transports.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum, Default)]
pub enum Transport {
    /// Emulated group inside a single OS process.
    #[default]
    InMemory,
    /// One OS process per rank, connected through an AMQP broker.
    Amqp,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser, Debug)]
    struct Cli {
        #[command(flatten)]
        options: Config,
    }

    #[test]
    fn defaults_match_cli_defaults() {
        let cli = Cli::try_parse_from(["node"]).unwrap();
        assert_eq!(cli.options, Config::default());
    }

    #[test]
    fn amqp_requires_rank_and_uri() {
        let result = Cli::try_parse_from(["node", "--transport", "amqp"]);
        assert!(result.is_err());

        let cli = Cli::try_parse_from([
            "node",
            "--transport",
            "amqp",
            "--rank",
            "2",
            "--amqp-uri",
            "amqp://localhost:5672",
        ])
        .unwrap();
        assert_eq!(cli.options.transport, Transport::Amqp);
        assert_eq!(cli.options.rank, Some(2));
    }
}
