use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use dapply::{
    config::Config,
    executor::Registry,
    group::COORDINATOR,
    operation::{Operation, OperationError},
    session::{worker_loop, Session},
    RemoteExecute,
};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use tracing::info;

mod init;

#[derive(Parser, Debug)]
pub struct Cli {
    #[command(flatten)]
    pub options: Config,

    /// Words to distribute over the group (coordinator only).
    #[arg(long, num_args = 1.., default_values_t = default_words())]
    pub words: Vec<String>,
}

fn default_words() -> Vec<String> {
    "the quick brown fox jumps over the lazy dog"
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Uppercases a word and appends the round's suffix.
#[derive(Serialize, Deserialize, RemoteExecute)]
pub struct Shout;

impl Operation for Shout {
    type Input = String;
    type Shared = String;
    type Output = String;

    fn execute(&self, input: String, suffix: &String) -> dapply::operation::Result<String> {
        Ok(input.to_uppercase() + suffix)
    }
}

/// Counts the vowels of a word.
#[derive(Serialize, Deserialize, RemoteExecute)]
pub struct Vowels;

impl Operation for Vowels {
    type Input = String;
    type Shared = ();
    type Output = usize;

    fn execute(&self, input: String, _: &()) -> dapply::operation::Result<usize> {
        if input.is_empty() {
            return Err(OperationError::msg("empty word"));
        }
        Ok(input.chars().filter(|c| "aeiouAEIOU".contains(*c)).count())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init::tracing();
    let args = Cli::parse();

    if args.options.rank.is_some_and(|rank| rank != COORDINATOR) {
        return worker_loop(&args.options).await;
    }

    let mut session = Session::from_config(&args.options, Arc::new(Registry)).await?;
    let group = session.join().await?;
    info!(%group, "coordinator joined");

    let shouted = session.map(&Shout, &"!".to_string(), args.words.clone()).await?;
    info!("{shouted:?}");

    let vowels = session.map(&Vowels, &(), args.words).await?;
    info!("{vowels:?}");

    session.close().await
}
