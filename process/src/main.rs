use std::process::ExitCode;

use clap::Parser;
use process::Targets;
use server::models::PostId;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Posts to reconcile. Every post with favorite state when empty.
    posts: Vec<String>,

    /// Only posts with a negative shard or a drifted display count.
    #[arg(long, conflicts_with = "posts")]
    suspicious: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let args = Args::parse();

    let targets = if args.suspicious {
        Targets::Suspicious
    } else if args.posts.is_empty() {
        Targets::All
    } else {
        Targets::Posts(args.posts.into_iter().map(PostId::new).collect())
    };

    match process::run(targets).await {
        Ok(summary) if summary.failed.is_empty() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(2),
        Err(e) => {
            eprintln!("Reconciliation failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}
