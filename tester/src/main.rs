//! Hammers a running server with concurrent favorites on one post, then checks the
//! count the server reports against what the toggles said they did.
use anyhow::{Context, Result, bail};
use clap::Parser;
use reqwest::Client;
use serde::{Deserialize, Serialize};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Post to favorite. Must be public on the target server.
    post: String,

    /// Distinct users favoriting at once.
    #[arg(long, default_value_t = 500)]
    users: usize,

    /// Also fire a second, duplicate click per user carrying the observed state.
    #[arg(long)]
    double_click: bool,

    #[arg(long, default_value = "http://localhost:1111")]
    url: String,
}

#[derive(Serialize)]
struct ToggleRequest {
    observed: bool,
}

#[derive(Deserialize)]
struct ToggleOutcome {
    action: String,
    applied: bool,
}

#[derive(Deserialize)]
struct CountResponse {
    count: u64,
}

async fn toggle(
    client: &Client,
    url: &str,
    user: &str,
    observed: Option<bool>,
) -> Result<ToggleOutcome> {
    let mut request = client.post(url).header("x-user-id", user);
    if let Some(observed) = observed {
        request = request.json(&ToggleRequest { observed });
    }

    let response = request.send().await?.error_for_status()?;
    Ok(response.json().await?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let client = Client::new();

    let toggle_url = format!("{}/posts/{}/favorite", args.url, args.post);
    let count_url = format!("{}/posts/{}/favorites/count", args.url, args.post);

    let before: CountResponse = client.get(&count_url).send().await?.json().await?;
    println!("Count before: {}", before.count);

    let clicks = if args.double_click { 2 } else { 1 };
    let mut tasks = Vec::new();

    for user in 0..args.users {
        for _ in 0..clicks {
            let client = client.clone();
            let url = toggle_url.clone();
            let user = format!("tester-{user}");
            let observed = args.double_click.then_some(false);

            tasks.push(tokio::spawn(async move {
                toggle(&client, &url, &user, observed).await
            }));
        }
    }

    let mut net: i64 = 0;
    let mut skipped = 0;
    for task in tasks {
        let outcome = task.await.context("Toggle task panicked")??;

        if !outcome.applied {
            skipped += 1;
            continue;
        }

        net += if outcome.action == "added" { 1 } else { -1 };
    }

    let after: CountResponse = client.get(&count_url).send().await?.json().await?;

    println!("Applied net change: {net}");
    println!("Duplicate clicks absorbed: {skipped}");
    println!("Count after: {}", after.count);

    let expected = before.count as i64 + net;
    if after.count as i64 != expected {
        bail!("Count drifted: expected {expected}, server says {}", after.count);
    }

    println!("Counts agree");
    Ok(())
}
