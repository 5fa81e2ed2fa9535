//! Interactive prompts and the graceful-shutdown hook.
//!
//! Grounded on `original_source/**/main.go`'s `fmt.Scan` prompt loops and the
//! `signal.Notify`/cleanup-goroutine pair that removes this node from the
//! roster before exiting.

use tokio::io::{AsyncBufReadExt, BufReader};

use crate::membership::{self, Membership};

/// Ask a yes/no question, retrying until the user answers `y` or `n`.
pub async fn prompt_yes_no(question: &str) -> anyhow::Result<bool> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        println!("{question} (y/n): ");
        let Some(line) = lines.next_line().await? else {
            anyhow::bail!("stdin closed while waiting for an answer");
        };
        match line.trim() {
            "y" => return Ok(true),
            "n" => return Ok(false),
            _ => println!("please answer y or n"),
        }
    }
}

/// Ask for a count (e.g. "how many nodes request the CS"), retrying on a
/// non-numeric answer.
pub async fn prompt_count(question: &str) -> anyhow::Result<u32> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        println!("{question}: ");
        let Some(line) = lines.next_line().await? else {
            anyhow::bail!("stdin closed while waiting for an answer");
        };
        match line.trim().parse() {
            Ok(n) => return Ok(n),
            Err(_) => println!("please enter a number"),
        }
    }
}

/// Wait for SIGINT or SIGTERM, then remove `id` from the roster file and
/// return. The caller is expected to exit the process after this resolves.
pub async fn wait_for_shutdown(id: u32, path: impl AsRef<std::path::Path>) -> anyhow::Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    println!("shutting down...");
    let mut roster: Membership = membership::load(&path).await;
    roster.remove(id);
    membership::store(&path, &roster).await
}
