//! Sync command: reconcile git notes and the index.

use clap::{Args, Subcommand};
use console::{style, Style};

use mnemo_engine::EngineResult;

use super::Context;

#[derive(Args, Debug)]
pub struct SyncArgs {
    #[command(subcommand)]
    pub command: Option<SyncCommand>,
}

#[derive(Subcommand, Debug)]
pub enum SyncCommand {
    /// Sync only notes whose blob changed (default)
    Incremental,

    /// Truncate derived tables and rebuild everything from git
    Full,

    /// Report drift between git and the index
    Verify {
        /// Apply minimal upserts/deletes to drive the diff to zero
        #[arg(long)]
        repair: bool,
    },
}

pub async fn run(args: SyncArgs, ctx: &Context) -> EngineResult<()> {
    let engines = ctx.engines().await?;
    let dim = Style::new().dim();

    match args.command.unwrap_or(SyncCommand::Incremental) {
        SyncCommand::Incremental => {
            let stats = engines.sync.incremental().await?;
            if ctx.json {
                println!(
                    "{}",
                    serde_json::json!({
                        "scanned": stats.scanned,
                        "added": stats.added,
                        "updated": stats.updated,
                        "removed": stats.removed,
                        "embedded": stats.embedded,
                        "embed_failures": stats.embed_failures,
                    })
                );
            } else {
                println!(
                    "{} synced: +{} new, ~{} updated, -{} removed {}",
                    style("✓").green(),
                    stats.added,
                    stats.updated,
                    stats.removed,
                    dim.apply_to(format!("({} notes scanned)", stats.scanned))
                );
            }
        }
        SyncCommand::Full => {
            let stats = engines.sync.full_reindex().await?;
            if ctx.json {
                println!(
                    "{}",
                    serde_json::json!({
                        "added": stats.added,
                        "embedded": stats.embedded,
                        "embed_failures": stats.embed_failures,
                    })
                );
            } else {
                println!(
                    "{} rebuilt index: {} memories, {} vectors",
                    style("✓").green(),
                    stats.added,
                    stats.embedded
                );
            }
        }
        SyncCommand::Verify { repair } => {
            if repair {
                let repairs = engines.sync.verify_and_repair().await?;
                if !ctx.json {
                    println!(
                        "{} repaired: {} upserts, {} deletes",
                        style("✓").green(),
                        repairs.upserts,
                        repairs.deletes
                    );
                }
            }
            let report = engines.sync.verify_consistency().await?;
            if ctx.json {
                println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
            } else if report.is_clean() {
                println!("{} git and index agree", style("✓").green());
            } else {
                println!("{} drift detected:", style("✗").red());
                for (namespace, diff) in &report.by_namespace {
                    if diff.is_clean() {
                        continue;
                    }
                    println!(
                        "  {namespace}: {} only in git, {} only in index, {} mismatched",
                        diff.in_git_not_index, diff.in_index_not_git, diff.hash_mismatch
                    );
                }
                if !repair {
                    println!("{}", dim.apply_to("run `mnemo sync verify --repair` to fix"));
                }
            }
        }
    }
    Ok(())
}
