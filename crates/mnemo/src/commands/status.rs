//! Status command: index statistics and health.

use clap::Args;
use console::{style, Style};

use mnemo_engine::EngineResult;

use super::Context;

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Include all repositories, not just the current one
    #[arg(long)]
    pub all: bool,
}

pub async fn run(args: StatusArgs, ctx: &Context) -> EngineResult<()> {
    let engines = ctx.engines().await?;
    let repo_scope = if args.all {
        None
    } else {
        Some(engines.git.repo_path())
    };
    let stats = engines.index.stats(repo_scope)?;
    let report = engines.index.verify()?;

    if ctx.json {
        println!(
            "{}",
            serde_json::json!({ "stats": stats, "verification": report })
        );
        return Ok(());
    }

    let dim = Style::new().dim();
    println!("{}", style("Memory Status").bold());
    println!("{}", dim.apply_to("─".repeat(50)));
    println!("total memories: {}", stats.total);
    println!("with vectors:   {}", stats.embedding_count);
    println!("index size:     {} KiB", stats.size_bytes / 1024);
    if let Some(last) = stats.last_capture {
        println!("last capture:   {last}");
    }

    if !stats.by_namespace.is_empty() {
        println!();
        println!("{}", style("By namespace").bold());
        for (namespace, count) in &stats.by_namespace {
            println!("  {namespace:<14} {count}");
        }
    }
    if !stats.by_spec.is_empty() {
        println!();
        println!("{}", style("By spec").bold());
        for (spec, count) in &stats.by_spec {
            println!("  {spec:<14} {count}");
        }
    }

    println!();
    if report.is_clean() {
        println!("{} index is internally consistent", style("✓").green());
    } else {
        println!(
            "{} {} orphan vector rows, {} orphan text rows (run `mnemo sync verify --repair`)",
            style("✗").red(),
            report.orphan_vectors.len(),
            report.orphan_fts.len()
        );
    }
    Ok(())
}
