//! Gc command: lifecycle sweep plus tombstone collection.

use clap::Args;
use console::style;

use mnemo_engine::EngineResult;

use super::Context;

#[derive(Args, Debug)]
pub struct GcArgs {
    /// Report what would happen without changing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Skip the decay sweep and only collect tombstones
    #[arg(long)]
    pub no_sweep: bool,
}

pub async fn run(args: GcArgs, ctx: &Context) -> EngineResult<()> {
    let engines = ctx.engines().await?;
    let repo = engines.git.repo_path().to_path_buf();

    let sweep = if args.no_sweep || args.dry_run {
        None
    } else {
        Some(engines.lifecycle.sweep(Some(&repo))?)
    };
    let gc = engines.lifecycle.gc(Some(&repo), args.dry_run)?;

    if ctx.json {
        println!(
            "{}",
            serde_json::json!({
                "swept": sweep.map(|s| serde_json::json!({
                    "examined": s.examined,
                    "aged": s.aged,
                    "archived": s.archived,
                    "tombstoned": s.tombstoned,
                })),
                "gc": { "candidates": gc.candidates, "deleted": gc.deleted },
                "dry_run": args.dry_run,
            })
        );
        return Ok(());
    }

    if let Some(sweep) = sweep {
        println!(
            "{} sweep: {} aged, {} archived, {} tombstoned",
            style("✓").green(),
            sweep.aged,
            sweep.archived,
            sweep.tombstoned
        );
    }
    if args.dry_run {
        println!("{} would collect {} tombstones", style("·").dim(), gc.candidates);
    } else {
        println!("{} collected {} tombstones", style("✓").green(), gc.deleted);
    }
    Ok(())
}
