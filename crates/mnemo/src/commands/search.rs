//! Search command.

use clap::Args;
use console::{style, Style};

use mnemo_engine::EngineResult;
use mnemo_index::SearchFilters;
use mnemo_types::{MemoryStatus, Namespace};

use super::{truncate, Context};

#[derive(Args, Debug)]
pub struct SearchArgs {
    /// Search query
    pub query: String,

    /// Maximum results
    #[arg(short, long, default_value = "10")]
    pub limit: usize,

    /// Restrict to one namespace
    #[arg(short, long)]
    pub namespace: Option<Namespace>,

    /// Restrict to a spec slug
    #[arg(long)]
    pub spec: Option<String>,

    /// Restrict to a status
    #[arg(long)]
    pub status: Option<MemoryStatus>,

    /// Match memories carrying any of these tags (repeatable)
    #[arg(short, long = "tag")]
    pub tags: Vec<String>,

    /// Skip vectors and search text only
    #[arg(long)]
    pub text: bool,
}

pub async fn run(args: SearchArgs, ctx: &Context) -> EngineResult<()> {
    let engines = ctx.engines().await?;
    let filters = SearchFilters {
        namespace: args.namespace,
        spec: args.spec,
        status: args.status,
        tags_any: args.tags,
        ..SearchFilters::default()
    };

    let results = if args.text {
        engines.recall.search_text(&args.query, filters, args.limit)?
    } else {
        engines.recall.search(&args.query, filters, args.limit).await?
    };

    if ctx.json {
        println!("{}", serde_json::to_string_pretty(&results).unwrap_or_default());
        return Ok(());
    }

    let dim = Style::new().dim();
    if results.is_empty() {
        println!("{}", dim.apply_to("no results"));
        return Ok(());
    }

    for (i, result) in results.iter().enumerate() {
        let memory = &result.memory;
        println!(
            "{}. {} {}",
            style(i + 1).cyan(),
            memory.summary,
            dim.apply_to(format!("(distance {:.3})", result.distance))
        );
        println!(
            "   {}",
            dim.apply_to(format!(
                "{} · {} · {}",
                memory.id, memory.status, truncate(&memory.content, 60)
            ))
        );
    }
    Ok(())
}
