//! Recall command: hydrate a memory by id.

use clap::{Args, ValueEnum};
use console::{style, Style};

use mnemo_engine::{EngineError, EngineResult};
use mnemo_types::{HydrationLevel, MemoryId};

use super::Context;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Level {
    Summary,
    Full,
    Files,
}

impl From<Level> for HydrationLevel {
    fn from(level: Level) -> Self {
        match level {
            Level::Summary => HydrationLevel::Summary,
            Level::Full => HydrationLevel::Full,
            Level::Files => HydrationLevel::Files,
        }
    }
}

#[derive(Args, Debug)]
pub struct RecallArgs {
    /// Memory id (namespace:sha:ordinal)
    pub id: String,

    /// Hydration level
    #[arg(long, value_enum, default_value = "full")]
    pub level: Level,
}

pub async fn run(args: RecallArgs, ctx: &Context) -> EngineResult<()> {
    let id = MemoryId::parse(&args.id)
        .map_err(|e| EngineError::NotFound(format!("bad id '{}': {e}", args.id)))?;

    let engines = ctx.engines().await?;
    let memory = engines
        .recall
        .get(&id)?
        .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
    let hydrated = engines.recall.hydrate(memory, args.level.into()).await?;

    if ctx.json {
        println!("{}", serde_json::to_string_pretty(&hydrated).unwrap_or_default());
        return Ok(());
    }

    let dim = Style::new().dim();
    let memory = &hydrated.memory;
    println!("{} {}", style(&memory.id.to_string()).cyan(), memory.summary);
    println!(
        "{}",
        dim.apply_to(format!(
            "{} · {} · {}",
            memory.namespace, memory.status, memory.timestamp
        ))
    );
    if !memory.tags.is_empty() {
        println!("{}", dim.apply_to(format!("tags: {}", memory.tags.join(", "))));
    }
    if let Some(body) = &hydrated.full_body {
        println!();
        println!("{body}");
    }
    if !hydrated.files.is_empty() {
        println!();
        println!("{}", style("Files at commit").bold());
        for (path, bytes) in &hydrated.files {
            println!("  {path} {}", dim.apply_to(format!("({} bytes)", bytes.len())));
        }
    }
    for warning in &hydrated.warnings {
        println!("{} {warning}", style("warning:").yellow());
    }
    Ok(())
}
