//! Capture command.

use std::io::Read;

use clap::Args;
use console::style;

use mnemo_engine::{CaptureRequest, EngineError, EngineResult};
use mnemo_types::{MemoryId, MemoryStatus, Namespace};

use super::Context;

#[derive(Args, Debug)]
pub struct CaptureArgs {
    /// Target namespace (decisions, blockers, learnings, ...)
    pub namespace: Namespace,

    /// One-line summary (max 100 chars)
    pub summary: String,

    /// Markdown body; reads stdin when omitted and stdin is piped
    pub body: Option<String>,

    /// Project/topic slug
    #[arg(long)]
    pub spec: Option<String>,

    /// Free-form phase tag
    #[arg(long)]
    pub phase: Option<String>,

    /// Tags (repeatable)
    #[arg(short, long = "tag")]
    pub tags: Vec<String>,

    /// Commit to attach to (defaults to HEAD)
    #[arg(long)]
    pub commit: Option<String>,

    /// Related memory ids (repeatable)
    #[arg(long = "relates-to")]
    pub relates_to: Vec<String>,

    /// Initial status
    #[arg(long)]
    pub status: Option<MemoryStatus>,

    /// Resolve an existing blocker instead of capturing a new memory;
    /// the body becomes the resolution text
    #[arg(long)]
    pub resolve: Option<String>,
}

pub async fn run(args: CaptureArgs, ctx: &Context) -> EngineResult<()> {
    let engines = ctx.engines().await?;

    if let Some(blocker) = &args.resolve {
        let id = MemoryId::parse(blocker)
            .map_err(|e| EngineError::NotFound(format!("bad id '{blocker}': {e}")))?;
        let resolution = args.body.as_deref().unwrap_or("resolved");
        let result = engines.capture.resolve_blocker(&id, resolution).await?;
        if ctx.json {
            println!(
                "{}",
                serde_json::json!({ "id": result.id.to_string(), "resolved": blocker })
            );
        } else {
            println!("{} resolved {blocker} with {}", style("✓").green(), result.id);
        }
        return Ok(());
    }

    let body = match args.body {
        Some(body) => body,
        None => {
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .map_err(mnemo_notes::StorageError::Io)?;
            buffer
        }
    };

    let relates_to = args
        .relates_to
        .iter()
        .map(|raw| {
            MemoryId::parse(raw).map_err(|e| EngineError::NotFound(format!("bad id '{raw}': {e}")))
        })
        .collect::<EngineResult<Vec<_>>>()?;

    let request = CaptureRequest {
        summary: args.summary,
        body,
        spec: args.spec,
        phase: args.phase,
        tags: args.tags,
        commit: args.commit,
        relates_to,
        status: args.status,
    };
    let result = engines.capture.capture(args.namespace, request).await?;

    if ctx.json {
        println!(
            "{}",
            serde_json::json!({
                "id": result.id.to_string(),
                "indexed": result.indexed,
                "warning": result.warning.map(|w| w.as_str()),
            })
        );
    } else {
        println!("{} captured {}", style("✓").green(), result.id);
        if let Some(warning) = result.warning {
            println!(
                "  {} {}",
                style("warning:").yellow(),
                warning.as_str()
            );
        }
    }
    Ok(())
}
