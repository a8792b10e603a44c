//! Pipeline execution command.

use anyhow::{Context as _, Result};
use layerkit_core::executor::LogStream;
use layerkit_core::pipeline::PipelineState;
use layerkit_pipeline::{BuildOrchestrator, BuildReport, PipelineEvent};
use std::sync::Arc;

use super::Context;
use crate::PathArgs;

/// Run the pipeline, optionally stopping once `stop_after` is reached.
pub async fn run_build(
    ctx: &Context,
    paths: &PathArgs,
    stop_after: Option<PipelineState>,
) -> Result<()> {
    let recipe = ctx.load_recipe()?;
    let executor = ctx.executor(&recipe)?;
    let store = Arc::new(ctx.store(&recipe));
    let mut options = ctx.options(&recipe, paths);
    options.stop_after = stop_after;

    println!("Building: {} ({})", recipe.project.name, executor.name());
    println!("Workspace: {}", options.workspace.display());
    println!("Layer cache: {}", store.root().display());
    println!("\n--- Starting build ---\n");

    let orchestrator = BuildOrchestrator::new(executor, store);
    let (mut rx, result_handle) = orchestrator.execute(recipe, options);

    while let Some(event) = rx.recv().await {
        print_event(event);
    }

    let report = result_handle.await.context("Build task failed")??;
    print_summary(&report);
    Ok(())
}

fn print_event(event: PipelineEvent) {
    match event {
        PipelineEvent::StageStarted { stage } => {
            println!("▶ Stage '{}' started", stage);
        }
        PipelineEvent::StageLog { stage, line } => {
            let stream_marker = match line.stream {
                LogStream::Stdout => " ",
                LogStream::Stderr => "!",
                LogStream::System => "*",
            };
            println!("  [{}]{} {}", stage, stream_marker, line.content);
        }
        PipelineEvent::CacheHit { key } => {
            println!("  ● Dependency layer {} restored from cache", key.short());
        }
        PipelineEvent::CacheMiss { key } => {
            println!("  ○ Dependency layer {} not cached, building", key.short());
        }
        PipelineEvent::StaleArtifactRemoved { path } => {
            println!("  - removed {}", path.display());
        }
        PipelineEvent::SourcesTouched { count } => {
            println!("  ~ {} changed source file(s)", count);
        }
        PipelineEvent::StageCompleted { stage, success } => {
            if success {
                println!("✓ Stage '{}' completed successfully\n", stage);
            } else {
                println!("✗ Stage '{}' failed\n", stage);
            }
        }
        PipelineEvent::PipelineCompleted { success, state } => {
            if success {
                println!("--- Build completed: {} ---", state);
            } else {
                println!("--- Build failed: {} ---", state);
            }
        }
    }
}

fn print_summary(report: &BuildReport) {
    println!("\n--- Summary ---");
    println!("  run:    {}", report.run_id.short());
    println!("  state:  {}", report.state);
    if let Some(layer) = &report.layer {
        let origin = if report.cache_hit { "cached" } else { "built" };
        println!(
            "  layer:  {} ({}, {} files, {} bytes)",
            layer.key.short(),
            origin,
            layer.file_count,
            layer.size
        );
    }
    if let Some(binary) = &report.binary {
        println!(
            "  binary: {} sha256:{}",
            binary.path.display(),
            binary.digest.short()
        );
    }
    if let Some(image) = &report.image {
        println!(
            "  image:  {} sha256:{} on {}",
            image.root.display(),
            image.digest.short(),
            image.config.base
        );
        for path in &image.contents {
            println!("          {}", path);
        }
    }
    println!("\n✓ Build succeeded!");
}
