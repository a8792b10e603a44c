//! Runtime image inspection.

use anyhow::{Context as _, Result};
use layerkit_pipeline::assemble::{IMAGE_DIR, enumerate, load_image, verify_minimal};
use std::path::PathBuf;

use super::Context;

pub fn inspect(ctx: &Context, path: Option<PathBuf>, json: bool) -> Result<()> {
    let image_dir = match path {
        Some(path) => path,
        None => {
            let recipe = ctx.load_recipe()?;
            ctx.options(&recipe, &Default::default()).out_dir.join(IMAGE_DIR)
        }
    };

    let image = load_image(&image_dir)?;
    let on_disk = enumerate(&image.rootfs())
        .with_context(|| format!("Failed to read {}", image.rootfs().display()))?;
    if on_disk != image.contents {
        anyhow::bail!(
            "Image at {} was modified after assembly",
            image_dir.display()
        );
    }
    verify_minimal(&image.config, &on_disk)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&image)?);
        return Ok(());
    }

    println!("Image: {}", image.root.display());
    println!("  digest:      {}", image.digest);
    println!("  base:        {}", image.config.base);
    println!("  workdir:     {}", image.config.working_dir);
    println!("  entrypoint:  {}", image.config.entrypoint.join(" "));
    println!("  trust store: {}", image.config.trust_store);
    println!("  binary:      sha256:{}", image.config.binary_digest);
    println!("  contents:");
    for path in &image.contents {
        println!("    {}", path);
    }
    println!("\n✓ Image is minimal");
    Ok(())
}
