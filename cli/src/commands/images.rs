//! `stratum images` command.

use clap::Args;
use stratum_builder::ImageMetadata;

use crate::output;

use super::GlobalOpts;

#[derive(Args)]
pub struct ImagesArgs {
    /// Only show image names (one per line)
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: ImagesArgs, global: &GlobalOpts) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::rmi::open_image_store(global)?;
    let images = store.names().await;

    if args.quiet {
        for image in &images {
            println!("{}", image.name);
        }
        return Ok(());
    }

    let mut table = output::new_table(&["NAME", "IMAGE ID", "BASE", "LAYERS", "SIZE", "CREATED"]);
    for image in &images {
        let (base, layers) = match store.get_by_id(&image.id) {
            Ok(record) => (
                record.base().unwrap_or("-").to_string(),
                record.content_layers().count().to_string(),
            ),
            Err(e) => {
                tracing::warn!(image = %image.name, error = %e, "Failed to read image record");
                ("?".to_string(), "?".to_string())
            }
        };
        table.add_row(image_row(image, &base, &layers));
    }

    println!("{table}");
    Ok(())
}

fn image_row(image: &ImageMetadata, base: &str, layers: &str) -> [String; 6] {
    [
        image.name.clone(),
        format!("{}:{}", image.id.algorithm(), image.id.short()),
        base.to_string(),
        layers.to_string(),
        output::format_bytes(image.size),
        output::format_ago(&image.created),
    ]
}
