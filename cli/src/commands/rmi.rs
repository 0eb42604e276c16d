//! `stratum rmi` command: remove one or more image names.

use std::sync::Arc;

use clap::Args;
use stratum_builder::{ContentStore, FsContentStore, ImageStore, LayerStore};
use stratum_core::StratumError;

use super::GlobalOpts;

#[derive(Args)]
pub struct RmiArgs {
    /// Image names to remove
    #[arg(required = true)]
    pub images: Vec<String>,

    /// Ignore names that do not exist
    #[arg(short, long)]
    pub force: bool,
}

pub async fn execute(args: RmiArgs, global: &GlobalOpts) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_image_store(global)?;

    let mut errors: Vec<String> = Vec::new();
    for name in &args.images {
        match store.remove(name).await {
            Ok(()) => println!("Removed: {name}"),
            Err(StratumError::NotFound(_)) if args.force => continue,
            Err(e) => errors.push(format!("{name}: {e}")),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        let msg = errors.join("\n");
        Err(format!("Failed to remove image(s):\n{msg}").into())
    }
}

/// Open the image store without probing mounts.
pub(super) fn open_image_store(global: &GlobalOpts) -> Result<ImageStore, Box<dyn std::error::Error>> {
    let config = global.load_config()?;
    config.ensure_dirs()?;
    let content: Arc<dyn ContentStore> = Arc::new(FsContentStore::open(&config.root_dir)?);
    let layers = Arc::new(LayerStore::open(&config.root_dir, content.clone())?);
    Ok(ImageStore::open(&config.root_dir, content, layers)?)
}
