//! `stratum build` command: build an image from a build file.
//!
//! Decodes the build file, runs it through the build pipeline and stores
//! the result under the given name.

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::Args;
use stratum_builder::{BuildRequest, Builder, Buildfile};
use stratum_core::{BuildMode, MountDriverKind};

use super::GlobalOpts;

/// Build file looked up in the context when `--file` is not given.
const DEFAULT_BUILDFILE: &str = "Kubefile";

#[derive(Args)]
pub struct BuildArgs {
    /// Build context directory (contains the build file and COPY sources)
    #[arg(default_value = ".")]
    pub path: String,

    /// Name for the image (e.g., "myapp:v1")
    #[arg(short = 't', long = "tag")]
    pub tag: String,

    /// Path to the build file (default: <PATH>/Kubefile)
    #[arg(short = 'f', long = "file")]
    pub file: Option<String>,

    /// Do not use the build cache
    #[arg(long)]
    pub no_cache: bool,

    /// Build mode: full or lite (lite skips CMD)
    #[arg(long)]
    pub mode: Option<BuildMode>,

    /// Mount driver: auto, overlay or copy
    #[arg(long)]
    pub mount_driver: Option<MountDriverKind>,

    /// Annotate the image (KEY=VALUE), can be repeated
    #[arg(long = "annotation")]
    pub annotation: Vec<String>,

    /// Only print the image id
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: BuildArgs, global: &GlobalOpts) -> Result<(), Box<dyn std::error::Error>> {
    let context_dir = PathBuf::from(&args.path)
        .canonicalize()
        .map_err(|e| format!("Invalid build context path '{}': {}", args.path, e))?;

    if !context_dir.is_dir() {
        return Err(format!(
            "Build context '{}' is not a directory",
            context_dir.display()
        )
        .into());
    }

    let buildfile_path = match &args.file {
        Some(f) => {
            let p = PathBuf::from(f);
            if p.is_absolute() {
                p
            } else {
                context_dir.join(p)
            }
        }
        None => context_dir.join(DEFAULT_BUILDFILE),
    };

    if !buildfile_path.exists() {
        return Err(format!("Build file not found at {}", buildfile_path.display()).into());
    }

    let annotations = parse_annotations(&args.annotation)?;
    let buildfile = Buildfile::from_file(&buildfile_path)?;
    tracing::debug!(
        file = %buildfile_path.display(),
        base = buildfile.base(),
        layers = buildfile.layers.len(),
        "Parsed build file"
    );

    let mut config = global.load_config()?;
    if args.no_cache {
        config.no_cache = true;
    }
    if let Some(mode) = args.mode {
        config.build_mode = mode;
    }
    if let Some(driver) = args.mount_driver {
        config.mount_driver = driver;
    }

    let builder = Builder::open(config)?;
    let restored = builder.restore()?;
    tracing::debug!(chains = restored, "Build cache ready");

    let mut request = BuildRequest::from_buildfile(context_dir, buildfile, args.tag.as_str());
    request.annotations = annotations;
    let result = builder.build(request).await?;

    if args.quiet {
        println!("{}", result.image_id);
    } else {
        println!(
            "Built {} ({}): {} layer(s), {} new, {} cached",
            result.name,
            result.image_id.short(),
            result.layers.iter().filter(|l| l.is_content()).count(),
            result.new_layers,
            result.cache_hits
        );
    }

    Ok(())
}

/// Parse KEY=VALUE pairs.
fn parse_annotations(args: &[String]) -> Result<BTreeMap<String, String>, String> {
    let mut map = BTreeMap::new();
    for arg in args {
        let (key, value) = arg
            .split_once('=')
            .ok_or_else(|| format!("Invalid annotation (expected KEY=VALUE): {arg}"))?;
        map.insert(key.to_string(), value.to_string());
    }
    Ok(map)
}
