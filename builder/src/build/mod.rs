//! Image building: buildfile decoding, per-instruction execution and the
//! pipeline that ties them to the stores.

pub mod buildfile;
pub mod collaborators;
pub mod differ;
pub mod executor;
pub mod pipeline;

pub use buildfile::Buildfile;
pub use collaborators::{
    format_images, CommandRunner, ImageMirror, ImagePuller, LocalPuller, LoggingMirror,
    ShellRunner,
};
pub use differ::{run_differs, Differ, ImageListDiffer};
pub use executor::{Executor, Instruction, StepContext, StepOutcome};
pub use pipeline::{BuildRequest, BuildResult, Builder};
