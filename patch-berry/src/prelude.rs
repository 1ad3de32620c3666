//! 🍇欢迎光临🍓
//!
//! 涵盖了本 crate 一系列常用的功能.

pub use crate::Idx2d;

pub use crate::config::{Config, ConfigError, Ndim, Normalization, ProblemKind};
pub use crate::consts::keys;
pub use crate::data::{ImageWriter, NpyWriter, NullWriter, PngWriter, Sample};
pub use crate::dataset::{self, nifti_loader, npy_loader};
pub use crate::ensemble::{predict_ensemble_2d, predict_ensemble_3d};
pub use crate::error::{PipelineError, PipelineResult};
pub use crate::infer::{from_fn, Identity, Infer};
pub use crate::metrics::{jaccard, voc_overlap, FinalStats, RunningStats};
pub use crate::post_proc::{apply_post_processing, PostProcessConfig};
pub use crate::tiling::{crop_with_overlap, merge_with_overlap, PadMode, PatchGrid};
pub use crate::workflow::{Report, Tally, Workflow};

#[cfg(feature = "rayon")]
pub use crate::workflow::par_evaluate;
