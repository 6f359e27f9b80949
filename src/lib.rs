// lib.rs

//! Case/control variant-matrix construction from per-chromosome VCF files and
//! its reduction to gene-level features.

pub mod annotate;
pub mod assemble;
pub mod cache;
pub mod cohort;
pub mod error;
pub mod genotype;
pub mod layout;
pub mod matrix;
pub mod merge;
pub mod missing;
pub mod pca;
pub mod pipeline;
pub mod reduce;
pub mod stats;
pub mod tsne;
pub mod vcf;

pub use error::{PipelineError, Result};
pub use pipeline::{PipelineConfig, PipelineContext};
