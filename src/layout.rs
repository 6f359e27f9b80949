// layout.rs

use crate::cohort::CohortKind;
use crate::error::{PipelineError, Result};
use crate::reduce::SelectionMode;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Autosomes 1-22 plus X. Other contigs are not part of the assembled matrix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Chromosome {
    Autosome(u8),
    X,
}

impl Chromosome {
    /// Assembly order: 1..=22, then X.
    pub fn all() -> Vec<Chromosome> {
        let mut chromosomes: Vec<Chromosome> = (1..=22).map(Chromosome::Autosome).collect();
        chromosomes.push(Chromosome::X);
        chromosomes
    }
}

impl fmt::Display for Chromosome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chromosome::Autosome(n) => write!(f, "{}", n),
            Chromosome::X => write!(f, "X"),
        }
    }
}

impl FromStr for Chromosome {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        if s == "X" {
            return Ok(Chromosome::X);
        }
        match s.parse::<u8>() {
            Ok(n) if (1..=22).contains(&n) => Ok(Chromosome::Autosome(n)),
            _ => Err(PipelineError::UnsupportedKeyword {
                what: "chromosome (1 to 22 or X)",
                value: s.to_string(),
            }),
        }
    }
}

/// Where every stage reads and writes, relative to one data root.
#[derive(Clone, Debug)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn parsed_vcf(&self, cohort: CohortKind, chromosome: Chromosome) -> PathBuf {
        self.root
            .join("vcf")
            .join(cohort.to_string())
            .join(format!("output_{}.csv.gz", chromosome))
    }

    pub fn normalized_cohort(&self, cohort: CohortKind, chromosome: Chromosome) -> PathBuf {
        self.root
            .join("vcf")
            .join(cohort.to_string())
            .join(format!("normalized_{}.csv.gz", chromosome))
    }

    pub fn chromosome_matrix(&self, chromosome: Chromosome) -> PathBuf {
        self.root
            .join("datasets")
            .join("chr")
            .join(format!("chr{}.csv.gz", chromosome))
    }

    pub fn variant_info(&self, chromosome: Chromosome) -> PathBuf {
        self.root
            .join("datasets")
            .join("chr")
            .join(format!("INFO_chr{}.csv", chromosome))
    }

    pub fn merged_dataset(&self) -> PathBuf {
        self.root.join("datasets").join("merged_dataset.csv.gz")
    }

    pub fn cleaned_dataset(&self) -> PathBuf {
        self.root.join("datasets").join("cleaned_dataset.csv.gz")
    }

    pub fn imputed_dataset(&self) -> PathBuf {
        self.root.join("datasets").join("imputed_dataset.csv.gz")
    }

    pub fn annotated_dataset(&self) -> PathBuf {
        self.root.join("datasets").join("dataset_with_genes.csv.gz")
    }

    pub fn reduced_dataset(&self, mode: SelectionMode) -> PathBuf {
        self.root
            .join("datasets")
            .join(format!("reduced_dataset_{}.csv.gz", mode))
    }

    pub fn significant_variants(&self) -> PathBuf {
        self.root.join("variants").join("sigVars.csv")
    }

    pub fn non_normal_variants(&self) -> PathBuf {
        self.root.join("variants").join("notnormal.csv")
    }

    pub fn gene_selection_report(&self, mode: SelectionMode) -> PathBuf {
        self.root.join("genes").join(format!("{}.csv", mode))
    }
}

/// Creates the parent directory of `path` if needed.
pub(crate) fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
