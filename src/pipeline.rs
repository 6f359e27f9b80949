// pipeline.rs

use crate::annotate::{add_genes, GeneListAnnotator};
use crate::assemble::{assemble, DEFAULT_CASE_PREFIX};
use crate::cache::{ArtifactCache, CachePolicy, StageParams};
use crate::cohort::{normalize_cohort, CohortKind};
use crate::error::{PipelineError, Result};
use crate::genotype::UnencodedPolicy;
use crate::layout::{Chromosome, DataLayout};
use crate::matrix::{DatasetTag, FeatureMatrix, SampleMatrix, Stage};
use crate::merge::merge_chromosome;
use crate::missing::{clean_missing, impute, ImputeStrategy};
use crate::reduce::{
    network_genes, pval_genes, reduce_features, risk_genes, select_genes, write_selection_report,
    SelectionMode,
};
use crate::stats::{
    chi_squared_test, normality_test, read_significance, write_non_normal, write_significance,
    NormalityReport, SignificanceRecord,
};
use crate::tsne::TsneParams;
use crate::vcf::{extract_columns, SampleAllowList};
use log::{info, warn};
use rand::Rng;
use std::path::{Path, PathBuf};

/// User-facing settings; turned into a [`PipelineContext`] once per run.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub cache_policy: CachePolicy,
    pub unencoded: UnencodedPolicy,
    pub case_prefix: String,
    pub seed: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            cache_policy: CachePolicy::default(),
            unencoded: UnencodedPolicy::default(),
            case_prefix: DEFAULT_CASE_PREFIX.to_string(),
            seed: None,
        }
    }
}

impl PipelineConfig {
    pub fn into_context(self) -> PipelineContext {
        let seed = match self.seed {
            Some(seed) => seed,
            None => {
                let seed = rand::rng().random::<u64>();
                info!("No seed given; t-SNE runs with seed {}.", seed);
                seed
            }
        };
        PipelineContext {
            layout: DataLayout::new(self.data_dir),
            cache: ArtifactCache::new(self.cache_policy),
            unencoded: self.unencoded,
            case_prefix: self.case_prefix,
            seed,
            tsne: TsneParams::default(),
        }
    }
}

/// Inputs the gene selection modes read besides the dataset itself.
#[derive(Clone, Debug, Default)]
pub struct SelectionInputs {
    pub network: Option<PathBuf>,
    pub risk: Option<PathBuf>,
}

/// Everything a stage needs, passed explicitly from stage to stage.
#[derive(Clone, Debug)]
pub struct PipelineContext {
    pub layout: DataLayout,
    pub cache: ArtifactCache,
    pub unencoded: UnencodedPolicy,
    pub case_prefix: String,
    pub seed: u64,
    pub tsne: TsneParams,
}

fn require(path: &Path, hint: impl Into<String>) -> Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(PipelineError::MissingArtifact {
            path: path.to_path_buf(),
            hint: hint.into(),
        })
    }
}

impl PipelineContext {
    /// Parses one cohort VCF and normalizes it, reusing fresh artifacts.
    /// Returns the path of the encoded cohort table.
    pub fn parse_cohort(
        &self,
        kind: CohortKind,
        chromosome: Chromosome,
        vcf_path: &Path,
        allow_list_path: Option<&Path>,
    ) -> Result<PathBuf> {
        require(vcf_path, "input VCF")?;
        let parsed = self.layout.parsed_vcf(kind, chromosome);
        let mut upstream = vec![vcf_path];
        upstream.extend(allow_list_path);
        let parse_params = StageParams::new().with(
            "samples",
            allow_list_path.map_or("all".to_string(), |p| p.display().to_string()),
        );
        if self.cache.is_fresh(&parsed, &upstream, &parse_params)? {
            info!("Reusing parsed {} table {}", kind, parsed.display());
        } else {
            self.cache.invalidate(&parsed)?;
            let allow_list = allow_list_path.map(SampleAllowList::from_tsv).transpose()?;
            extract_columns(vcf_path, allow_list.as_ref(), &parsed)?;
            self.cache.record(&parsed, &upstream, &parse_params, None)?;
        }

        let normalized = self.layout.normalized_cohort(kind, chromosome);
        let normalize_params = StageParams::new()
            .with("cohort", kind)
            .with("unencoded", self.unencoded);
        if self.cache.is_fresh(&normalized, &[parsed.as_path()], &normalize_params)? {
            info!("Reusing normalized {} table {}", kind, normalized.display());
        } else {
            self.cache.invalidate(&normalized)?;
            normalize_cohort(&parsed, kind, self.unencoded, &normalized)?;
            self.cache
                .record(&normalized, &[parsed.as_path()], &normalize_params, None)?;
        }
        Ok(normalized)
    }

    /// Builds (or reuses) the sample × variant matrix of one chromosome.
    pub fn merge_chromosome(&self, chromosome: Chromosome) -> Result<SampleMatrix> {
        let cases = self.layout.normalized_cohort(CohortKind::Cases, chromosome);
        let controls = self.layout.normalized_cohort(CohortKind::Controls, chromosome);
        let matrix_path = self.layout.chromosome_matrix(chromosome);
        let info_path = self.layout.variant_info(chromosome);
        let upstream = [cases.as_path(), controls.as_path()];

        if info_path.exists() && self.cache.is_fresh(&matrix_path, &upstream, &StageParams::new())? {
            info!("Reusing chromosome {} matrix {}", chromosome, matrix_path.display());
            return SampleMatrix::read_csv_gz(&matrix_path);
        }
        for input in upstream {
            require(input, format!("run `parse` for chromosome {} first", chromosome))?;
        }
        self.cache.invalidate(&matrix_path)?;
        let merged = merge_chromosome(&cases, &controls)?;
        merged.persist(&matrix_path, &info_path)?;
        self.cache.record(
            &matrix_path,
            &upstream,
            &StageParams::new(),
            Some(DatasetTag::new(Stage::Chromosome).with_chromosome(chromosome.to_string())),
        )?;
        Ok(merged.matrix)
    }

    /// Merges chromosomes 1-22 and X and assembles the labelled matrix.
    ///
    /// A chromosome with neither a matrix nor parsed cohorts is a
    /// `MissingArtifact` error unless `allow_partial` is set, in which case it
    /// is left out with a warning.
    pub fn merge_all(&self, allow_partial: bool) -> Result<FeatureMatrix> {
        let mut parts = Vec::new();
        let mut used = Vec::new();
        for chromosome in Chromosome::all() {
            let matrix_path = self.layout.chromosome_matrix(chromosome);
            let has_inputs = [CohortKind::Cases, CohortKind::Controls]
                .iter()
                .all(|&kind| self.layout.normalized_cohort(kind, chromosome).exists());
            if !has_inputs && !matrix_path.exists() {
                if !allow_partial {
                    return Err(PipelineError::MissingArtifact {
                        path: matrix_path,
                        hint: format!(
                            "chromosome {} has no matrix and no parsed cohorts; run `parse` for it or pass --allow-partial",
                            chromosome
                        ),
                    });
                }
                warn!("Chromosome {} has no parsed cohorts or matrix; leaving it out.", chromosome);
                continue;
            }
            parts.push(self.merge_chromosome(chromosome)?);
            used.push(matrix_path);
        }
        if parts.is_empty() {
            return Err(PipelineError::MissingArtifact {
                path: self.layout.root().join("datasets").join("chr"),
                hint: "no chromosome could be merged; run `parse` first".to_string(),
            });
        }
        let merged = assemble(&parts, &self.case_prefix)?;
        let upstream: Vec<&Path> = used.iter().map(PathBuf::as_path).collect();
        let params = StageParams::new()
            .with("case_prefix", &self.case_prefix)
            .with("chromosomes", used.len());
        self.persist(&merged, &self.layout.merged_dataset(), &upstream, &params)?;
        Ok(merged)
    }

    /// Loads a stage output, recovering its tag from the manifest when present.
    pub fn load_dataset(&self, path: &Path) -> Result<FeatureMatrix> {
        require(path, "produce it with an earlier stage or pass an existing file")?;
        let tag = self
            .cache
            .load_tag(path)?
            .unwrap_or_else(|| DatasetTag::new(Stage::External));
        info!("Loading {} dataset {}", tag.name(), path.display());
        FeatureMatrix::read_csv_gz(path, tag)
    }

    /// Writes a dataset and its manifest.
    pub fn persist(
        &self,
        data: &FeatureMatrix,
        path: &Path,
        upstream: &[&Path],
        params: &StageParams,
    ) -> Result<()> {
        self.cache.invalidate(path)?;
        data.write_csv_gz(path)?;
        self.cache.record(path, upstream, params, Some(data.tag.clone()))?;
        info!(
            "Saved {} dataset ({} x {}) to {}",
            data.tag.name(),
            data.nrows(),
            data.ncols(),
            path.display()
        );
        Ok(())
    }

    pub fn clean(&self, data: &FeatureMatrix, percentage: f64) -> Result<FeatureMatrix> {
        let cleaned = clean_missing(data, percentage)?;
        let params = StageParams::new().with("missing_percentage", percentage);
        self.persist(&cleaned, &self.layout.cleaned_dataset(), &[], &params)?;
        Ok(cleaned)
    }

    pub fn impute(&self, data: &FeatureMatrix, strategy: ImputeStrategy) -> Result<FeatureMatrix> {
        let imputed = impute(data, strategy)?;
        let params = StageParams::new().with("strategy", strategy);
        self.persist(&imputed, &self.layout.imputed_dataset(), &[], &params)?;
        Ok(imputed)
    }

    pub fn chi_squared(&self, data: &FeatureMatrix) -> Result<Vec<SignificanceRecord>> {
        let records = chi_squared_test(data)?;
        write_significance(&self.layout.significant_variants(), &records)?;
        Ok(records)
    }

    pub fn normality(&self, data: &FeatureMatrix) -> Result<NormalityReport> {
        let report = normality_test(data)?;
        write_non_normal(&self.layout.non_normal_variants(), &report)?;
        Ok(report)
    }

    pub fn add_genes(&self, data: &FeatureMatrix, gene_list: &Path) -> Result<FeatureMatrix> {
        let annotator = GeneListAnnotator::from_csv(gene_list)?;
        let annotated = add_genes(data, &annotator);
        self.persist(&annotated, &self.layout.annotated_dataset(), &[gene_list], &StageParams::new())?;
        Ok(annotated)
    }

    /// Selects genes for `mode`, writes the selection report and the reduced
    /// matrix.
    pub fn reduce(
        &self,
        data: &FeatureMatrix,
        mode: SelectionMode,
        inputs: &SelectionInputs,
    ) -> Result<FeatureMatrix> {
        if data.genes.is_none() {
            return Err(PipelineError::Shape(format!(
                "{} dataset has no gene labels; annotate it before reducing",
                data.tag.name()
            )));
        }
        let interest = match mode {
            SelectionMode::Pval => {
                let pvalues = read_significance(&self.layout.significant_variants())?;
                pval_genes(data, &pvalues)?
            }
            SelectionMode::Network => network_genes(input_file(&inputs.network, "--network")?)?,
            SelectionMode::Risk => risk_genes(input_file(&inputs.risk, "--risk")?)?,
        };
        let selection = select_genes(data, mode, &interest)?;
        write_selection_report(&self.layout.gene_selection_report(mode), &selection)?;
        let reduced = reduce_features(data, &selection, &self.tsne, self.seed)?;
        let params = StageParams::new().with("mode", mode).with("seed", self.seed);
        self.persist(&reduced, &self.layout.reduced_dataset(mode), &[], &params)?;
        Ok(reduced)
    }
}

fn input_file<'a>(path: &'a Option<PathBuf>, flag: &str) -> Result<&'a Path> {
    let path = path.as_deref().ok_or_else(|| PipelineError::MissingArtifact {
        path: PathBuf::new(),
        hint: format!("pass the gene table with {}", flag),
    })?;
    require(path, format!("file given to {}", flag))?;
    Ok(path)
}
