// reduce.rs

use crate::error::{PipelineError, Result};
use crate::layout::ensure_parent;
use crate::matrix::{DatasetTag, FeatureMatrix, Stage};
use crate::pca::first_component;
use crate::stats::{progress_bar, ALPHA};
use crate::tsne::{embed_1d, TsneParams};
use log::{debug, info, warn};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

/// How many genes each centrality ranking contributes in `network` mode.
pub const NETWORK_TOP_GENES: usize = 100;

pub const CENTRALITY_COLUMNS: [&str; 3] = ["betweenness", "closeness", "degree_distribuition"];

/// Column of the risk-gene table holding gene symbols.
pub const RISK_LOCUS_COLUMN: &str = "Locus";

/// Which genes are reduced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionMode {
    /// Genes whose mean variant p-value is at most 0.05.
    Pval,
    /// Genes ranked in the top 100 of every centrality measure.
    Network,
    /// Genes from a curated risk list.
    Risk,
}

impl fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionMode::Pval => write!(f, "pval"),
            SelectionMode::Network => write!(f, "network"),
            SelectionMode::Risk => write!(f, "risk"),
        }
    }
}

impl FromStr for SelectionMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pval" => Ok(SelectionMode::Pval),
            "network" => Ok(SelectionMode::Network),
            "risk" => Ok(SelectionMode::Risk),
            other => Err(PipelineError::UnsupportedKeyword {
                what: "gene selection mode",
                value: other.to_string(),
            }),
        }
    }
}

/// Genes whose average p-value over their annotated variants is at most
/// 0.05. Variants without a p-value do not contribute.
pub fn pval_genes(data: &FeatureMatrix, pvalues: &HashMap<String, f64>) -> Result<Vec<String>> {
    let genes = attached_genes(data)?;
    let mut sums: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
    for (variant, gene) in data.columns.iter().zip(genes) {
        let (Some(gene), Some(&p)) = (gene.as_deref(), pvalues.get(variant)) else {
            continue;
        };
        let entry = sums.entry(gene).or_insert((0.0, 0));
        entry.0 += p;
        entry.1 += 1;
    }
    Ok(sums
        .into_iter()
        .filter(|(_, (sum, count))| sum / *count as f64 <= ALPHA)
        .map(|(gene, _)| gene.to_string())
        .collect())
}

fn column_index(headers: &csv::StringRecord, name: &str, path: &Path) -> Result<usize> {
    headers
        .iter()
        .position(|h| h == name)
        .ok_or_else(|| PipelineError::MissingColumn {
            path: path.to_path_buf(),
            column: name.to_string(),
        })
}

/// Intersection of the top genes by betweenness, closeness and degree.
/// The gene symbol is the first column of the table.
pub fn network_genes(path: &Path) -> Result<Vec<String>> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    let indices: Vec<usize> = CENTRALITY_COLUMNS
        .iter()
        .map(|name| column_index(&headers, name, path))
        .collect::<Result<_>>()?;

    let mut rows: Vec<(String, Vec<f64>)> = Vec::new();
    for record in reader.records() {
        let record = record?;
        let gene = record.get(0).unwrap_or_default().to_string();
        let scores = indices
            .iter()
            .map(|&i| {
                record
                    .get(i)
                    .and_then(|v| v.trim().parse::<f64>().ok())
                    .unwrap_or(f64::NAN)
            })
            .collect();
        rows.push((gene, scores));
    }

    let mut selected: Option<HashSet<String>> = None;
    for measure in 0..CENTRALITY_COLUMNS.len() {
        let mut ranked: Vec<&(String, Vec<f64>)> = rows.iter().collect();
        // descending, missing scores last
        ranked.sort_by(|a, b| match (a.1[measure].is_nan(), b.1[measure].is_nan()) {
            (false, false) => b.1[measure].total_cmp(&a.1[measure]),
            (x, y) => x.cmp(&y),
        });
        let top: HashSet<String> = ranked
            .into_iter()
            .take(NETWORK_TOP_GENES)
            .map(|(gene, _)| gene.clone())
            .collect();
        selected = Some(match selected {
            None => top,
            Some(current) => current.intersection(&top).cloned().collect(),
        });
    }
    let mut genes: Vec<String> = selected.unwrap_or_default().into_iter().collect();
    genes.sort();
    info!("Network centrality: {} genes in every top-{} list.", genes.len(), NETWORK_TOP_GENES);
    Ok(genes)
}

/// Gene symbols from the `Locus` column of a `;`-separated risk table.
pub fn risk_genes(path: &Path) -> Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new().delimiter(b';').from_path(path)?;
    let headers = reader.headers()?.clone();
    let locus = column_index(&headers, RISK_LOCUS_COLUMN, path)?;
    let mut genes = Vec::new();
    for record in reader.records() {
        if let Some(gene) = record?.get(locus) {
            genes.push(gene.to_string());
        }
    }
    info!("Risk list {}: {} genes.", path.display(), genes.len());
    Ok(genes)
}

fn attached_genes(data: &FeatureMatrix) -> Result<&[Option<String>]> {
    data.genes.as_deref().ok_or_else(|| {
        PipelineError::Shape("matrix has no gene labels; annotate it before gene-level steps".to_string())
    })
}

/// Gene → column indices, in sorted gene order. Unannotated columns are left out.
pub fn gene_groups(data: &FeatureMatrix) -> Result<BTreeMap<String, Vec<usize>>> {
    let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (i, gene) in attached_genes(data)?.iter().enumerate() {
        if let Some(gene) = gene {
            groups.entry(gene.clone()).or_default().push(i);
        }
    }
    Ok(groups)
}

/// Row-wise mean and sample variance (ddof 1) over the observed cells;
/// an undefined variance is reported as 0.
pub fn row_mean_and_variance(block: ArrayView2<f64>) -> (Array1<f64>, Array1<f64>) {
    let mut means = Array1::<f64>::zeros(block.nrows());
    let mut variances = Array1::<f64>::zeros(block.nrows());
    for (i, row) in block.axis_iter(Axis(0)).enumerate() {
        let observed: Vec<f64> = row.iter().copied().filter(|v| !v.is_nan()).collect();
        let n = observed.len() as f64;
        let mean = observed.iter().sum::<f64>() / n;
        let variance = observed.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (n - 1.0);
        means[i] = mean;
        variances[i] = if variance.is_nan() { 0.0 } else { variance };
    }
    (means, variances)
}

/// The four engineered features of one gene, each one value per sample.
#[derive(Clone, Debug)]
pub struct GeneFeatures {
    pub gene: String,
    pub pca: Array1<f64>,
    pub tsne: Array1<f64>,
    pub mean: Array1<f64>,
    pub variance: Array1<f64>,
}

pub fn gene_features(
    gene: &str,
    block: ArrayView2<f64>,
    params: &TsneParams,
    seed: u64,
) -> Result<GeneFeatures> {
    if block.iter().any(|v| v.is_nan()) {
        return Err(PipelineError::Statistics {
            variant: gene.to_string(),
            message: "gene block has missing values; impute before reducing".to_string(),
        });
    }
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let (mean, variance) = row_mean_and_variance(block);
    Ok(GeneFeatures {
        gene: gene.to_string(),
        pca: first_component(block).map_err(|e| PipelineError::Statistics {
            variant: gene.to_string(),
            message: format!("principal component failed: {}", e),
        })?,
        tsne: embed_1d(block, params, &mut rng),
        mean,
        variance,
    })
}

/// Genes selected for reduction plus the size of the list they came from.
#[derive(Clone, Debug, PartialEq)]
pub struct GeneSelection {
    pub mode: SelectionMode,
    pub genes_of_interest: usize,
    pub genes: Vec<String>,
}

/// Intersects `interest` with the genes labelling `data`, in sorted order.
pub fn select_genes(data: &FeatureMatrix, mode: SelectionMode, interest: &[String]) -> Result<GeneSelection> {
    let wanted: HashSet<&str> = interest.iter().map(String::as_str).collect();
    let genes: Vec<String> = gene_groups(data)?
        .into_keys()
        .filter(|gene| wanted.contains(gene.as_str()))
        .collect();
    info!(
        "Selection '{}': {} genes of interest, {} present in the dataset.",
        mode,
        interest.len(),
        genes.len()
    );
    Ok(GeneSelection {
        mode,
        genes_of_interest: interest.len(),
        genes,
    })
}

/// Replaces the variant columns of every selected gene by its four features.
/// Gene `i` of the selection draws its embedding from stream `seed + i`.
pub fn reduce_features(
    data: &FeatureMatrix,
    selection: &GeneSelection,
    params: &TsneParams,
    seed: u64,
) -> Result<FeatureMatrix> {
    let groups = gene_groups(data)?;
    if selection.genes.is_empty() {
        warn!("No genes selected for '{}'; the reduced matrix has only labels.", selection.mode);
    }
    let bar = progress_bar(selection.genes.len(), "genes");
    let features: Result<Vec<GeneFeatures>> = selection
        .genes
        .par_iter()
        .enumerate()
        .map(|(i, gene)| {
            let columns = groups.get(gene).map(Vec::as_slice).unwrap_or_default();
            let block = data.values.select(Axis(1), columns);
            debug!("Reducing {} ({} variants).", gene, columns.len());
            let out = gene_features(gene, block.view(), params, seed.wrapping_add(i as u64));
            bar.inc(1);
            out
        })
        .collect();
    bar.finish_and_clear();
    let features = features?;

    let mut columns = Vec::with_capacity(features.len() * 4);
    let mut values = Array2::<f64>::zeros((data.nrows(), features.len() * 4));
    for (g, feature) in features.iter().enumerate() {
        for (k, (suffix, series)) in [
            ("PCA", &feature.pca),
            ("TSNE", &feature.tsne),
            ("mean", &feature.mean),
            ("var", &feature.variance),
        ]
        .into_iter()
        .enumerate()
        {
            columns.push(format!("{}_{}", feature.gene, suffix));
            values.column_mut(g * 4 + k).assign(series);
        }
    }
    info!(
        "Reduced {} variant columns to {} gene features.",
        data.ncols(),
        columns.len()
    );
    FeatureMatrix::new(
        data.samples.clone(),
        columns,
        values,
        data.labels.clone(),
        DatasetTag::new(Stage::Reduced).with_selection(selection.mode),
    )
}

/// Writes the `genes/<mode>.csv` summary of a selection.
pub fn write_selection_report(path: &Path, selection: &GeneSelection) -> Result<()> {
    ensure_parent(path)?;
    let mut out = BufWriter::new(File::create(path)?);
    write!(out, "\nTotal genes of interest: {}", selection.genes_of_interest)?;
    write!(out, "\nGenes of interest in dataset: {}", selection.genes.len())?;
    for gene in &selection.genes {
        write!(out, "\n{}", gene)?;
    }
    out.flush()?;
    Ok(())
}
