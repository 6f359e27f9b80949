// annotate.rs

use crate::error::{PipelineError, Result};
use crate::matrix::{parse_gene_label, DatasetTag, FeatureMatrix, Stage};
use log::{debug, info};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Translates variant loci (`chr<C>:<POS>`) to gene symbols.
pub trait GeneAnnotator {
    fn gene_for(&self, locus: &str) -> Option<String>;

    fn annotate(&self, loci: &[String]) -> Vec<Option<String>> {
        loci.iter().map(|locus| self.gene_for(locus)).collect()
    }
}

#[derive(Debug, Deserialize)]
struct GeneListRow {
    #[serde(rename = "Genes")]
    gene: String,
    #[serde(rename = "Variants")]
    variant: String,
}

/// Annotator backed by a precomputed `Genes,Variants` table.
#[derive(Clone, Debug, Default)]
pub struct GeneListAnnotator {
    genes: HashMap<String, String>,
}

impl GeneListAnnotator {
    pub fn from_csv(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(PipelineError::MissingArtifact {
                path: path.to_path_buf(),
                hint: "a 'Genes,Variants' table from the gene lookup".to_string(),
            });
        }
        let mut reader = csv::Reader::from_path(path)?;
        let mut genes = HashMap::new();
        let mut unannotated = 0usize;
        for row in reader.deserialize() {
            let row: GeneListRow = row?;
            match parse_gene_label(&row.gene) {
                Some(gene) => {
                    genes.insert(row.variant, gene);
                }
                None => unannotated += 1,
            }
        }
        debug!(
            "Gene list {}: {} annotated loci, {} without a gene.",
            path.display(),
            genes.len(),
            unannotated
        );
        Ok(Self { genes })
    }

    pub fn from_pairs<I, G, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (G, V)>,
        G: Into<String>,
        V: Into<String>,
    {
        Self {
            genes: pairs
                .into_iter()
                .map(|(gene, variant)| (variant.into(), gene.into()))
                .collect(),
        }
    }
}

impl GeneAnnotator for GeneListAnnotator {
    fn gene_for(&self, locus: &str) -> Option<String> {
        self.genes.get(locus).cloned()
    }
}

/// Attaches a gene label to every column of `data`.
pub fn add_genes(data: &FeatureMatrix, annotator: &dyn GeneAnnotator) -> FeatureMatrix {
    let genes = annotator.annotate(&data.columns);
    let annotated = genes.iter().filter(|g| g.is_some()).count();
    info!(
        "Annotated {} of {} variants with a gene.",
        annotated,
        genes.len()
    );
    let mut out = data.clone().with_tag(DatasetTag::new(Stage::Annotated));
    out.genes = Some(genes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn gene_list_skips_no_gene_spellings() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("geneList.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "Genes,Variants").unwrap();
        writeln!(file, "BRCA2,chr13:32900000").unwrap();
        writeln!(file, "None,chr13:1").unwrap();
        writeln!(file, "NONE,chr13:2").unwrap();
        drop(file);

        let annotator = GeneListAnnotator::from_csv(&path).unwrap();
        assert_eq!(annotator.gene_for("chr13:32900000").as_deref(), Some("BRCA2"));
        assert_eq!(annotator.gene_for("chr13:1"), None);
        assert_eq!(annotator.gene_for("chr13:99"), None);
    }

    #[test]
    fn add_genes_labels_every_column() {
        let data = FeatureMatrix::new(
            vec!["Ex1".into()],
            vec!["chr1:1".into(), "chr1:2".into()],
            array![[0.0, 1.0]],
            vec![1],
            DatasetTag::new(Stage::Imputed),
        )
        .unwrap();
        let annotator = GeneListAnnotator::from_pairs([("SHANK3", "chr1:2")]);
        let annotated = add_genes(&data, &annotator);
        assert_eq!(annotated.genes, Some(vec![None, Some("SHANK3".to_string())]));
        assert_eq!(annotated.tag.stage, Stage::Annotated);
        assert_eq!(annotated.values, data.values);
    }

    #[test]
    fn missing_gene_list_is_reported() {
        let dir = tempdir().unwrap();
        let err = GeneListAnnotator::from_csv(&dir.path().join("nope.csv")).unwrap_err();
        assert!(matches!(err, PipelineError::MissingArtifact { .. }));
    }
}
