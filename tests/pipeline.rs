use approx::assert_abs_diff_eq;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use tempfile::tempdir;
use variant_matrix::cohort::CohortKind;
use variant_matrix::layout::Chromosome;
use variant_matrix::matrix::Stage;
use variant_matrix::pipeline::{PipelineConfig, SelectionInputs};
use variant_matrix::reduce::SelectionMode;

const CASES_VCF: &str = "##fileformat=VCFv4.1\n\
##source=cases\n\
#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tEx1\tEx2\tCt1\n\
1\t100\t.\tA\tG\t50\tPASS\t.\tGT:DP\t0/1:35\t1/1:20\t./.:0\n\
1\t200\t.\tC\tT\t50\tPASS\t.\tGT:DP\t0/0:12\t0/1:9\t0/0:14\n";

const CONTROLS_VCF: &str = "##fileformat=VCFv4.1\n\
##source=controls\n\
#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tCt1\tEx1\tEx2\n\
1\t100\t.\tA\tG\t50\tPASS\tAC=3;VT=SNP\tGT\t0|0\t0|1\t1|1\n\
1\t200\t.\tC\tA\t50\tPASS\tVT=SNP\tGT\t0|0\t0|0\t0|0\n\
1\t300\t.\tG\tGA\t50\tPASS\tVT=SV\tGT\t0|0\t0|0\t0|0\n";

fn write_gzip(path: &Path, contents: &str) {
    let mut encoder = GzEncoder::new(File::create(path).unwrap(), Compression::default());
    encoder.write_all(contents.as_bytes()).unwrap();
    encoder.finish().unwrap();
}

#[test]
fn vcf_to_reduced_features() {
    let dir = tempdir().unwrap();
    let cases_vcf = dir.path().join("cases_chr1.vcf.gz");
    let controls_vcf = dir.path().join("controls_chr1.vcf.gz");
    write_gzip(&cases_vcf, CASES_VCF);
    write_gzip(&controls_vcf, CONTROLS_VCF);

    let ctx = PipelineConfig {
        data_dir: dir.path().join("data"),
        seed: Some(42),
        ..PipelineConfig::default()
    }
    .into_context();
    let chr1 = Chromosome::Autosome(1);

    ctx.parse_cohort(CohortKind::Cases, chr1, &cases_vcf, None).unwrap();
    ctx.parse_cohort(CohortKind::Controls, chr1, &controls_vcf, None).unwrap();

    // chr1:200 differs in ALT between cohorts, so only chr1:100 survives the join.
    let matrix = ctx.merge_chromosome(chr1).unwrap();
    assert_eq!(matrix.columns, vec!["chr1:100"]);
    assert_eq!(matrix.samples, vec!["Ex1", "Ex2", "Ct1"]);
    assert_eq!(matrix.values.column(0).to_vec(), vec![1.0, 2.0, 0.0]);
    let info = std::fs::read_to_string(ctx.layout.variant_info(chr1)).unwrap();
    assert_eq!(info, "VAR,REF,ALT\nchr1:100,A,G\n");

    let reused = ctx.merge_chromosome(chr1).unwrap();
    assert_eq!(reused, matrix);

    // Only chromosome 1 was parsed.
    assert!(ctx.merge_all(false).is_err());
    let merged = ctx.merge_all(true).unwrap();
    assert_eq!(merged.labels, vec![1, 1, 0]);
    assert_eq!(merged.tag.stage, Stage::Merged);

    let loaded = ctx.load_dataset(&ctx.layout.merged_dataset()).unwrap();
    assert_eq!(loaded.tag.stage, Stage::Merged);
    let cleaned = ctx.clean(&loaded, 50.0).unwrap();
    assert_eq!(cleaned.ncols(), 1);

    let gene_list = dir.path().join("geneList.csv");
    std::fs::write(&gene_list, "Genes,Variants\nSHANK3,chr1:100\n").unwrap();
    let annotated = ctx.add_genes(&cleaned, &gene_list).unwrap();

    let risk = dir.path().join("riskGenes.csv");
    std::fs::write(&risk, "Locus;Source\nSHANK3;curated\nNRXN1;curated\n").unwrap();
    let inputs = SelectionInputs {
        risk: Some(risk),
        ..SelectionInputs::default()
    };
    let reduced = ctx.reduce(&annotated, SelectionMode::Risk, &inputs).unwrap();
    assert_eq!(
        reduced.columns,
        vec!["SHANK3_PCA", "SHANK3_TSNE", "SHANK3_mean", "SHANK3_var"]
    );
    assert_eq!(reduced.labels, vec![1, 1, 0]);
    for (got, want) in reduced.values.column(0).iter().zip([0.0, 1.0, -1.0]) {
        assert_abs_diff_eq!(*got, want, epsilon = 1e-12);
    }
    assert_eq!(reduced.values.column(2).to_vec(), vec![1.0, 2.0, 0.0]);
    assert_eq!(reduced.values.column(3).to_vec(), vec![0.0, 0.0, 0.0]);

    let report = std::fs::read_to_string(ctx.layout.gene_selection_report(SelectionMode::Risk)).unwrap();
    assert_eq!(
        report,
        "\nTotal genes of interest: 2\nGenes of interest in dataset: 1\nSHANK3"
    );
    let reloaded = ctx
        .load_dataset(&ctx.layout.reduced_dataset(SelectionMode::Risk))
        .unwrap();
    assert_eq!(reloaded.tag.selection, Some(SelectionMode::Risk));
    assert_eq!(reloaded.columns, reduced.columns);
}

#[test]
fn unknown_genotype_aborts_parsing_by_default() {
    let dir = tempdir().unwrap();
    let vcf = dir.path().join("bad.vcf.gz");
    write_gzip(
        &vcf,
        "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tEx1\n\
         1\t5\t.\tA\tG\t50\tPASS\t.\tGT\t9/9\n",
    );
    let ctx = PipelineConfig {
        data_dir: dir.path().join("data"),
        seed: Some(1),
        ..PipelineConfig::default()
    }
    .into_context();
    let err = ctx
        .parse_cohort(CohortKind::Cases, Chromosome::Autosome(1), &vcf, None)
        .unwrap_err();
    assert!(matches!(
        err,
        variant_matrix::PipelineError::UnencodedGenotype { .. }
    ));
}
