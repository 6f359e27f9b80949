// main.rs

use anyhow::{anyhow, Context, Error, Result};
use clap::Parser;
use log::info;
use std::time::Instant;
use variant_matrix::pipeline::{PipelineConfig, PipelineContext, SelectionInputs};

fn main() -> Result<(), Error> {
    let total_time_start = Instant::now();
    let cli_args = cli::CliArgs::parse();

    // Initialize logger
    let log_level = cli_args
        .log_level
        .parse::<log::LevelFilter>()
        .unwrap_or_else(|_| {
            eprintln!(
                "Warning: Invalid log level '{}' provided. Defaulting to Info.",
                cli_args.log_level
            );
            log::LevelFilter::Info
        });
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_micros()
        .init();

    info!("Starting variant_matrix with args: {:?}", cli_args);

    let num_threads = cli_args.threads.unwrap_or_else(num_cpus::get);
    info!("Using {} threads for parallel operations.", num_threads);
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build_global()?;

    let ctx = PipelineConfig {
        data_dir: cli_args.data_dir.clone(),
        cache_policy: cli_args.cache_policy,
        unencoded: cli_args.unencoded,
        case_prefix: cli_args.case_prefix.clone(),
        seed: cli_args.seed,
    }
    .into_context();

    match &cli_args.command {
        cli::Command::Parse(args) => commands::parse(&ctx, args)?,
        cli::Command::Merge(args) => commands::merge(&ctx, args)?,
        cli::Command::MergeAll(args) => commands::merge_all(&ctx, args)?,
        cli::Command::Process(args) => commands::process(&ctx, args)?,
    }

    info!(
        "variant_matrix finished successfully in {:.2?}.",
        total_time_start.elapsed()
    );
    Ok(())
}

mod cli {
    use clap::{Args, Parser, Subcommand, ValueEnum};
    use std::path::PathBuf;
    use variant_matrix::assemble::DEFAULT_CASE_PREFIX;
    use variant_matrix::cache::CachePolicy;
    use variant_matrix::cohort::CohortKind;
    use variant_matrix::genotype::UnencodedPolicy;
    use variant_matrix::layout::Chromosome;
    use variant_matrix::missing::ImputeStrategy;
    use variant_matrix::reduce::SelectionMode;

    #[derive(Parser, Debug)]
    #[command(author, version, about = "Case/control variant matrices from VCF files, reduced to gene features.", long_about = None, propagate_version = true)]
    pub(crate) struct CliArgs {
        #[command(subcommand)]
        pub(crate) command: Command,

        /// Root of the data directory tree.
        #[arg(short = 'd', long, default_value = "data", global = true)]
        pub(crate) data_dir: PathBuf,

        #[arg(short = 't', long, global = true)]
        pub(crate) threads: Option<usize>,

        #[arg(long, default_value = "Info", global = true)]
        pub(crate) log_level: String,

        /// Seed for the t-SNE embedding; random (and logged) when absent.
        #[arg(long, global = true)]
        pub(crate) seed: Option<u64>,

        /// `fingerprint` or `existence`.
        #[arg(long, default_value = "fingerprint", global = true)]
        pub(crate) cache_policy: CachePolicy,

        /// What to do with genotype strings outside the known set: `fail` or `missing`.
        #[arg(long, default_value = "fail", global = true)]
        pub(crate) unencoded: UnencodedPolicy,

        #[arg(long, default_value = DEFAULT_CASE_PREFIX, global = true)]
        pub(crate) case_prefix: String,
    }

    #[derive(Subcommand, Debug)]
    pub(crate) enum Command {
        /// Parse and normalize one cohort VCF for one chromosome.
        Parse(ParseArgs),
        /// Merge cases and controls of one chromosome.
        Merge(MergeArgs),
        /// Merge chromosomes 1-22 and X into the labelled dataset.
        MergeAll(MergeAllArgs),
        /// Run the downstream stages on an assembled dataset.
        Process(ProcessArgs),
    }

    #[derive(Args, Debug)]
    pub(crate) struct ParseArgs {
        #[arg(long)]
        pub(crate) cohort: CohortKind,

        #[arg(short = 'c', long)]
        pub(crate) chromosome: Chromosome,

        /// gzip-compressed VCF.
        #[arg(long)]
        pub(crate) vcf: PathBuf,

        /// TSV whose first column lists the samples to keep.
        #[arg(long)]
        pub(crate) samples: Option<PathBuf>,
    }

    #[derive(Args, Debug)]
    pub(crate) struct MergeArgs {
        #[arg(short = 'c', long)]
        pub(crate) chromosome: Chromosome,
    }

    #[derive(Args, Debug)]
    pub(crate) struct MergeAllArgs {
        /// Leave out chromosomes that have neither a matrix nor parsed cohorts.
        #[arg(long)]
        pub(crate) allow_partial: bool,
    }

    #[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) enum TestKind {
        Chi2,
        Normality,
    }

    #[derive(Args, Debug)]
    pub(crate) struct ProcessArgs {
        /// Dataset to start from; defaults to the merged dataset.
        #[arg(short, long)]
        pub(crate) input: Option<PathBuf>,

        /// Drop columns with more than this percentage of missing cells.
        #[arg(long)]
        pub(crate) clean_missing: Option<f64>,

        /// `mean`, `median` or `most_frequent`.
        #[arg(long)]
        pub(crate) impute: Option<ImputeStrategy>,

        #[arg(long = "test", value_enum)]
        pub(crate) tests: Vec<TestKind>,

        /// `Genes,Variants` table used to label columns with genes.
        #[arg(long)]
        pub(crate) add_genes: Option<PathBuf>,

        #[arg(long)]
        pub(crate) reduce: Option<SelectionMode>,

        /// Centrality table for `--reduce network`.
        #[arg(long)]
        pub(crate) network: Option<PathBuf>,

        /// `;`-separated risk gene table for `--reduce risk`.
        #[arg(long)]
        pub(crate) risk: Option<PathBuf>,
    }
}

mod commands {
    use super::cli::{MergeAllArgs, MergeArgs, ParseArgs, ProcessArgs, TestKind};
    use super::{anyhow, info, Context, PipelineContext, Result, SelectionInputs};
    use variant_matrix::cohort::CohortKind;

    pub(crate) fn parse(ctx: &PipelineContext, args: &ParseArgs) -> Result<()> {
        let normalized = ctx
            .parse_cohort(
                args.cohort,
                args.chromosome,
                &args.vcf,
                args.samples.as_deref(),
            )
            .with_context(|| format!("Failed to parse {}", args.vcf.display()))?;
        info!("{} chromosome {} ready at {}", args.cohort, args.chromosome, normalized.display());
        if args.cohort == CohortKind::Cases {
            info!("Parse the matching controls before running `merge`.");
        }
        Ok(())
    }

    pub(crate) fn merge(ctx: &PipelineContext, args: &MergeArgs) -> Result<()> {
        let matrix = ctx
            .merge_chromosome(args.chromosome)
            .with_context(|| format!("Failed to merge chromosome {}", args.chromosome))?;
        info!(
            "Chromosome {}: {} samples x {} variants.",
            args.chromosome,
            matrix.samples.len(),
            matrix.columns.len()
        );
        Ok(())
    }

    pub(crate) fn merge_all(ctx: &PipelineContext, args: &MergeAllArgs) -> Result<()> {
        let merged = ctx
            .merge_all(args.allow_partial)
            .context("Failed to assemble the merged dataset")?;
        info!("Merged dataset: {} samples x {} variants.", merged.nrows(), merged.ncols());
        Ok(())
    }

    pub(crate) fn process(ctx: &PipelineContext, args: &ProcessArgs) -> Result<()> {
        let input = args
            .input
            .clone()
            .unwrap_or_else(|| ctx.layout.merged_dataset());
        let mut data = ctx.load_dataset(&input)?;
        let mut ran_any = false;

        if let Some(percentage) = args.clean_missing {
            data = ctx.clean(&data, percentage)?;
            ran_any = true;
        }
        if let Some(strategy) = args.impute {
            data = ctx.impute(&data, strategy)?;
            ran_any = true;
        }
        for test in &args.tests {
            match test {
                TestKind::Chi2 => {
                    ctx.chi_squared(&data)?;
                }
                TestKind::Normality => {
                    ctx.normality(&data)?;
                }
            }
            ran_any = true;
        }
        if let Some(gene_list) = &args.add_genes {
            data = ctx.add_genes(&data, gene_list)?;
            ran_any = true;
        }
        if let Some(mode) = args.reduce {
            let inputs = SelectionInputs {
                network: args.network.clone(),
                risk: args.risk.clone(),
            };
            data = ctx
                .reduce(&data, mode, &inputs)
                .with_context(|| format!("Failed to reduce to {} gene features", mode))?;
            ran_any = true;
        }

        if !ran_any {
            return Err(anyhow!(
                "Nothing to do: pass at least one of --clean-missing, --impute, --test, --add-genes or --reduce."
            ));
        }
        info!("Final dataset: {} samples x {} columns.", data.nrows(), data.ncols());
        Ok(())
    }
}
