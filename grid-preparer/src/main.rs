mod instrumented_reader;
mod matrix_file;
mod potentially_compressed;
mod protobuf_helpers;
mod records;
mod settings;
mod tables;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use pentad_sdm::{
    combine, Aggregation, Aggregator, CellCodec, CoordGeo, GridCellId, GridKind, LabelGenerator,
    LookupGrid, PipelineConfig, SpeciesId, SpeciesReference, SpeciesResolver,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use records::{ObservationBatches, ObservationColumns};
use settings::ConfigArgs;

#[derive(Parser)]
#[command(name = "grid-preparer", about = "Prepare gridded species-distribution training data")]
struct ClArgs {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    config: ConfigArgs,

    /// Verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbosity: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Encode a coordinate into its cell, or decode a cell id
    Cell {
        #[arg(long, allow_hyphen_values = true, requires = "longitude")]
        latitude: Option<f64>,
        #[arg(long, allow_hyphen_values = true, requires = "latitude")]
        longitude: Option<f64>,
        /// Cell id to decode
        #[arg(long, conflicts_with = "latitude")]
        decode: Option<String>,
        #[command(flatten)]
        grid: GridArgs,
    },
    /// Build a lookup grid table from a list of grid-point identifiers
    BuildLookupGrid {
        /// CSV with an IDENTIFIER column
        identifiers: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Aggregate an observation export into a count matrix
    Aggregate {
        /// Observation export, optionally gzip-compressed
        input: PathBuf,
        #[command(flatten)]
        inputs: AggregateInputs,
        /// Reference name column matching this source's species names
        #[arg(long, required_unless_present = "species_id")]
        name_column: Option<String>,
        /// Treat every record as this species (single-species exports)
        #[arg(long, conflicts_with = "name_column")]
        species_id: Option<String>,
        #[arg(long, default_value = "species")]
        species_field: String,
        #[arg(long, default_value = "decimalLatitude")]
        latitude_field: String,
        #[arg(long, default_value = "decimalLongitude")]
        longitude_field: String,
        /// Field delimiter (default: tab)
        #[arg(long, default_value = "\t")]
        delimiter: String,
        /// Tally batches on all cores
        #[arg(long)]
        parallel: bool,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Aggregate per-species checklist card files (`<species id>.csv`)
    AggregateCards {
        /// Directory of card files
        dir: PathBuf,
        #[command(flatten)]
        inputs: AggregateInputs,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Sum the count matrices of one trust tier
    Combine {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Write labelled training rows for target species
    Label {
        #[arg(long)]
        verified: PathBuf,
        #[arg(long)]
        unverified: PathBuf,
        /// Standardized covariate table (see prepare-covariates)
        #[arg(long)]
        covariates: PathBuf,
        /// Target species ids; all reference species when empty
        #[arg(long = "species", num_args = 1..)]
        species: Vec<String>,
        /// Reference list, used when no species are given
        #[arg(long, required_unless_present = "species")]
        reference: Option<PathBuf>,
        #[command(flatten)]
        grid: GridArgs,
        /// Output directory; one `<species id>.csv` per species
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Match reference scientific names against a source's species names
    NameReport {
        input: PathBuf,
        #[arg(long)]
        reference: PathBuf,
        #[arg(long, default_value = "species")]
        species_field: String,
        #[arg(long, default_value = "\t")]
        delimiter: String,
        /// Name column to create in the reference list
        #[arg(long)]
        column: String,
        /// Matched names
        #[arg(long)]
        mapping: PathBuf,
        /// Reference species with no match
        #[arg(long)]
        unmatched: PathBuf,
    },
    /// Outer-join covariate tables by cell and standardize every column
    PrepareCovariates {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        #[command(flatten)]
        grid: GridArgs,
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[derive(Args)]
struct GridArgs {
    /// Lookup grid table (see build-lookup-grid); the pentad grid is used
    /// when absent
    #[arg(long)]
    lookup_grid: Option<PathBuf>,
}

impl GridArgs {
    fn load(&self) -> Result<GridKind> {
        match &self.lookup_grid {
            Some(path) => Ok(GridKind::lookup(tables::read_lookup_grid(path)?)),
            None => Ok(GridKind::Formula),
        }
    }
}

#[derive(Args)]
struct AggregateInputs {
    /// Species reference list
    #[arg(long)]
    reference: PathBuf,
    /// Master grid (`pentad` or `IDENTIFIER` column); defaults to the cells
    /// of the lookup grid
    #[arg(long, required_unless_present = "lookup_grid")]
    master_grid: Option<PathBuf>,
    #[command(flatten)]
    grid: GridArgs,
}

struct AggregateContext {
    reference: SpeciesReference,
    grid: GridKind,
    master_grid: Vec<GridCellId>,
}

impl AggregateInputs {
    fn load(&self) -> Result<AggregateContext> {
        let reference = tables::read_reference(&self.reference)?;
        let grid = self.grid.load()?;
        let master_grid = match (&self.master_grid, &grid) {
            (Some(path), _) => tables::read_master_grid(path, &grid)?,
            (None, GridKind::Lookup(lookup)) => lookup.cells().iter().map(|c| c.id.clone()).collect(),
            (None, GridKind::Formula) => bail!("the pentad grid needs --master-grid"),
        };
        Ok(AggregateContext {
            reference,
            grid,
            master_grid,
        })
    }
}

fn delimiter(raw: &str) -> Result<u8> {
    match raw {
        "\\t" | "tab" => Ok(b'\t'),
        _ if raw.len() == 1 => Ok(raw.as_bytes()[0]),
        _ => bail!("delimiter must be a single byte, got {raw:?}"),
    }
}

fn main() -> Result<()> {
    let args = ClArgs::parse();

    let default_level = match args.verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = args.config.load()?;
    info!(?config, "configuration");

    match args.command {
        Command::Cell {
            latitude,
            longitude,
            decode,
            grid,
        } => cell(grid.load()?, latitude.zip(longitude), decode),
        Command::BuildLookupGrid { identifiers, output } => {
            let identifiers = tables::read_identifiers(&identifiers)?;
            let grid = LookupGrid::from_identifiers(identifiers.iter().map(String::as_str))?;
            tables::write_lookup_grid(&output, &grid)
        }
        Command::Aggregate {
            input,
            inputs,
            name_column,
            species_id,
            species_field,
            latitude_field,
            longitude_field,
            delimiter: raw_delimiter,
            parallel,
            output,
        } => {
            let context = inputs.load()?;
            // Single-species exports often carry coordinates only.
            let (resolver, require_species): (Box<dyn SpeciesResolver>, bool) =
                match (name_column, species_id) {
                    (_, Some(id)) => (Box::new(context.reference.fixed(SpeciesId::new(id))?), false),
                    (Some(column), None) => (Box::new(context.reference.resolver(&column)?), true),
                    (None, None) => bail!("either --name-column or --species-id is required"),
                };
            let columns = ObservationColumns {
                species: species_field,
                latitude: latitude_field,
                longitude: longitude_field,
                delimiter: delimiter(&raw_delimiter)?,
            };
            let batches = ObservationBatches::open(&input, &columns, config.batch_size, require_species)?;
            let aggregator = aggregator(&config, &context);
            let result = if parallel {
                aggregator.aggregate_parallel(batches, &*resolver)
            } else {
                aggregator.aggregate(batches, &*resolver)
            }
            .with_context(|| format!("aggregating {}", input.display()))?;
            finish_aggregation(&output, result)
        }
        Command::AggregateCards {
            dir,
            inputs,
            output,
        } => {
            let context = inputs.load()?;
            let files: Vec<_> = records::card_files(&dir)?
                .into_iter()
                .filter(|(id, path)| {
                    let known = context.reference.contains(id);
                    if !known {
                        warn!(%id, path = %path.display(), "card file for a species not in the reference list");
                    }
                    known
                })
                .collect();
            info!(files = files.len(), "aggregating card files");
            let batches = records::CardBatches::new(files, config.batch_size);
            let result = aggregator(&config, &context)
                .aggregate_cards(batches)
                .with_context(|| format!("aggregating cards in {}", dir.display()))?;
            finish_aggregation(&output, result)
        }
        Command::Combine { inputs, output } => {
            let matrices = inputs
                .iter()
                .map(|path| matrix_file::read_matrix(path))
                .collect::<Result<Vec<_>>>()?;
            let tier = combine(&matrices)?;
            matrix_file::write_tier(&output, &tier)
        }
        Command::Label {
            verified,
            unverified,
            covariates,
            species,
            reference,
            grid,
            output,
        } => label(
            &config,
            LabelInputs {
                verified: &verified,
                unverified: &unverified,
                covariates: &covariates,
                species,
                reference: reference.as_deref(),
                grid: grid.load()?,
            },
            &output,
        ),
        Command::NameReport {
            input,
            reference,
            species_field,
            delimiter: raw_delimiter,
            column,
            mapping,
            unmatched,
        } => {
            let reference = tables::read_reference(&reference)?;
            let columns = ObservationColumns {
                species: species_field,
                delimiter: delimiter(&raw_delimiter)?,
                ..ObservationColumns::default()
            };
            let names = records::distinct_species(&input, &columns)?;
            let report = reference.name_match_report(names.iter().map(String::as_str));
            info!(
                observed = report.observed_names,
                matched = report.matched.len(),
                unmatched = report.unmatched.len(),
                "name report"
            );
            tables::write_name_report(&mapping, &unmatched, &column, &report)
        }
        Command::PrepareCovariates {
            inputs,
            grid,
            output,
        } => {
            let grid = grid.load()?;
            let mut table: Option<pentad_sdm::CovariateTable> = None;
            for path in &inputs {
                let next = tables::read_covariates(path, &grid)?;
                table = Some(match table {
                    Some(joined) => joined.outer_join(&next)?,
                    None => next,
                });
            }
            let Some(mut table) = table else {
                bail!("no covariate tables given");
            };
            table.standardize();
            tables::write_covariates(&output, &table)
        }
    }
}

fn cell(grid: GridKind, coordinate: Option<(f64, f64)>, decode: Option<String>) -> Result<()> {
    match (coordinate, decode) {
        (Some((latitude, longitude)), _) => {
            let coord = CoordGeo::checked(latitude, longitude)
                .with_context(|| format!("{latitude}, {longitude} is not a coordinate"))?;
            match grid.encode(&coord) {
                Some(id) => println!("{id}"),
                None => bail!("{coord} is outside the {} grid", grid.name()),
            }
        }
        (None, Some(id)) => {
            let id = grid.normalize(&id);
            println!("{}", grid.decode(&id)?);
        }
        (None, None) => bail!("give --latitude and --longitude, or --decode"),
    }
    Ok(())
}

fn aggregator<'a>(config: &'a PipelineConfig, context: &'a AggregateContext) -> Aggregator<'a> {
    Aggregator::new(
        config,
        &context.grid,
        &context.master_grid,
        context.reference.columns(),
    )
}

fn finish_aggregation(output: &Path, result: Aggregation) -> Result<()> {
    let report = result.report;
    info!(
        records = report.records,
        aggregated = report.aggregated,
        skipped = report.skipped,
        unmapped = report.unmapped,
        outside = report.outside_master_grid,
        not_recorded = report.not_recorded,
        "aggregation report"
    );
    matrix_file::write_matrix(output, &result.matrix)
}

struct LabelInputs<'a> {
    verified: &'a Path,
    unverified: &'a Path,
    covariates: &'a Path,
    species: Vec<String>,
    reference: Option<&'a Path>,
    grid: GridKind,
}

fn label(config: &PipelineConfig, inputs: LabelInputs<'_>, output: &Path) -> Result<()> {
    let verified = combine([&matrix_file::read_matrix(inputs.verified)?])?;
    let unverified = combine([&matrix_file::read_matrix(inputs.unverified)?])?;
    let covariates = tables::read_covariates(inputs.covariates, &inputs.grid)?;

    let targets: Vec<SpeciesId> = if inputs.species.is_empty() {
        let path = inputs
            .reference
            .context("give --species or --reference")?;
        tables::read_reference(path)?.species_ids()
    } else {
        inputs.species.into_iter().map(SpeciesId::new).collect()
    };

    std::fs::create_dir_all(output).with_context(|| format!("creating {}", output.display()))?;
    let generator = LabelGenerator::new(config, &verified, &unverified);
    let mut written = 0;
    for (species, labels) in generator.generate_many(&targets) {
        let labels = match labels {
            Ok(labels) => labels,
            Err(e) if e.is_species_skip() => {
                warn!(%species, "skipping species: {e}");
                continue;
            }
            Err(e) => return Err(e).with_context(|| format!("labelling species {species}")),
        };
        let rows = covariates.training_rows(&labels);
        let path = output.join(format!("{species}.csv"));
        tables::write_training_rows(&path, covariates.columns(), &rows)?;
        written += 1;
    }
    info!(written, requested = targets.len(), "wrote training sets");
    Ok(())
}
