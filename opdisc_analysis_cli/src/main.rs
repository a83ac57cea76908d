use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{ArgAction, Parser, Subcommand, ValueEnum, ValueHint};
use ndarray::{Array2, ArrayD, IxDyn};
use opdisc_analysis::partition::partition;
use opdisc_analysis::summary::{
    extreme_means_difference, find_const_vals, group_stats, rolling_mean, GroupStats,
};
use opdisc_analysis::sweep::{
    attractors, bifurcation, group_peaks, group_sweep, sweep_property,
};
use opdisc_analysis::{
    classify, detect, AnalysisParams, Grouping, Multiverse, Property, Universe,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Opinion-dynamics analysis CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Find turning points and attractors of a single series
    Extrema(ExtremaArgs),
    /// Split per-agent data into groups and report per-group statistics
    Partition(PartitionArgs),
    /// Aggregate a summary over a one-dimensional parameter sweep
    Sweep(SweepArgs),
}

#[derive(Parser, Debug)]
struct CommonArgs {
    /// Output JSON path (`-` for stdout)
    #[arg(short, long, default_value = "-", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Optional AnalysisParams JSON; missing fields keep their defaults
    #[arg(long, value_hint = ValueHint::FilePath)]
    params: Option<PathBuf>,

    /// Pretty-print the report
    #[arg(long, action = ArgAction::SetTrue)]
    pretty: bool,

    /// Enable debug logging
    #[arg(short, long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct ExtremaArgs {
    /// JSON file with `values` and optional `x`
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Rolling window applied before the search (1 disables smoothing)
    #[arg(long, default_value_t = 1)]
    window: usize,

    /// Also report plateaus of at least `const_window` of the series length
    #[arg(long, action = ArgAction::SetTrue)]
    plateaus: bool,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Parser, Debug)]
struct PartitionArgs {
    /// JSON file with `data`, `groups`, `group_list` and optional `dynamic`
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Include the raw per-group values in the report
    #[arg(long, action = ArgAction::SetTrue)]
    values: bool,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Parser, Debug)]
struct SweepArgs {
    /// JSON file with a `universes` array
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,

    #[arg(long, value_enum, default_value_t = SweepKind::Property)]
    kind: SweepKind,

    /// Summary to sweep when `--kind property`
    #[arg(long, default_value = "number_of_peaks")]
    property: String,

    /// Swept coordinate; deduced when omitted
    #[arg(long)]
    dim: Option<String>,

    /// Coordinates to ignore when deducing the sweep dimension (comma separated)
    #[arg(long)]
    ignore: Option<String>,

    /// Group ids (static) or bin edges (dynamic) for `--kind groups`
    #[arg(long)]
    group_list: Option<String>,

    #[arg(long, value_enum, default_value_t = GroupingOpt::Static)]
    grouping: GroupingOpt,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum SweepKind {
    Property,
    Bifurcation,
    Attractors,
    Groups,
    GroupPeaks,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum GroupingOpt {
    Static,
    Dynamic,
}

impl From<GroupingOpt> for Grouping {
    fn from(value: GroupingOpt) -> Self {
        match value {
            GroupingOpt::Static => Grouping::Static,
            GroupingOpt::Dynamic => Grouping::Dynamic,
        }
    }
}

#[derive(Deserialize, Debug)]
struct SeriesInput {
    values: Vec<f64>,
    #[serde(default)]
    x: Option<Vec<f64>>,
}

/// Labels are either one per agent or one row per time step.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum LabelsInput {
    PerAgent(Vec<f64>),
    PerStep(Vec<Vec<f64>>),
}

#[derive(Deserialize, Debug)]
struct PartitionInput {
    data: Vec<Vec<f64>>,
    groups: LabelsInput,
    group_list: Vec<f64>,
    #[serde(default)]
    dynamic: bool,
}

#[derive(Deserialize, Debug)]
struct UniverseInput {
    coords: BTreeMap<String, f64>,
    opinion: Vec<Vec<f64>>,
    #[serde(default)]
    group_label: Option<Vec<Vec<f64>>>,
}

#[derive(Deserialize, Debug)]
struct MultiverseInput {
    universes: Vec<UniverseInput>,
}

#[derive(Serialize, Debug)]
struct Report<T: Serialize> {
    generated_at: String,
    params: JsonValue,
    params_hash: String,
    result: T,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Extrema(args) => args.common.verbose,
        Command::Partition(args) => args.common.verbose,
        Command::Sweep(args) => args.common.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Extrema(args) => handle_extrema(args),
        Command::Partition(args) => handle_partition(args),
        Command::Sweep(args) => handle_sweep(args),
    }
}

fn handle_extrema(args: ExtremaArgs) -> Result<()> {
    let params = load_params(args.common.params.as_deref())?;
    let input: SeriesInput = read_json(&args.input)?;
    if input.values.is_empty() {
        return Err(anyhow!("{} has no values", args.input.display()));
    }

    let series = if args.window > 1 {
        debug!(window = args.window, "smoothing series");
        rolling_mean(&input.values, args.window)
    } else {
        input.values
    };
    let x = input.x.as_deref();

    let extrema = detect(&series, x).context("turning-point search failed")?;
    let attractors = classify(&series, x).context("attractor classification failed")?;
    info!(
        minima = extrema.min.len(),
        maxima = extrema.max.len(),
        "turning points found"
    );
    let plateaus = if args.plateaus {
        Some(find_const_vals(&series, x, &params).context("plateau search failed")?)
    } else {
        None
    };

    let result = json!({
        "extrema": extrema,
        "attractors": attractors,
        "plateaus": plateaus,
    });
    write_report(&args.common, &params, result)
}

#[derive(Serialize, Debug)]
struct PartitionReport {
    num_groups: usize,
    dropped: usize,
    sizes_first: Vec<usize>,
    sizes_last: Vec<usize>,
    stats: GroupStats,
    extreme_means_difference: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    values: Option<Vec<Vec<Vec<f64>>>>,
}

fn handle_partition(args: PartitionArgs) -> Result<()> {
    let params = load_params(args.common.params.as_deref())?;
    let input: PartitionInput = read_json(&args.input)?;
    let data = to_array2(input.data, "data")?;
    let labels = match input.groups {
        LabelsInput::PerAgent(v) => ArrayD::from_shape_vec(IxDyn(&[v.len()]), v)
            .context("invalid label vector")?,
        LabelsInput::PerStep(rows) => to_array2(rows, "groups")?.into_dyn(),
    };
    let grouping = if input.dynamic {
        Grouping::Dynamic
    } else {
        Grouping::Static
    };

    let start = Instant::now();
    let parts = partition(data.view(), labels.view(), &input.group_list, grouping)
        .context("partitioning failed")?;
    info!(
        groups = parts.num_groups(),
        steps = parts.time_steps(),
        "partitioned in {:.3}s",
        start.elapsed().as_secs_f64()
    );
    if parts.dropped > 0 {
        warn!("{} observations fell outside every group", parts.dropped);
    }

    let last = parts.time_steps().saturating_sub(1);
    let groups = parts.num_groups();
    let report = PartitionReport {
        num_groups: groups,
        dropped: parts.dropped,
        sizes_first: if parts.time_steps() > 0 {
            parts.sizes_at(0)
        } else {
            Vec::new()
        },
        sizes_last: if parts.time_steps() > 0 {
            parts.sizes_at(last)
        } else {
            Vec::new()
        },
        stats: group_stats(&parts),
        extreme_means_difference: if groups > 1 {
            extreme_means_difference(&parts, last, 0, groups - 1)
        } else {
            None
        },
        values: args.values.then(|| parts.groups.clone()),
    };
    write_report(&args.common, &params, report)
}

fn handle_sweep(args: SweepArgs) -> Result<()> {
    let params = load_params(args.common.params.as_deref())?;
    let input: MultiverseInput = read_json(&args.input)?;
    let universes = input
        .universes
        .into_iter()
        .enumerate()
        .map(|(i, u)| -> Result<Universe> {
            let opinion = to_array2(u.opinion, "opinion")
                .with_context(|| format!("universe {}", i))?;
            let group_label = u
                .group_label
                .map(|rows| to_array2(rows, "group_label"))
                .transpose()
                .with_context(|| format!("universe {}", i))?;
            Ok(Universe {
                coords: u.coords,
                opinion,
                group_label,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let mv = Multiverse::new(universes);

    let dim = match args.dim {
        Some(dim) => dim,
        None => {
            let ignore = parse_list(args.ignore.as_deref().unwrap_or(""));
            let ignore: Vec<&str> = ignore.iter().map(String::as_str).collect();
            mv.sweep_dimension(&ignore)
                .context("could not deduce the sweep dimension")?
        }
    };

    let start = Instant::now();
    let result = match args.kind {
        SweepKind::Property => {
            let property: Property = args.property.parse()?;
            json!({
                "dim": dim,
                "property": property,
                "points": sweep_property(&mv, &dim, property, &params)?,
            })
        }
        SweepKind::Bifurcation => json!({
            "dim": dim,
            "points": bifurcation(&mv, &dim, &params)?,
        }),
        SweepKind::Attractors => json!({
            "dim": dim,
            "points": attractors(&mv, &dim, &params)?,
        }),
        SweepKind::GroupPeaks => json!({
            "dim": dim,
            "points": group_peaks(&mv, &dim, &params)?,
        }),
        SweepKind::Groups => {
            let raw = args
                .group_list
                .as_deref()
                .ok_or_else(|| anyhow!("--group-list is required for --kind groups"))?;
            let group_list = parse_floats(raw)?;
            json!({
                "dim": dim,
                "group_list": group_list,
                "points": group_sweep(&mv, &dim, &group_list, args.grouping.into())?,
            })
        }
    };
    info!(
        "Sweep over '{}' finished in {:.3}s",
        dim,
        start.elapsed().as_secs_f64()
    );
    write_report(&args.common, &params, result)
}

fn load_params(path: Option<&Path>) -> Result<AnalysisParams> {
    let params = match path {
        Some(path) => read_json::<AnalysisParams>(path)?,
        None => AnalysisParams::default(),
    };
    params.validate().context("invalid analysis parameters")?;
    Ok(params)
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

fn to_array2(rows: Vec<Vec<f64>>, name: &str) -> Result<Array2<f64>> {
    let nrows = rows.len();
    let ncols = rows.first().map_or(0, Vec::len);
    if let Some(bad) = rows.iter().position(|r| r.len() != ncols) {
        return Err(anyhow!(
            "'{}' is ragged: row {} has {} entries, expected {}",
            name,
            bad,
            rows[bad].len(),
            ncols
        ));
    }
    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    Array2::from_shape_vec((nrows, ncols), flat)
        .with_context(|| format!("'{}' has an invalid shape", name))
}

fn parse_list(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_floats(input: &str) -> Result<Vec<f64>> {
    parse_list(input)
        .iter()
        .map(|token| {
            token
                .parse::<f64>()
                .with_context(|| format!("invalid number '{}'", token))
        })
        .collect()
}

fn write_report<T: Serialize>(
    common: &CommonArgs,
    params: &AnalysisParams,
    result: T,
) -> Result<()> {
    let report = Report {
        generated_at: Utc::now().to_rfc3339(),
        params: params.params_json(),
        params_hash: params.params_hash_sha256()?,
        result,
    };
    let text = if common.pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };

    if common.output.as_os_str() == "-" {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        writeln!(handle, "{}", text).context("failed to write report to stdout")?;
    } else {
        fs::write(&common.output, text)
            .with_context(|| format!("failed to write {}", common.output.display()))?;
        info!("Report written: {}", common.output.display());
    }
    Ok(())
}
