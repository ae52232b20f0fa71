use anyhow::Context;
use hvoverlap::*;
use hvoverlap::approx::Contour;
use hvoverlap::overlap::{compare, sample, sample_size, CancelToken, Direction, Progress};
use indicatif::{ProgressBar, ProgressStyle};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use structopt::*;
use tracing_subscriber::EnvFilter;

/// Vertices written per confidence ellipse.
const ELLIPSE_VERTICES : usize = 100;

/// Options of the overlap subcommand.
#[derive(StructOpt, Debug)]
pub struct OverlapArgs {

    first : PathBuf,

    second : PathBuf,

    /// JSON configuration file; command-line options override its fields.
    #[structopt(short, long)]
    config : Option<PathBuf>,

    /// Points sampled per unit of volume.
    #[structopt(long)]
    proppoints : Option<f64>,

    /// Null draws per inclusion test.
    #[structopt(long)]
    ndraws : Option<usize>,

    #[structopt(long)]
    seed : Option<u64>,

    /// Worker threads (0 uses all cores).
    #[structopt(long)]
    threads : Option<usize>,

    /// Pair of dimension indices for the ellipses.
    #[structopt(long, number_of_values = 2)]
    dims : Option<Vec<usize>>,

    /// Skip the overlap estimate.
    #[structopt(long)]
    no_overlap : bool,

    /// Skip the confidence ellipses.
    #[structopt(long)]
    no_plot : bool,

    /// Writes the ellipse vertices as CSV to this file.
    #[structopt(long)]
    ellipses : Option<PathBuf>,

    /// Hides the progress bar.
    #[structopt(short, long)]
    quiet : bool,

    #[structopt(short, long)]
    output : Option<PathBuf>

}

/// Estimate the overlap between hypervolumes summarized by multivariate normals
#[derive(StructOpt, Debug)]
pub enum HvOverlap {

    /// Compares two hypervolume models (JSON): Monte Carlo overlap estimate and
    /// confidence ellipses over a pair of dimensions.
    Overlap(OverlapArgs),

    /// Draws a point set from a hypervolume model and writes it as CSV.
    Sample {
        model : PathBuf,

        #[structopt(long, default_value = "1.0")]
        proppoints : f64,

        #[structopt(long)]
        seed : Option<u64>,

        #[structopt(short, long)]
        output : Option<PathBuf>
    }

}

/// Progress bar over the tail statistics evaluated in both directions.
struct BarProgress {
    bar : ProgressBar
}

impl Progress for BarProgress {

    fn start(&self, direction : Direction, _total : usize) {
        self.bar.set_message(direction.to_string());
    }

    fn advance(&self, _direction : Direction, n : usize) {
        self.bar.inc(n as u64);
    }

}

fn label_for(path : &Path, fallback : &str) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned() )
        .unwrap_or_else(|| fallback.to_string() )
}

fn load_descriptor(path : &Path, fallback : &str) -> anyhow::Result<HypervolumeDescriptor> {
    let model = HypervolumeModel::load_from_path(path)
        .with_context(|| format!("Error opening model {}", path.display()) )?;
    Ok(model.descriptor(&label_for(path, fallback))?)
}

fn open_output(path : &Option<PathBuf>) -> anyhow::Result<Box<dyn Write>> {
    match path {
        Some(path) => {
            let f = File::create(path).with_context(|| format!("Error creating {}", path.display()) )?;
            Ok(Box::new(f))
        },
        None => Ok(Box::new(io::stdout()))
    }
}

fn write_ellipses(
    path : &Path,
    names : &[String],
    contours : &[(&str, &Contour)]
) -> anyhow::Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    if let Some((_, first)) = contours.first() {
        wtr.write_record(&[
            "hypervolume",
            names[first.dims.0].as_str(),
            names[first.dims.1].as_str()
        ])?;
    }
    for (label, contour) in contours.iter() {
        for (x, y) in contour.vertices(ELLIPSE_VERTICES) {
            wtr.write_record(&[label.to_string(), x.to_string(), y.to_string()])?;
        }
    }
    wtr.flush()?;
    Ok(())
}

fn overlap(args : OverlapArgs) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => OverlapConfig::load_from_path(path)
            .with_context(|| format!("Error loading configuration {}", path.display()) )?,
        None => OverlapConfig::default()
    };
    if let Some(p) = args.proppoints {
        config.proppoints = p;
    }
    if let Some(n) = args.ndraws {
        config.ndraws = n;
    }
    if args.seed.is_some() {
        config.seed = args.seed;
    }
    if let Some(t) = args.threads {
        config.threads = t;
    }
    if let Some(d) = &args.dims {
        config.dims = (d[0], d[1]);
    }
    config.overlap &= !args.no_overlap;
    config.plot &= !args.no_plot;

    let hv1 = load_descriptor(&args.first, "hv1")?;
    let hv2 = load_descriptor(&args.second, "hv2")?;
    tracing::info!(first = %hv1, second = %hv2, "loaded hypervolumes");

    let total = 2 * (sample_size(hv1.volume(), config.proppoints) + sample_size(hv2.volume(), config.proppoints));
    let bar = if args.quiet || !config.overlap {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(total as u64)
    };
    bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg}")
    );
    let progress = BarProgress { bar };
    let cmp = compare(&hv1, &hv2, &config, &progress, &CancelToken::new());
    progress.bar.finish_and_clear();
    let cmp = cmp?;

    if let (Some(path), Some((c1, c2))) = (&args.ellipses, &cmp.contours) {
        write_ellipses(path, hv1.dimension_names(), &[(hv1.label(), c1), (hv2.label(), c2)])?;
        tracing::info!(path = %path.display(), "ellipses written");
    }
    let mut out = open_output(&args.output)?;
    serde_json::to_writer_pretty(&mut out, &cmp)?;
    writeln!(out)?;
    Ok(())
}

fn sample_points(model : &Path, proppoints : f64, seed : Option<u64>, output : &Option<PathBuf>) -> anyhow::Result<()> {
    let hv = load_descriptor(model, "hv")?;
    if !(proppoints.is_finite() && proppoints > 0.0) {
        anyhow::bail!("proppoints must be positive (got {})", proppoints);
    }
    let mut rng = match seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_entropy()
    };
    let points = sample(&hv, proppoints, &mut rng);
    let mut wtr = csv::Writer::from_writer(open_output(output)?);
    wtr.write_record(hv.dimension_names())?;
    for row in points.as_matrix().row_iter() {
        wtr.write_record(row.iter().map(|v| v.to_string() ))?;
    }
    wtr.flush()?;
    tracing::info!(label = hv.label(), points = points.len(), "point set written");
    Ok(())
}

fn main() -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")) )
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let cmd = HvOverlap::from_args();
    let res = match cmd {
        HvOverlap::Sample { model, proppoints, seed, output } => {
            sample_points(&model, proppoints, seed, &output)
        },
        HvOverlap::Overlap(args) => overlap(args)
    };
    res.map_err(|e| format!("{:#}", e) )
}
