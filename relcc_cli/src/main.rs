//! Command-line driver for the `relcc` diagrammatic amplitude solver.
//!
//! Wires solver options from a TOML file, loads the spinor/symmetry
//! system description and the externally sorted integral diagrams, runs the requested sectors in
//! order, and prints the per-sector summary table (one summary block
//! per sector"), grounded in `pineappl_cli`'s single-binary-plus-`prettytable` pattern
//! (`examples/NNPDF-pineappl/pineappl_cli/src/bin/pineappl.rs`,
//! `examples/NNPDF-pineappl/pineappl_cli/src/uncert.rs`).

mod system;

use anyhow::{Context, Result};
use clap::Parser;
use prettytable::{Cell, Row, Table};
use relcc::driver::{self, SectorReport};
use relcc::options::SolverOptions;
use relcc::persistence;
use relcc::registry::Registry;
use std::path::PathBuf;
use std::process::ExitCode;

/// Solve the requested Fock-space sectors of a relativistic FS-MRCC amplitude problem.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// TOML file describing the partitioned spinor space and the abelian double group.
    #[arg(long, value_name = "FILE")]
    system: PathBuf,
    /// Directory containing the externally sorted integral diagrams (`<name>.dg` files).
    #[arg(long, value_name = "DIR")]
    integrals: PathBuf,
    /// TOML file with [`SolverOptions`]; defaults to built-in defaults (ground-state CCSD) if
    /// omitted.
    #[arg(long, value_name = "FILE")]
    options: Option<PathBuf>,
    /// Increase log verbosity (`-v` debug, `-vv` trace); default is info-level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(&cli) {
        Ok(reports) => {
            print_summary(&reports);
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into()))
        .init();
}

fn run(cli: &Cli) -> Result<Vec<SectorReport>> {
    let opts = load_options(cli.options.as_deref())?;
    opts.validate().context("validating solver options")?;

    let (symmetry, spinors) =
        system::load(&cli.system).with_context(|| format!("loading system file {}", cli.system.display()))?;

    let mut registry = Registry::new(opts.memory_budget, Some(opts.work_dir.clone()));
    load_integrals(&mut registry, &cli.integrals)?;

    driver::run(&mut registry, &symmetry, &spinors, &opts).context("solving requested sectors")
}

fn load_options(path: Option<&std::path::Path>) -> Result<SolverOptions> {
    let Some(path) = path else { return Ok(SolverOptions::default()) };
    let text = std::fs::read_to_string(path).with_context(|| format!("reading options file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing options file {}", path.display()))
}

/// Loads every `<name>.dg` integral diagram from `dir` into `registry`, registered under its
/// filename stem (the canonical integral name, e.g. `hhpp`, `vvpp`).
fn load_integrals(registry: &mut Registry, dir: &std::path::Path) -> Result<()> {
    let entries = std::fs::read_dir(dir).with_context(|| format!("reading integrals directory {}", dir.display()))?;
    let mut loaded = 0usize;
    for entry in entries {
        let entry = entry.with_context(|| format!("reading directory entry in {}", dir.display()))?;
        let path = entry.path();
        if path.extension().and_then(std::ffi::OsStr::to_str) != Some("dg") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(std::ffi::OsStr::to_str) else { continue };
        persistence::read(registry, &path, Some(stem)).with_context(|| format!("loading integral {}", path.display()))?;
        loaded += 1;
    }
    tracing::info!(loaded, dir = %dir.display(), "loaded sorted integral diagrams");
    anyhow::ensure!(loaded > 0, "no `*.dg` integral diagrams found in {}", dir.display());
    Ok(())
}

/// Prints one summary row per solved sector: iteration count, final energy (if this sector
/// carries one), and the worst `diffmax` at convergence.
fn print_summary(reports: &[SectorReport]) {
    let mut table = Table::new();
    table.add_row(Row::new(vec![
        Cell::new("sector"),
        Cell::new("iterations"),
        Cell::new("E(corr)"),
        Cell::new("diffmax"),
    ]));
    for report in reports {
        let iterations = report.iterations.len();
        let last_diffmax = report
            .iterations
            .last()
            .map(|it| it.diffmax.iter().fold(0.0_f64, |m, &(_, d)| m.max(d)))
            .unwrap_or(0.0);
        table.add_row(Row::new(vec![
            Cell::new(&report.sector.to_string()),
            Cell::new(&iterations.to_string()),
            Cell::new(&report.final_energy.map_or_else(|| "-".to_owned(), |e| format!("{e:.10e}"))),
            Cell::new(&format!("{last_diffmax:.3e}")),
        ]));
    }
    table.printstd();
}
