use std::io::Write;
use std::path::PathBuf;

use clap::Parser;
use log::LevelFilter;
use qconv_import::{
    GraphError, LoweringOptions, TranslatorRegistry, graph_to_dot, load_graph_from_path,
    logger::init_log, lower_graph, run_reference_zeroed,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Lower packed quantized convolutions into primitive graph IR", long_about = None)]
struct Cli {
    /// Path to a JSON graph description.
    graph: PathBuf,
    /// Path to write the lowered graph JSON (stdout if omitted).
    #[arg(long)]
    output: Option<PathBuf>,
    /// Optional path to write a Graphviz DOT export of the lowered graph.
    #[arg(long)]
    export_dot: Option<PathBuf>,
    /// Keep packed-params placeholders and operands nothing reads after lowering.
    #[arg(long)]
    keep_placeholders: bool,
    /// Copy operations whose lowering fails instead of aborting.
    #[arg(long)]
    passthrough_failed: bool,
    /// Execute the lowered graph on the reference executor with zeroed inputs.
    #[arg(long)]
    run_reference: bool,
    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
}

fn run() -> Result<(), GraphError> {
    let cli = Cli::parse();
    init_log(if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    })?;

    let graph = load_graph_from_path(&cli.graph)?;
    let options = LoweringOptions {
        prune_unused: !cli.keep_placeholders,
        passthrough_failed: cli.passthrough_failed,
    };
    let registry = TranslatorRegistry::with_defaults();
    let report = lower_graph(&graph, &registry, &options)?;

    eprintln!(
        "Lowered `{}`: {} quantized convolutions, {} operations copied unchanged, {} failed.",
        cli.graph.display(),
        report.translated,
        report.passthrough.len(),
        report.failed.len()
    );
    for (name, err) in &report.failed {
        eprintln!("  - {}: {}", name, err);
    }

    if let Some(dot_path) = cli.export_dot {
        let dot = graph_to_dot(&report.graph);
        std::fs::write(&dot_path, dot).map_err(|err| GraphError::export(dot_path.clone(), err))?;
        eprintln!("Exported Graphviz DOT to `{}`.", dot_path.display());
    }

    if cli.run_reference {
        let outputs = run_reference_zeroed(&report.graph)?;
        eprintln!("Executed lowered graph with zeroed inputs (reference CPU):");
        let mut names: Vec<_> = outputs.keys().collect();
        names.sort();
        for name in names {
            eprintln!("  - {}: shape={:?}", name, outputs[name].shape());
        }
    }

    let json = serde_json::to_string_pretty(&report.graph)?;
    match cli.output {
        Some(path) => {
            std::fs::write(&path, json).map_err(|err| GraphError::export(path.clone(), err))?;
            eprintln!("Wrote lowered graph to `{}`.", path.display());
        }
        None => {
            let mut stdout = std::io::stdout();
            stdout
                .write_all(json.as_bytes())
                .and_then(|_| stdout.write_all(b"\n"))
                .map_err(|err| GraphError::export(PathBuf::from("<stdout>"), err))?;
        }
    }
    Ok(())
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}
