use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use miette::{Context, IntoDiagnostic};

use vnac_alloc::AllocatorKind;
use vnac_backend_c::{compile, CodegenOptions};
use vnac_graph::{ElementType, Graph};
use vnac_weights::WeightStore;

/// vnac — graph-to-C compiler for the VNA accelerator
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Directory containing graph.json and the .dat weight files
    #[arg(short, long)]
    input: PathBuf,

    /// Directory receiving the generated C source and header
    #[arg(short, long)]
    output: PathBuf,

    /// Size of the target memory zone (accepts K/M/G suffixes)
    #[arg(short = 's', long, default_value = "0", value_parser = parse_zone_size)]
    memory_zone_size: u64,

    /// Element type of the graph inputs
    #[arg(long, default_value = "ufixed8", value_parser = parse_element_type)]
    input_type: ElementType,

    /// Fraction bits for fixed-point graph inputs
    #[arg(long, default_value_t = 4)]
    input_fp_shift: u8,

    /// Element type of the graph outputs
    #[arg(long, default_value = "sfixed16", value_parser = parse_element_type)]
    output_type: ElementType,

    /// Fraction bits for fixed-point graph outputs
    #[arg(long, default_value_t = 4)]
    output_fp_shift: u8,

    /// Element type of intermediate tensors
    #[arg(long, default_value = "sfixed16", value_parser = parse_element_type)]
    intermediate_type: ElementType,

    /// Fraction bits for fixed-point intermediate tensors
    #[arg(long, default_value_t = 4)]
    intermediate_fp_shift: u8,

    /// Element type of kernel and bias tensors (their shift is derived
    /// from the weight values)
    #[arg(long, default_value = "sfixed16", value_parser = parse_element_type)]
    kernel_type: ElementType,

    /// Memory allocator: 'sequential' or 'greedy'. Unknown names fall
    /// back to sequential.
    #[arg(short, long, default_value = "sequential")]
    allocator: String,

    /// Emit a trace statement before each primitive invocation
    #[arg(long)]
    verbose_code: bool,
}

fn parse_element_type(s: &str) -> Result<ElementType, String> {
    ElementType::from_name(s).ok_or_else(|| format!("unknown element type '{s}'"))
}

fn parse_zone_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (digits, multiplier) = match s.chars().last() {
        Some('K') | Some('k') => (&s[..s.len() - 1], 1024u64),
        Some('M') | Some('m') => (&s[..s.len() - 1], 1024 * 1024),
        Some('G') | Some('g') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    digits
        .parse::<u64>()
        .map(|n| n * multiplier)
        .map_err(|_| format!("invalid memory size '{s}'"))
}

fn main() -> ExitCode {
    env_logger::init();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();

    // 1. Load the shape-annotated graph description.
    let graph_path = cli.input.join("graph.json");
    let text = fs::read_to_string(&graph_path)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to read {}", graph_path.display()))?;
    let graph = Graph::from_json_str(&text)
        .into_diagnostic()
        .wrap_err("graph description rejected")?;

    // 2. Weights live next to the graph description.
    let weights = WeightStore::new(&cli.input);

    // 3. Compile.
    let options = CodegenOptions {
        input_type: cli.input_type,
        input_shift: cli.input_fp_shift,
        output_type: cli.output_type,
        output_shift: cli.output_fp_shift,
        intermediate_type: cli.intermediate_type,
        intermediate_shift: cli.intermediate_fp_shift,
        kernel_type: cli.kernel_type,
        zone_size: cli.memory_zone_size,
        allocator: AllocatorKind::from_name(&cli.allocator),
        verbose_trace: cli.verbose_code,
    };
    let output = compile(&graph, &weights, &options)
        .into_diagnostic()
        .wrap_err("compilation failed")?;

    // 4. Surface diagnostics.
    for diag in &output.diagnostics {
        eprintln!("{diag}");
    }

    // 5. Artifacts are written only after a fully successful compile; a
    //    failing run leaves nothing behind.
    fs::create_dir_all(&cli.output)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to create {}", cli.output.display()))?;
    for file in [&output.source, &output.header] {
        let path = cli.output.join(&file.name);
        fs::write(&path, &file.content)
            .into_diagnostic()
            .wrap_err_with(|| format!("failed to write {}", path.display()))?;
    }

    // 6. Memory report.
    println!("{}", output.report);

    Ok(())
}
