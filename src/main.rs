use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;

use hadope::config::Config;
use hadope::device::{DeviceKind, DeviceRegistry};
use hadope::diagnostic::Diagnostic;
use hadope::kir::lower::create_kernel_lowering;
use hadope::kir::{ElementType, FusedKernel};
use hadope::parsing::{translate, BinaryOp, ClosureTrace, Expression};
use hadope::registry::OperationRegistry;
use hadope::tasks::{ScanConfig, ScanStyle, Statement, Task};

#[derive(Parser)]
#[command(
    name = "hadope",
    version,
    about = "Data-parallel maps and scans compiled to fused device kernels"
)]
struct Cli {
    /// Configuration file (TOML with [features] and [scan])
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Log pipeline events at debug level
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Translate closure disassembly into an infix expression
    Translate {
        /// File holding the instruction-sequence disassembly
        input: PathBuf,
    },
    /// Print generated kernel source
    Kernel {
        #[command(subcommand)]
        kind: KernelCommand,
    },
    /// Load data, apply operations on a device and print the result
    Run {
        /// Input values (comma-separated integers)
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
        data: Vec<i32>,
        /// Map by closure disassembly; repeatable, applied in order
        #[arg(long = "map", value_name = "PATH")]
        maps: Vec<PathBuf>,
        /// Map by registered operation name; applied after --map
        #[arg(long = "op", value_name = "NAME")]
        ops: Vec<String>,
        /// Scan the mapped data
        #[arg(long)]
        scan: bool,
        /// Scan style (inclusive or exclusive)
        #[arg(long, default_value = "exclusive")]
        style: String,
        /// Scan operator (+, -, *, /)
        #[arg(long = "scan-op", default_value = "+")]
        scan_op: String,
        /// Print the sum instead of the array
        #[arg(long, conflicts_with = "count")]
        sum: bool,
        /// Print how many elements equal this value
        #[arg(long, allow_hyphen_values = true)]
        count: Option<i32>,
        /// Device kind (cpu or gpu)
        #[arg(long, default_value = "cpu")]
        device: String,
    },
}

#[derive(Subcommand)]
enum KernelCommand {
    /// The scan kernel family
    Scan {
        /// Scan style (inclusive or exclusive)
        #[arg(long, default_value = "exclusive")]
        style: String,
        /// Operator (+, -, *, /)
        #[arg(long, default_value = "+")]
        op: String,
        /// Shared-memory bank count (power of two)
        #[arg(long)]
        banks: Option<u32>,
        /// Enable conflict-free bank addressing
        #[arg(long)]
        avoid_bank_conflicts: bool,
        /// Work-group size baked into dialects that need it
        #[arg(long)]
        group_size: Option<u32>,
        /// Kernel dialect (opencl or wgsl)
        #[arg(long, default_value = "opencl")]
        dialect: String,
    },
    /// A fused elementwise kernel from one or more closures
    Map {
        /// Disassembly files, fused in order
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// Kernel dialect (opencl or wgsl)
        #[arg(long, default_value = "opencl")]
        dialect: String,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = load_config(cli.config.as_deref());

    match cli.command {
        Command::Translate { input } => cmd_translate(&input),
        Command::Kernel { kind } => match kind {
            KernelCommand::Scan {
                style,
                op,
                banks,
                avoid_bank_conflicts,
                group_size,
                dialect,
            } => cmd_kernel_scan(
                config,
                &style,
                &op,
                banks,
                avoid_bank_conflicts,
                group_size,
                &dialect,
            ),
            KernelCommand::Map { inputs, dialect } => cmd_kernel_map(&inputs, &dialect),
        },
        Command::Run {
            data,
            maps,
            ops,
            scan,
            style,
            scan_op,
            sum,
            count,
            device,
        } => cmd_run(RunOptions {
            config,
            data,
            maps,
            ops,
            scan: scan.then_some((style, scan_op)),
            sum,
            count,
            device,
        }),
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "hadope=debug" } else { "warn" })
    });
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Config {
    let Some(path) = path else {
        return Config::default();
    };
    match Config::load(path) {
        Ok(config) => config,
        Err(e) => fail(e),
    }
}

fn fail(err: impl std::fmt::Display) -> ! {
    eprintln!("error: {}", err);
    process::exit(1);
}

fn parse_style(name: &str) -> ScanStyle {
    ScanStyle::from_name(name).unwrap_or_else(|| {
        fail(format!(
            "unknown scan style '{}' (expected inclusive or exclusive)",
            name
        ))
    })
}

fn parse_operator(symbol: &str) -> BinaryOp {
    BinaryOp::from_symbol(symbol)
        .unwrap_or_else(|| fail(format!("unknown operator '{}' (expected + - * /)", symbol)))
}

/// Read and translate a disassembly file, rendering a source-located
/// diagnostic on failure.
fn translate_file(path: &Path) -> Expression {
    let source = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => fail(format!("cannot read '{}': {}", path.display(), e)),
    };
    let trace = ClosureTrace::from_disassembly(&source);
    match translate(&trace) {
        Ok(expr) => expr,
        Err(err) => {
            let filename = path.display().to_string();
            let diagnostic = Diagnostic::from_translation_error(&err, &trace);
            if diagnostic
                .write(&filename, &source, true, std::io::stderr())
                .is_err()
            {
                eprintln!("error: {}", err);
            }
            process::exit(1);
        }
    }
}

// --- hadope translate ---

fn cmd_translate(input: &Path) {
    let expr = translate_file(input);
    println!("{}", expr);
}

// --- hadope kernel ---

fn cmd_kernel_scan(
    mut config: Config,
    style: &str,
    op: &str,
    banks: Option<u32>,
    avoid_bank_conflicts: bool,
    group_size: Option<u32>,
    dialect: &str,
) {
    if avoid_bank_conflicts {
        config.features.avoid_bank_conflicts = true;
    }
    let lowering = create_kernel_lowering(dialect)
        .unwrap_or_else(|| fail(format!("unknown dialect '{}'", dialect)));

    let scan = ScanConfig::from_config(parse_style(style), parse_operator(op), &config);
    let scan = match banks {
        Some(banks) => match scan.with_bank_count(banks) {
            Ok(scan) => scan,
            Err(e) => fail(e),
        },
        None => scan,
    };
    let group_size = group_size.unwrap_or(config.scan.work_group_size);
    if let Err(e) = scan.check_local_layout(group_size) {
        fail(e);
    }
    eprintln!("{} ({})", scan.descriptor(), lowering.target_name());
    print!("{}", lowering.lower_scan(&scan, group_size));
}

fn cmd_kernel_map(inputs: &[PathBuf], dialect: &str) {
    let lowering = create_kernel_lowering(dialect)
        .unwrap_or_else(|| fail(format!("unknown dialect '{}'", dialect)));

    let tasks: Vec<Task> = inputs
        .iter()
        .map(|path| {
            let mut task = Task::map();
            task.add_statement(Statement::assign(&translate_file(path)));
            task
        })
        .collect();
    let kernel = match FusedKernel::from_tasks(&tasks, ElementType::Int) {
        Ok(kernel) => kernel,
        Err(e) => fail(e),
    };
    print!("{}", lowering.lower_fused(&kernel));
}

// --- hadope run ---

struct RunOptions {
    config: Config,
    data: Vec<i32>,
    maps: Vec<PathBuf>,
    ops: Vec<String>,
    scan: Option<(String, String)>,
    sum: bool,
    count: Option<i32>,
    device: String,
}

fn cmd_run(opts: RunOptions) {
    let kind = DeviceKind::from_name(&opts.device)
        .unwrap_or_else(|| fail(format!("unknown device '{}' (expected cpu or gpu)", opts.device)));
    let expressions: Vec<Expression> = opts.maps.iter().map(|p| translate_file(p)).collect();
    let operations = OperationRegistry::with_builtins();

    let mut registry = DeviceRegistry::init(opts.config);
    let device = match registry.get(kind) {
        Ok(device) => device,
        Err(e) => fail(e),
    };
    let mut device = device.borrow_mut();

    device.load(opts.data);
    for expr in &expressions {
        if let Err(e) = device.map_expression(expr) {
            fail(e);
        }
    }
    for name in &opts.ops {
        if let Err(e) = device.map_named(&operations, name) {
            fail(e);
        }
    }
    if let Some((style, op)) = &opts.scan {
        if let Err(e) = device.scan(parse_style(style), parse_operator(op)) {
            fail(e);
        }
    }

    if opts.sum {
        match device.sum() {
            Ok(total) => println!("{}", total),
            Err(e) => fail(e),
        }
    } else if let Some(value) = opts.count {
        match device.count(value) {
            Ok(count) => println!("{}", count),
            Err(e) => fail(e),
        }
    } else {
        match device.retrieve_integers() {
            Ok(values) => {
                let rendered: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                println!("{}", rendered.join(","));
            }
            Err(e) => fail(e),
        }
    }

    let stats = device.stats();
    tracing::info!(
        compiles = stats.compiles,
        uploads = stats.uploads,
        launches = stats.launches,
        downloads = stats.downloads,
        "run complete"
    );
}
