//! bytesim - CLI Entry Point
//!
//! Commands:
//! - `bytesim run <program>` - Load and run a program, then dump the state
//! - `bytesim debug <program>` - Interactive debugger
//! - `bytesim disasm <program>` - Load a program and print its disassembly
//! - `bytesim compare <program>` - Run both engines and compare final states

use bytesim::{Cpu, CpuError, DumpFormat, ExecMode, Program, SimConfig, StateDump};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bytesim")]
#[command(version)]
#[command(about = "An instructional 8-bit CPU simulator with single-cycle and multi-cycle engines")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program until it halts
    Run {
        /// Path to the program text
        program: String,
        /// Engine to use
        #[arg(short, long, value_enum)]
        mode: Option<ModeArg>,
        /// Maximum number of ticks to run (default: 10000)
        #[arg(long)]
        max_cycles: Option<u64>,
        /// Log every stage and retired instruction
        #[arg(short, long)]
        trace: bool,
        /// Final state dump format
        #[arg(short, long, value_enum)]
        dump: Option<DumpArg>,
        /// JSON config file; flags override its values
        #[arg(short, long)]
        config: Option<String>,
    },
    /// Interactive debugger
    Debug {
        /// Path to the program text
        program: String,
    },
    /// Disassemble a program
    Disasm {
        /// Path to the program text
        program: String,
    },
    /// Run a program on both engines and compare the results
    Compare {
        /// Path to the program text
        program: String,
        /// Maximum number of instructions per engine
        #[arg(long, default_value = "10000")]
        max_cycles: u64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Single,
    Multi,
}

impl From<ModeArg> for ExecMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Single => ExecMode::Single,
            ModeArg::Multi => ExecMode::Multi,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum DumpArg {
    Text,
    Json,
    None,
}

impl From<DumpArg> for DumpFormat {
    fn from(dump: DumpArg) -> Self {
        match dump {
            DumpArg::Text => DumpFormat::Text,
            DumpArg::Json => DumpFormat::Json,
            DumpArg::None => DumpFormat::None,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { program, mode, max_cycles, trace, dump, config } => {
            let mut config = match config {
                Some(path) => SimConfig::from_file(&path).unwrap_or_else(|e| {
                    eprintln!("❌ {}", e);
                    std::process::exit(1);
                }),
                None => SimConfig::default(),
            };
            if let Some(mode) = mode {
                config.mode = mode.into();
            }
            if let Some(max_cycles) = max_cycles {
                config.max_cycles = max_cycles;
            }
            if let Some(dump) = dump {
                config.dump = dump.into();
            }
            config.trace |= trace;

            init_tracing(config.trace);
            run_program(&program, &config);
        }
        Commands::Debug { program } => {
            init_tracing(false);
            debug_program(&program);
        }
        Commands::Disasm { program } => {
            init_tracing(false);
            disassemble_file(&program);
        }
        Commands::Compare { program, max_cycles } => {
            init_tracing(false);
            compare_engines(&program, max_cycles);
        }
    }
}

/// Install the log subscriber. `RUST_LOG` wins unless tracing was requested.
fn init_tracing(trace: bool) {
    let filter = if trace {
        EnvFilter::new("trace")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_program(path: &str) -> Program {
    match bytesim::load_file(path) {
        Ok(program) => {
            println!(
                "📂 Loaded {} instructions ({} bytes) from {}",
                program.listing.len(),
                program.image.len(),
                path
            );
            if !program.diagnostics.is_empty() {
                println!("⚠️  Skipped {} line(s)", program.diagnostics.len());
            }
            program
        }
        Err(e) => {
            eprintln!("❌ {}", e);
            std::process::exit(1);
        }
    }
}

fn new_cpu(program: &Program) -> Cpu {
    let mut cpu = Cpu::new();
    if let Err(e) = cpu.load(program) {
        eprintln!("❌ Failed to load program: {}", e);
        std::process::exit(1);
    }
    cpu
}

fn run_program(path: &str, config: &SimConfig) {
    println!("🔧 Running: {} ({:?}-cycle)", path, config.mode);

    let program = load_program(path);
    let mut cpu = new_cpu(&program);

    let ticks = match cpu.run_limited(config.mode, config.max_cycles) {
        Ok(ticks) => ticks,
        // Includes the tick that faulted.
        Err(CpuError::Fault(fault)) => {
            eprintln!("❌ CPU fault: {}", fault);
            cpu.cycles
        }
        Err(e) => {
            eprintln!("❌ CPU error: {}", e);
            std::process::exit(1);
        }
    };

    println!("VM stopped.");
    println!("Ticks: {}  Instructions: {}  State: {:?}", ticks, cpu.retired, cpu.state);

    if cpu.is_running() {
        println!(
            "⚠️  Reached max cycles limit ({}). Use --max-cycles to increase.",
            config.max_cycles
        );
    }

    match config.dump {
        DumpFormat::Text => {
            println!();
            print!("{}", bytesim::render_text(&cpu));
        }
        DumpFormat::Json => match StateDump::capture(&cpu).to_json() {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("❌ Failed to serialize state: {}", e);
                std::process::exit(1);
            }
        },
        DumpFormat::None => {}
    }

    if cpu.fault.is_some() {
        std::process::exit(2);
    }
}

#[cfg(feature = "tui")]
fn debug_program(path: &str) {
    let program = load_program(path);

    println!("🚀 Launching debugger...");

    if let Err(e) = bytesim::run_debugger(program) {
        eprintln!("❌ Debugger error: {}", e);
        std::process::exit(1);
    }
}

#[cfg(not(feature = "tui"))]
fn debug_program(_path: &str) {
    eprintln!("❌ The debugger requires the `tui` feature");
    std::process::exit(1);
}

fn disassemble_file(path: &str) {
    let program = load_program(path);
    let cpu = new_cpu(&program);

    println!();
    print!("{}", bytesim::disassemble(&cpu.mem, program.image.len()));
}

fn compare_engines(path: &str, max_instructions: u64) {
    let program = load_program(path);

    let mut single = new_cpu(&program);
    let mut multi = new_cpu(&program);

    // Faults are part of the comparison, not a reason to stop.
    let _ = single.run_limited(ExecMode::Single, max_instructions);
    let _ = multi.run_limited(ExecMode::Multi, max_instructions.saturating_mul(5));

    println!("single-cycle: {:?}, {} instructions, PC={}", single.state, single.retired, single.regs.pc);
    println!("multi-cycle:  {:?}, {} instructions, {} ticks, PC={}",
        multi.state, multi.retired, multi.cycles, multi.regs.pc);

    let same = single.regs == multi.regs
        && single.mem == multi.mem
        && single.state == multi.state
        && single.fault == multi.fault;

    if same {
        println!("✓ Engines agree");
    } else {
        println!("✗ Engines disagree");
        println!("  single regs: {:?}", single.regs.gpr);
        println!("  multi regs:  {:?}", multi.regs.gpr);
        std::process::exit(1);
    }
}
