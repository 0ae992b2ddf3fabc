/// Codeload - dispatch planner and code-object layout CLI
use codeload::backend::loader::{ArenaSpace, CompiledUnit, Loader};
use codeload::backend::*;
use std::env;
use std::fs;
use std::io::{self, Read};
use std::path::Path;
use std::process;
use tracing::Level;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_usage() {
    eprintln!("codeload v{}", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    codeload [OPTIONS] plan <DISPATCH>");
    eprintln!("    codeload [OPTIONS] layout <UNIT>...");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -h, --help            Print this help message");
    eprintln!("    -V, --version         Print version information");
    eprintln!("    -v, --verbose         Log decisions and builds (repeat for more)");
    eprintln!("    -c, --config <FILE>   Loader configuration (TOML)");
    eprintln!("    --arch <ARCH>         Target: x86-64, x86, arm64");
    eprintln!("    -k, --key <NAME>      With plan: show what NAME dispatches to");
    eprintln!("    --trace               Log every applied fixup");
    eprintln!();
    eprintln!("ARGUMENTS:");
    eprintln!("    <DISPATCH>            Dispatch description file (use '-' for stdin)");
    eprintln!("    <UNIT>                Compiled unit file; units share one build session");
    eprintln!();
    eprintln!("EXAMPLES:");
    eprintln!("    codeload plan case.toml -k car -k cdr");
    eprintln!("    codeload --arch arm64 layout caller.toml callee.toml");
}

fn print_version() {
    println!("codeload {}", VERSION);
}

enum Command {
    Plan,
    Layout,
}

struct Options {
    command: Command,
    inputs: Vec<String>,
    keys: Vec<String>,
    config: Option<String>,
    arch: Option<String>,
    verbosity: u8,
    trace: bool,
}

fn parse_args() -> Result<Options, String> {
    let args: Vec<String> = env::args().collect();

    let mut command = None;
    let mut inputs = Vec::new();
    let mut keys = Vec::new();
    let mut config = None;
    let mut arch = None;
    let mut verbosity = 0;
    let mut trace = false;
    let mut i = 1;

    let value = |i: &mut usize, flag: &str| -> Result<String, String> {
        *i += 1;
        args.get(*i)
            .cloned()
            .ok_or_else(|| format!("Missing value after {}", flag))
    };

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_usage();
                process::exit(0);
            }
            "-V" | "--version" => {
                print_version();
                process::exit(0);
            }
            "-v" | "--verbose" => verbosity += 1,
            "-vv" => verbosity += 2,
            "-c" | "--config" => config = Some(value(&mut i, "--config")?),
            "--arch" => arch = Some(value(&mut i, "--arch")?),
            "-k" | "--key" => keys.push(value(&mut i, "--key")?),
            "--trace" => trace = true,
            arg if arg.starts_with('-') && arg != "-" => {
                return Err(format!("Unknown option: {}", arg));
            }
            arg => match command {
                None => {
                    command = Some(match arg {
                        "plan" => Command::Plan,
                        "layout" => Command::Layout,
                        other => return Err(format!("Unknown command: {}", other)),
                    })
                }
                Some(_) => inputs.push(arg.to_string()),
            },
        }
        i += 1;
    }

    let command = command.ok_or("Missing command")?;
    if inputs.is_empty() {
        return Err("Missing input file".to_string());
    }
    if matches!(command, Command::Plan) && inputs.len() > 1 {
        return Err("plan takes a single dispatch description".to_string());
    }

    Ok(Options {
        command,
        inputs,
        keys,
        config,
        arch,
        verbosity,
        trace,
    })
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::WARN,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .with_writer(io::stderr)
        .init();
}

fn read_input(input: &str) -> Result<String, String> {
    if input == "-" {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .map_err(|e| format!("Failed to read from stdin: {}", e))?;
        Ok(buffer)
    } else {
        let path = Path::new(input);
        if !path.exists() {
            return Err(format!("Input file not found: {}", input));
        }
        fs::read_to_string(path).map_err(|e| format!("Failed to read file '{}': {}", input, e))
    }
}

fn load_config(options: &Options) -> Result<LoaderConfig, String> {
    let mut config = match &options.config {
        Some(path) => LoaderConfig::load(Path::new(path)).map_err(|e| e.to_string())?,
        None => LoaderConfig::default()
            .with_env_overrides()
            .map_err(|e| e.to_string())?,
    };
    if let Some(arch) = &options.arch {
        config.arch = arch.parse()?;
    }
    if options.trace {
        config = config.with_trace();
    }
    Ok(config)
}

fn run_plan(options: &Options, config: &LoaderConfig) -> Result<String, String> {
    let content = read_input(&options.inputs[0])?;
    let description = DispatchDescription::parse_toml(&content)
        .map_err(|e| format!("Failed to parse dispatch description: {}", e))?;
    let spec = description.into_spec();
    let compiled = compile_dispatch(&spec, &config.dispatch_config()).map_err(|e| e.to_string())?;

    let mut output = compiled.describe();
    for name in &options.keys {
        let key = DispatchKey::new(name);
        let line = match compiled.dispatch(&key) {
            Ok(Some(Action::Constant(lit))) => format!("{} => {}", name, lit),
            Ok(Some(Action::Code(label))) => format!("{} => code {}", name, label),
            Ok(None) => format!("{} => no value", name),
            Err(miss) => format!("{} => error: {}", name, miss),
        };
        output.push_str(&line);
        output.push('\n');
    }
    Ok(output)
}

fn run_layout(options: &Options, config: &LoaderConfig) -> Result<String, String> {
    let mut loader: Loader<ArenaSpace> = Loader::with_arena(config.clone());
    let mut session = loader.begin_session();
    let mut ids = Vec::with_capacity(options.inputs.len());

    for input in &options.inputs {
        let content = read_input(input)?;
        let unit = CompiledUnit::parse_toml(&content)
            .map_err(|e| format!("Failed to parse unit '{}': {}", input, e))?;
        let id = loader
            .emit_code_object(&mut session, &unit)
            .map_err(|e| format!("Failed to build '{}': {}", input, e))?;
        ids.push(id);
    }

    let mut output = String::new();
    for id in ids {
        output.push_str(&loader.describe_object(id).map_err(|e| e.to_string())?);
    }
    let stats = loader.finish_session(session).map_err(|e| e.to_string())?;
    output.push_str(&stats.to_string());
    output.push('\n');
    Ok(output)
}

fn main() {
    let options = match parse_args() {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            process::exit(1);
        }
    };
    init_logging(options.verbosity);

    let config = match load_config(&options) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };

    let result = match options.command {
        Command::Plan => run_plan(&options, &config),
        Command::Layout => run_layout(&options, &config),
    };
    match result {
        Ok(output) => print!("{}", output),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}
