use std::ffi::OsString;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser};
use portator_contracts::{
    DEFAULT_WEB_PORT, ENV_LOG, EXIT_FAILURE, EXIT_NOT_FOUND, EXIT_OK, PORTATOR_VERSION_STRING,
};
use portator_runner_common::{discover, is_program_name, serialize_listing, LaunchConfig};
use portator_vm::{GuestLaunchRequest, LaunchError, NativeEmulator};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

mod scaffold;
mod template;
mod web;

use scaffold::TemplateKind;

#[derive(Parser, Debug)]
#[command(name = "portator")]
#[command(about = "In-process emulated app platform.", long_about = None)]
#[command(version)]
#[command(subcommand_required = false)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Create a new project (console, gui, web).
    New(NewArgs),
    /// Compile a project with the guest toolchain.
    Build(BuildArgs),
    /// Run a program in the emulator.
    Run(RunArgs),
    /// List discovered programs.
    List(ListArgs),
    /// Extract shared include/src files.
    Init,
    /// Start the web UI.
    Web(WebArgs),
    /// Show third-party credits.
    Credits,
    /// Show license information.
    License,
    #[command(external_subcommand)]
    External(Vec<OsString>),
}

#[derive(Debug, Args)]
struct NewArgs {
    #[arg(value_enum)]
    kind: TemplateKind,
    name: String,
}

#[derive(Debug, Args)]
struct BuildArgs {
    name: String,
}

#[derive(Debug, Args)]
struct RunArgs {
    name: String,
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<OsString>,
}

#[derive(Debug, Args)]
struct ListArgs {
    /// Print the listing document guests receive.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct WebArgs {
    port: Option<String>,
}

const CREDITS: &str = "
  Third-party components:

  Cosmopolitan     portable C toolchain for guests (ISC license)
                   https://github.com/jart/cosmopolitan

  clap             command line parsing (MIT/Apache-2.0)
  tokio, axum      async runtime and HTTP server (MIT)
  tower-http       static file serving (MIT)
  tracing          structured diagnostics (MIT)
  anyhow, libc     error handling and OS bindings (MIT/Apache-2.0)
";

fn main() -> ExitCode {
    init_logging();
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("portator: {err:#}");
            ExitCode::from(2)
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .with_env_var(ENV_LOG)
        .from_env_lossy();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(EXIT_FAILURE as u8))
}

fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let Some(command) = cli.command else {
        use clap::CommandFactory as _;
        Cli::command().print_help().context("print help")?;
        return Ok(exit_code(EXIT_OK));
    };

    if let Command::Credits = command {
        println!("\n  {PORTATOR_VERSION_STRING} credits\n{CREDITS}");
        return Ok(exit_code(EXIT_OK));
    }

    let config = LaunchConfig::from_env()?;
    tracing::debug!(?config, "startup configuration");

    let code = match command {
        Command::New(args) => cmd_new(&config, args)?,
        Command::Build(args) => cmd_build(&config, args)?,
        Command::Run(args) => {
            let request = GuestLaunchRequest::new(args.name, args.args);
            report_launch(portator_vm::launch(&config, &NativeEmulator, &request))
        }
        Command::List(args) => cmd_list(&config, args)?,
        Command::Init => cmd_init(&config)?,
        Command::Web(args) => cmd_web(&config, args)?,
        Command::License => cmd_license(&config)?,
        Command::External(mut argv) => {
            if argv.is_empty() {
                anyhow::bail!("missing command");
            }
            let prog = argv.remove(0);
            report_launch(portator_vm::launch_external(
                &config,
                &NativeEmulator,
                &prog,
                argv,
            ))
        }
        Command::Credits => EXIT_OK,
    };
    Ok(exit_code(code))
}

fn report_launch(result: std::result::Result<i32, LaunchError>) -> i32 {
    match result {
        Ok(status) => status,
        Err(err) => {
            eprintln!("portator: {err}");
            if let Some(hint) = err.hint() {
                eprintln!("{hint}");
            }
            err.exit_code()
        }
    }
}

fn cmd_new(config: &LaunchConfig, args: NewArgs) -> Result<i32> {
    if !is_program_name(&args.name) {
        eprintln!("portator: invalid project name: {:?}", args.name);
        return Ok(EXIT_FAILURE);
    }
    let Some(templates) = config.templates_root() else {
        eprintln!("portator: no bundle directory; templates unavailable");
        return Ok(EXIT_NOT_FOUND);
    };
    if scaffold::template_dir(&templates, args.kind).is_none() {
        eprintln!("portator: template not found: {}", args.kind);
        return Ok(EXIT_NOT_FOUND);
    }

    let output_root = config.local_root.join(&args.name);
    let report = scaffold::render(&templates, args.kind, &args.name, &output_root)?;
    println!("Created {} project {}", args.kind, args.name);
    for path in &report.written {
        let shown = path.strip_prefix(&config.local_root).unwrap_or(path);
        println!("  {}", shown.display());
    }
    for (path, reason) in &report.skipped {
        eprintln!("portator: skipped {}: {reason}", path.display());
    }
    Ok(EXIT_OK)
}

const LICENSE_PROGRAM: &str = "license";
const LICENSE_TEXT: &str = "LICENSES.txt";

/// Run the bundled `license` guest when it has been built; otherwise print
/// the license texts it would show.
fn cmd_license(config: &LaunchConfig) -> Result<i32> {
    if portator_vm::resolve(config, LICENSE_PROGRAM).is_some() {
        let request = GuestLaunchRequest::new(LICENSE_PROGRAM, Vec::new());
        return Ok(report_launch(portator_vm::launch(
            config,
            &NativeEmulator,
            &request,
        )));
    }

    let text_path = config
        .apps_root()
        .map(|apps| apps.join(LICENSE_PROGRAM).join(LICENSE_TEXT))
        .filter(|path| path.is_file());
    let Some(text_path) = text_path else {
        eprintln!("portator: license information not found");
        return Ok(EXIT_NOT_FOUND);
    };
    let text = std::fs::read_to_string(&text_path)
        .with_context(|| format!("read: {}", text_path.display()))?;
    println!("{PORTATOR_VERSION_STRING} licenses\n");
    print!("{text}");
    Ok(EXIT_OK)
}

fn cmd_build(config: &LaunchConfig, args: BuildArgs) -> Result<i32> {
    println!("Building {}...", args.name);
    let report = match portator_vm::build(config, &args.name) {
        Ok(report) => report,
        Err(err) => return Ok(report_launch(Err(err))),
    };
    if !report.extracted.is_empty() {
        println!("Extracted shared files:");
        for path in &report.extracted {
            println!("  {}", path.display());
        }
    }
    if report.status != EXIT_OK {
        eprintln!("portator: build failed");
        return Ok(report.status);
    }
    let shown = report
        .output
        .strip_prefix(&config.local_root)
        .unwrap_or(&report.output);
    println!("Built {}", shown.display());
    Ok(EXIT_OK)
}

fn cmd_list(config: &LaunchConfig, args: ListArgs) -> Result<i32> {
    let programs = discover(&config.search_roots());
    if args.json {
        let doc = serialize_listing(&programs)?;
        println!("{}", String::from_utf8_lossy(&doc));
        return Ok(EXIT_OK);
    }
    for program in &programs {
        println!("{}", program.name);
    }
    Ok(EXIT_OK)
}

fn cmd_init(config: &LaunchConfig) -> Result<i32> {
    println!("Extracting shared files...");
    for path in portator_vm::extract_shared_files(config)? {
        println!("  {}", path.display());
    }
    println!("Done.");
    Ok(EXIT_OK)
}

fn cmd_web(config: &LaunchConfig, args: WebArgs) -> Result<i32> {
    let port = match args.port.as_deref() {
        None => DEFAULT_WEB_PORT,
        Some(raw) => match web::parse_port(raw) {
            Some(port) => port,
            None => {
                eprintln!("portator: invalid port");
                return Ok(EXIT_FAILURE);
            }
        },
    };
    let wwwroot = config
        .wwwroot()
        .context("no bundle directory; web UI unavailable")?;
    web::serve(wwwroot, port)?;
    Ok(EXIT_OK)
}
