use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use nbx_core::BinderConfig;
use nbx_kernel::scenario::{self, ScenarioReport};
use nbx_kernel::{init_tracing, LogFormat};
use std::path::PathBuf;

fn cli() -> Command {
    Command::new("nbx-kernel")
        .version(nbx_kernel::VERSION)
        .about("Notebook kernel simulator for angular object binding")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Binder configuration file (TOML)"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Print the report as JSON"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines on stderr"),
        )
        .subcommand(
            Command::new("display")
                .about("Replay bind / click / watch / unbind on a rendered template"),
        )
        .subcommand(
            Command::new("run-paragraph")
                .about("Run paragraphs from a rendered button and from another paragraph"),
        )
        .subcommand(
            Command::new("stress")
                .about("Bind many keys concurrently and check versions")
                .arg(
                    Arg::new("keys")
                        .long("keys")
                        .default_value("64")
                        .value_parser(value_parser!(usize))
                        .help("Number of keys bound concurrently"),
                )
                .arg(
                    Arg::new("iterations")
                        .long("iterations")
                        .default_value("1000")
                        .value_parser(value_parser!(usize))
                        .help("Binds per key"),
                ),
        )
}

fn load_config(matches: &ArgMatches) -> anyhow::Result<BinderConfig> {
    let Some(path) = matches.get_one::<PathBuf>("config") else {
        return Ok(BinderConfig::default());
    };
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    BinderConfig::from_toml_str(&source).with_context(|| format!("loading config {}", path.display()))
}

fn print_scenario(report: &ScenarioReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        print!("{}", report.generate_text());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();

    let format = if matches.get_flag("log-json") {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    init_tracing(format).context("installing tracing subscriber")?;

    let config = load_config(&matches)?;
    let json = matches.get_flag("json");

    let passed = match matches.subcommand() {
        Some(("display", _)) => {
            let report = scenario::display(config).await?;
            print_scenario(&report, json)?;
            report.passed()
        }
        Some(("run-paragraph", _)) => {
            let report = scenario::run_paragraph(config).await?;
            print_scenario(&report, json)?;
            report.passed()
        }
        Some(("stress", args)) => {
            let keys = args.get_one::<usize>("keys").copied().unwrap_or(64);
            let iterations = args.get_one::<usize>("iterations").copied().unwrap_or(1000);

            let report = scenario::stress(config, keys, iterations).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Stress Test Report:");
                println!("  Keys: {}", report.keys);
                println!("  Iterations: {}", report.iterations);
                println!("  Binds: {}", report.binds);
                println!("  Elapsed: {}ms", report.elapsed_ms);
                println!("  Violations: {}", report.violations);
                println!("  Success: {}", report.success);
            }
            report.success
        }
        _ => unreachable!("subcommand_required is set"),
    };

    std::process::exit(if passed { 0 } else { 1 });
}
