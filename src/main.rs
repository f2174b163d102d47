use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sprint_ledger::config::DEFAULT_CONFIG_PATH;
use sprint_ledger::{sandbox, Config, LedgerFilter, Manifest, Provenance};

fn print_help() {
    println!(
        "\
sprint-ledger v{}

Tamper-evident ledger for sprint manifests, and a sandbox for the
commands they trigger.

USAGE:
    sprint-ledger [--config PATH] <COMMAND> [ARGS]

COMMANDS:
    attest <SPRINT_ID> <MANIFEST.json>    Sign a manifest and append it to the ledger
    list [--sprint ID] [--hash H] [--since TS] [--until TS] [--limit N] [--offset N]
                                          Print ledger entries as JSON lines
    show <ID>                             Print one ledger entry
    verify <ID>                           Re-verify a ledger entry (exit 1 unless valid)
    expect <SPRINT_ID> <SHA256>           Record the expected manifest hash of a sprint
    validate <SPRINT_ID> <MANIFEST.json>  Compare a manifest with its expectation
                                          (exit 1 on drift)
    run [--timeout SECS] [--scratch DIR] -- <COMMAND...>
                                          Run a command in the sandbox
                                          (exit 0 only if it completed with status 0).
                                          One argument is a full shell command line;
                                          several are quoted word by word

OPTIONS:
    --config PATH    TOML configuration file [default: {DEFAULT_CONFIG_PATH}]
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG    Log level filter for tracing
                (e.g. debug, sprint_ledger=debug,warn)

EXAMPLES:
    sprint-ledger attest S-1 manifest.json
    sprint-ledger list --sprint S-1
    sprint-ledger run --timeout 30 -- python -m pytest -q
    RUST_LOG=debug sprint-ledger verify 12",
        env!("CARGO_PKG_VERSION"),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--" => break,
            "--version" | "-V" => {
                println!("sprint-ledger v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // Logs go to stderr so stdout stays machine-readable
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("sprint_ledger=info")),
        )
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let config_path = take_option(&mut args, "--config")?
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    if args.is_empty() {
        print_help();
        std::process::exit(2);
    }
    let command = args.remove(0);

    info!("Loading configuration from {}", config_path.display());
    let config = Config::load_or_default(&config_path)?;
    let provenance = Provenance::open(&config)?;

    let code = match command.as_str() {
        "attest" => {
            let [sprint_id, path] = positional::<2>(args, "attest <SPRINT_ID> <MANIFEST.json>")?;
            let entry = provenance.record(&sprint_id, &read_manifest(Path::new(&path))?)?;
            print_json(&entry)?;
            0
        }
        "list" => {
            let filter = list_filter(&mut args)?;
            for entry in provenance.list(&filter)? {
                print_json(&entry)?;
            }
            0
        }
        "show" => {
            let [id] = positional::<1>(args, "show <ID>")?;
            print_json(&provenance.entry(parse_id(&id)?)?)?;
            0
        }
        "verify" => {
            let [id] = positional::<1>(args, "verify <ID>")?;
            let id = parse_id(&id)?;
            let result = provenance.verify_entry(id)?;
            print_json(&serde_json::json!({ "id": id, "result": result }))?;
            if result.is_valid() { 0 } else { 1 }
        }
        "expect" => {
            let [sprint_id, hash] = positional::<2>(args, "expect <SPRINT_ID> <SHA256>")?;
            provenance.expect(&sprint_id, &hash)?;
            print_json(&provenance.validation(&sprint_id)?)?;
            0
        }
        "validate" => {
            let [sprint_id, path] =
                positional::<2>(args, "validate <SPRINT_ID> <MANIFEST.json>")?;
            let record = provenance.validate(&sprint_id, &read_manifest(Path::new(&path))?)?;
            print_json(&record)?;
            if record.is_drifted() { 1 } else { 0 }
        }
        "run" => {
            let timeout = take_option(&mut args, "--timeout")?
                .map(|s| s.parse::<u64>().with_context(|| format!("invalid --timeout {s}")))
                .transpose()?;
            let scratch = take_option(&mut args, "--scratch")?;
            if args.first().map(String::as_str) == Some("--") {
                args.remove(0);
            }
            if args.is_empty() {
                bail!("usage: run [--timeout SECS] [--scratch DIR] -- <COMMAND...>");
            }
            let line = sandbox::command_line(args.as_slice());

            let mut limits = provenance.default_limits().clone();
            if let Some(secs) = timeout {
                limits = limits.with_timeout(Duration::from_secs(secs));
            }
            if let Some(dir) = scratch {
                limits = limits.with_scratch_dir(dir);
            }

            let result = provenance.run(&line, Some(&limits)).await;
            print_json(&result)?;
            if result.is_success() { 0 } else { 1 }
        }
        other => bail!("unknown command `{other}` (see --help)"),
    };

    std::process::exit(code);
}

/// Removes `flag VALUE` from `args` (only before a `--` separator).
fn take_option(args: &mut Vec<String>, flag: &str) -> Result<Option<String>> {
    let end = args.iter().position(|a| a == "--").unwrap_or(args.len());
    let Some(pos) = args[..end].iter().position(|a| a == flag) else {
        return Ok(None);
    };
    if pos + 1 >= end {
        bail!("{flag} needs a value");
    }
    let value = args.remove(pos + 1);
    args.remove(pos);
    Ok(Some(value))
}

fn positional<const N: usize>(args: Vec<String>, usage: &str) -> Result<[String; N]> {
    args.try_into()
        .map_err(|_| anyhow!("usage: sprint-ledger {usage}"))
}

fn list_filter(args: &mut Vec<String>) -> Result<LedgerFilter> {
    let mut filter = LedgerFilter::default();
    if let Some(sprint) = take_option(args, "--sprint")? {
        filter = filter.sprint(sprint);
    }
    if let Some(hash) = take_option(args, "--hash")? {
        filter = filter.hash(hash);
    }
    if let Some(ts) = take_option(args, "--since")? {
        filter = filter.since(ts.parse().with_context(|| format!("invalid --since {ts}"))?);
    }
    if let Some(ts) = take_option(args, "--until")? {
        filter = filter.until(ts.parse().with_context(|| format!("invalid --until {ts}"))?);
    }
    if let Some(n) = take_option(args, "--limit")? {
        filter = filter.limit(n.parse().with_context(|| format!("invalid --limit {n}"))?);
    }
    if let Some(n) = take_option(args, "--offset")? {
        filter = filter.offset(n.parse().with_context(|| format!("invalid --offset {n}"))?);
    }
    if let Some(extra) = args.first() {
        bail!("unexpected argument `{extra}` for list");
    }
    Ok(filter)
}

fn parse_id(text: &str) -> Result<i64> {
    text.parse()
        .with_context(|| format!("ledger id must be an integer, got `{text}`"))
}

fn read_manifest(path: &Path) -> Result<Manifest> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read manifest {}", path.display()))?;
    Ok(Manifest::from_json_str(&content)?)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}
