use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use guild_scripts::capabilities::{
    HostServices, MemorySavedMessages, SavedMessage, SavedMessageStore,
};
use guild_scripts::config::Config;
use guild_scripts::discord::{
    CacheSnapshot, DerivedPermissions, InMemoryCache, Interaction, RecordingRest,
};
use guild_scripts::dispatch::Dispatcher;
use guild_scripts::sandbox::{CompiledScript, RunReport, Script, ScriptRuntime};

fn print_help() {
    println!(
        "\
guild-scripts v{}

Compiles and runs Discord interaction scripts in a metered sandbox.

USAGE:
    guild-scripts check <SCRIPT> [--config PATH]
    guild-scripts run <SCRIPT> <FIXTURE> [--config PATH]

COMMANDS:
    check    Compile a script and report errors
    run      Run a script against a JSON fixture with a recording
             REST client; prints the Discord calls and the run report

OPTIONS:
    -c, --config PATH    TOML configuration file [default: built-in defaults]
    -h, --help           Print this help message and exit
    -V, --version        Print version and exit

FIXTURE:
    JSON object with \"interaction\", \"permissions\" and optionally
    \"cache\" and \"saved_messages\".

ENVIRONMENT VARIABLES:
    RUST_LOG    Log level filter for tracing
                (e.g. debug, guild_scripts=debug,warn)
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

EXAMPLES:
    guild-scripts check scripts/counter.rhai
    guild-scripts run scripts/counter.rhai fixtures/click.json
    RUST_LOG=debug guild-scripts run scripts/counter.rhai fixtures/click.json",
        env!("CARGO_PKG_VERSION"),
    );
}

/// A recorded interaction to run a script against.
#[derive(Debug, Deserialize)]
struct Fixture {
    interaction: Interaction,
    permissions: DerivedPermissions,
    #[serde(default)]
    cache: CacheSnapshot,
    #[serde(default)]
    saved_messages: Vec<SavedMessage>,
}

enum Command {
    Check { script: String },
    Run { script: String, fixture: String },
}

struct Args {
    command: Command,
    config: Option<String>,
}

fn parse_args(args: impl Iterator<Item = String>) -> Result<Args> {
    let mut positional = Vec::new();
    let mut config = None;
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                config = Some(args.next().ok_or_else(|| anyhow!("--config needs a path"))?);
            }
            flag if flag.starts_with('-') => bail!("unknown option: {flag}"),
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let command = match positional.next().as_deref() {
        Some("check") => Command::Check {
            script: positional.next().ok_or_else(|| anyhow!("check needs <SCRIPT>"))?,
        },
        Some("run") => Command::Run {
            script: positional.next().ok_or_else(|| anyhow!("run needs <SCRIPT>"))?,
            fixture: positional.next().ok_or_else(|| anyhow!("run needs <FIXTURE>"))?,
        },
        Some(other) => bail!("unknown command: {other}"),
        None => bail!("missing command, see --help"),
    };
    if let Some(extra) = positional.next() {
        bail!("unexpected argument: {extra}");
    }

    Ok(Args { command, config })
}

fn compile(runtime: &ScriptRuntime, path: &str) -> Result<CompiledScript> {
    let body = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    let id = Path::new(path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(path);
    Ok(runtime.compile(&Script::new(id, body))?)
}

async fn run(config: &Config, script: CompiledScript, fixture_path: &str) -> Result<RunReport> {
    let content =
        std::fs::read_to_string(fixture_path).with_context(|| format!("reading {fixture_path}"))?;
    let fixture: Fixture =
        serde_json::from_str(&content).with_context(|| format!("parsing {fixture_path}"))?;

    info!("KV backend: {}", config.kv.backend_description());
    let rest = Arc::new(RecordingRest::new());
    let saved_messages: Option<Arc<dyn SavedMessageStore>> = if fixture.saved_messages.is_empty() {
        None
    } else {
        Some(Arc::new(MemorySavedMessages::new(fixture.saved_messages)))
    };
    let services = HostServices {
        cache: Arc::new(InMemoryCache::new(fixture.cache)),
        rest: rest.clone(),
        kv: config.kv.open_store()?,
        saved_messages,
    };

    let dispatcher = Dispatcher::new(services, config);
    let report = dispatcher
        .dispatch(&script, fixture.interaction, fixture.permissions)
        .await?;

    for call in rest.calls() {
        println!("{}", serde_json::to_string_pretty(&call)?);
    }
    Ok(report)
}

fn print_report(report: &RunReport) {
    println!("script:    {}", report.script_id);
    println!("outcome:   {}", report.outcome);
    println!("steps:     {}", report.steps);
    println!("execution: {}ms", report.execution_duration.as_millis());
    println!("idle:      {}ms", report.idle_duration.as_millis());
    println!("total:     {}ms", report.total_duration.as_millis());
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("guild-scripts v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("guild_scripts=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = parse_args(std::env::args().skip(1))?;
    let config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {path}");
            Config::load(path)?
        }
        None => Config::default(),
    };
    let runtime = ScriptRuntime::new(config.sandbox.limits());

    match args.command {
        Command::Check { script } => {
            let compiled = compile(&runtime, &script)?;
            println!("{}: ok", compiled.id());
        }
        Command::Run { script, fixture } => {
            let compiled = compile(&runtime, &script)?;
            let report = run(&config, compiled, &fixture).await?;
            print_report(&report);
            if !report.outcome.is_success() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Result<Args> {
        parse_args(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_parse_check() {
        let parsed = args(&["check", "a.rhai"]).unwrap();
        assert!(matches!(parsed.command, Command::Check { ref script } if script == "a.rhai"));
        assert!(parsed.config.is_none());
    }

    #[test]
    fn test_parse_run_with_config() {
        let parsed = args(&["run", "a.rhai", "f.json", "--config", "c.toml"]).unwrap();
        assert!(matches!(
            parsed.command,
            Command::Run { ref script, ref fixture } if script == "a.rhai" && fixture == "f.json"
        ));
        assert_eq!(parsed.config.as_deref(), Some("c.toml"));
    }

    #[test]
    fn test_parse_errors() {
        assert!(args(&[]).is_err());
        assert!(args(&["check"]).is_err());
        assert!(args(&["run", "a.rhai"]).is_err());
        assert!(args(&["serve"]).is_err());
        assert!(args(&["check", "a.rhai", "extra"]).is_err());
        assert!(args(&["check", "a.rhai", "--config"]).is_err());
        assert!(args(&["check", "a.rhai", "--verbose"]).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_fixture() {
        let dir = tempfile::tempdir().unwrap();
        let script_path = dir.path().join("hello.rhai");
        std::fs::write(&script_path, r#"ctx.respond("hi " + ctx.member.name);"#).unwrap();
        let fixture_path = dir.path().join("fixture.json");
        std::fs::write(
            &fixture_path,
            r#"{
                "interaction": {
                    "id": "10", "application_id": "20", "token": "tok",
                    "type": "command", "guild_id": "1", "channel_id": "2",
                    "member": {"user": {"id": "5", "username": "alice"}}
                },
                "permissions": {"user_id": "5"}
            }"#,
        )
        .unwrap();

        let config = Config::default();
        let runtime = ScriptRuntime::new(config.sandbox.limits());
        let compiled = compile(&runtime, script_path.to_str().unwrap()).unwrap();
        assert_eq!(compiled.id(), "hello");

        let report = run(&config, compiled, fixture_path.to_str().unwrap())
            .await
            .unwrap();
        assert!(report.outcome.is_success());
    }
}
