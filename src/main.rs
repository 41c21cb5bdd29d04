use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use plugin_sandbox::capabilities::{CapabilityLevel, CapabilityManager};
use plugin_sandbox::config::Config;
use plugin_sandbox::context::LocalHost;
use plugin_sandbox::isolation::{ExecuteOptions, IsolationManager};
use plugin_sandbox::runtime::ScriptRuntime;
use plugin_sandbox::security::{ScriptLanguage, SecurityPolicy};

fn print_help() {
    println!(
        "\
plugin-sandbox v{}

Runs a plugin script in an isolated worker under a validated capability grant.

USAGE:
    plugin-sandbox [OPTIONS] <MANIFEST> <SCRIPT>

ARGUMENTS:
    MANIFEST    JSON capability manifest declared by the plugin
    SCRIPT      Script file for the builtin line runtime

OPTIONS:
    -l, --level <LEVEL>        Template merged under the manifest
                               (minimal, standard, enhanced, privileged) [default: standard]
    -c, --config <PATH>        TOML sandbox configuration [default: built-in defaults]
    -i, --input <JSON>         Input value passed to the script [default: null]
        --language <LANG>      Language the scanner assumes (javascript, typescript,
                               python, plain) [default: plain]
        --plugin-id <ID>       Plugin id [default: manifest file stem]
        --report               Print the capability report after the outcome
    -h, --help                 Print this help message and exit
    -V, --version              Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG    Log level filter for tracing
                (e.g. debug, plugin_sandbox=debug,warn)

EXAMPLES:
    plugin-sandbox manifest.json job.script
    plugin-sandbox --level minimal --report manifest.json job.script
    RUST_LOG=debug plugin-sandbox -c sandbox.toml manifest.json job.script",
        env!("CARGO_PKG_VERSION"),
    );
}

struct Args {
    manifest: String,
    script: String,
    level: CapabilityLevel,
    config: Option<String>,
    input: Value,
    language: ScriptLanguage,
    plugin_id: Option<String>,
    report: bool,
}

fn parse_args(raw: impl IntoIterator<Item = String>) -> Result<Args> {
    let mut positional = Vec::new();
    let mut level = CapabilityLevel::default();
    let mut config = None;
    let mut input = Value::Null;
    let mut language = ScriptLanguage::Plain;
    let mut plugin_id = None;
    let mut report = false;

    let mut raw = raw.into_iter();
    while let Some(arg) = raw.next() {
        let mut value = |name: &str| raw.next().ok_or_else(|| anyhow!("{name} needs a value"));
        match arg.as_str() {
            "--level" | "-l" => level = value("--level")?.parse()?,
            "--config" | "-c" => config = Some(value("--config")?),
            "--input" | "-i" => {
                let text = value("--input")?;
                input = serde_json::from_str(&text).with_context(|| format!("--input is not JSON: {text}"))?;
            }
            "--language" => language = value("--language")?.parse()?,
            "--plugin-id" => plugin_id = Some(value("--plugin-id")?),
            "--report" => report = true,
            flag if flag.starts_with('-') => bail!("unknown option '{flag}' (see --help)"),
            _ => positional.push(arg),
        }
    }

    let [manifest, script]: [String; 2] = positional
        .try_into()
        .map_err(|_| anyhow!("expected <MANIFEST> <SCRIPT> (see --help)"))?;
    Ok(Args {
        manifest,
        script,
        level,
        config,
        input,
        language,
        plugin_id,
        report,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("plugin-sandbox v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("plugin_sandbox=info")),
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
    info!("Sandbox: {}", config.describe());

    let plugin_id = match &args.plugin_id {
        Some(id) => id.clone(),
        None => Path::new(&args.manifest)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .ok_or_else(|| anyhow!("cannot derive a plugin id from {}", args.manifest))?,
    };

    let manifest: Value = serde_json::from_str(
        &std::fs::read_to_string(&args.manifest)
            .with_context(|| format!("reading manifest {}", args.manifest))?,
    )
    .with_context(|| format!("manifest {} is not JSON", args.manifest))?;
    let script = std::fs::read_to_string(&args.script)
        .with_context(|| format!("reading script {}", args.script))?;

    let mut capabilities = CapabilityManager::new(config.capabilities.clone());
    let grant = capabilities.validate_capabilities(&plugin_id, &manifest, args.level)?;

    let isolation = IsolationManager::new(
        config.isolation.clone(),
        SecurityPolicy::new(config.security.clone()),
        Arc::new(LocalHost::new()),
        Arc::new(ScriptRuntime::new()),
    );

    let run = async {
        let worker_id = isolation.create_plugin_context(&plugin_id, grant).await?;
        let options = ExecuteOptions {
            language: args.language,
            ..Default::default()
        };
        isolation.execute(&worker_id, &script, args.input.clone(), options).await
    };

    let outcome = tokio::select! {
        outcome = run => outcome,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, exiting");
            isolation.dispose();
            return Ok(());
        }
    };
    isolation.dispose();

    let succeeded = outcome.is_ok();
    let printed = match outcome {
        Ok(outcome) => {
            if !outcome.violations.is_empty() {
                warn!("Execution breached policy ceilings: {}", outcome.violations.join("; "));
            }
            serde_json::to_value(&outcome)?
        }
        Err(e) => {
            error!("Plugin {plugin_id} failed: {e}");
            json!({ "error": e.to_wire() })
        }
    };
    println!("{}", serde_json::to_string_pretty(&printed)?);

    if args.report {
        if let Some(report) = capabilities.generate_capability_report(&plugin_id) {
            println!("\n{report}");
        }
    }

    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}
