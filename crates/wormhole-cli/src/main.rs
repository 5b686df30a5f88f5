//! Wormhole CLI
//!
//! The `wormhole` command admits, caches and runs sandboxed functions next
//! to a SQLite data store.
//!
//! ## Commands
//!
//! - `init`: Create the store and seed the standard capability policy
//! - `policy`: List or change capability policy (admin principals only)
//! - `check`: Validate a source file without caching it
//! - `install`: Validate and cache a function
//! - `invoke`: Run a cached function inside a retried transaction
//! - `functions`: List, show or remove cached functions

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, Level};
use wormhole_core::{
    CachedFunction, CapabilityPolicy, PolicySet, RetryContext, Signature, Wormhole,
    WormholeConfig,
};
use wormhole_state::{PolicyStore, SqliteHandle, SqliteSession, StoreConfig, StoreLocation};

#[derive(Parser)]
#[command(name = "wormhole")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Admit, cache and run sandboxed functions next to the data", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// SQLite database file (in-memory when omitted)
    #[arg(long, global = true, env = "WORMHOLE_DB")]
    db: Option<PathBuf>,

    /// Principal the session runs as
    #[arg(long, global = true, env = "WORMHOLE_PRINCIPAL")]
    principal: Option<String>,

    /// TOML configuration file
    #[arg(long, global = true, env = "WORMHOLE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the store and seed the standard capability policy
    Init,

    /// Manage capability policy
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },

    /// Validate a source file against the stored policy without caching it
    Check {
        /// Path to the function source
        file: PathBuf,
    },

    /// Validate and cache a function
    Install(InstallArgs),

    /// Run a cached function
    Invoke {
        /// Function id (`<name>_<hash prefix>`)
        id: String,

        /// Arguments as a JSON array (positional) or object (named)
        #[arg(short, long, default_value = "null")]
        args: String,

        /// Replays allowed after a transient failure
        #[arg(long)]
        retries: Option<u32>,
    },

    /// Inspect the function cache
    Functions {
        #[command(subcommand)]
        action: FunctionsAction,
    },
}

#[derive(Args)]
struct InstallArgs {
    /// Function name; the source must define a function with this name
    name: String,

    /// Path to the function source
    file: PathBuf,

    /// Declared parameter names
    #[arg(short, long, value_delimiter = ',')]
    params: Vec<String>,

    /// The function has effects a replay must not repeat
    #[arg(long)]
    non_idempotent: bool,
}

#[derive(Subcommand)]
enum PolicyAction {
    /// List capability entries
    List,

    /// Allow or deny a capability
    Set {
        /// Capability (module root) name
        name: String,

        /// Deny instead of allow
        #[arg(long)]
        deny: bool,

        /// Audit note
        #[arg(short, long, default_value = "")]
        note: String,
    },

    /// Remove a capability entry (absent capabilities are denied)
    Remove {
        /// Capability name
        name: String,
    },
}

#[derive(Subcommand)]
enum FunctionsAction {
    /// List cached functions
    List,

    /// Show one cached function, including its source
    Show {
        /// Function id
        id: String,
    },

    /// Remove a cached function (admin principals only)
    Remove {
        /// Function id
        id: String,
    },
}

/// One row of `functions list`.
#[derive(Serialize)]
struct FunctionSummary<'a> {
    id: &'a str,
    name: &'a str,
    created_by: &'a str,
    created_at: String,
    last_executed: Option<String>,
    execution_count: u64,
    idempotent: bool,
}

impl<'a> From<&'a CachedFunction> for FunctionSummary<'a> {
    fn from(function: &'a CachedFunction) -> Self {
        Self {
            id: &function.id,
            name: &function.name,
            created_by: &function.created_by,
            created_at: function.created_at.to_rfc3339(),
            last_executed: function.last_executed.map(|at| at.to_rfc3339()),
            execution_count: function.execution_count,
            idempotent: function.idempotent,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    wormhole_core::telemetry::init_tracing(cli.json, level);

    let config = load_config(cli.config.as_deref())?;
    let store = store_config(cli.db.as_deref(), cli.principal.as_deref())?;
    let handle = SqliteHandle::open(&store).context("Failed to open the Wormhole store")?;

    if let Commands::Init = cli.command {
        return cmd_init(&handle);
    }

    let session = handle.session().context("Failed to open a session")?;
    let wormhole = Wormhole::new(session, config)?;

    let result = match cli.command {
        Commands::Init => Ok(()),
        Commands::Policy { action } => match action {
            PolicyAction::List => cmd_policy_list(&wormhole),
            PolicyAction::Set { name, deny, note } => {
                cmd_policy_set(&wormhole, &name, !deny, &note)
            }
            PolicyAction::Remove { name } => cmd_policy_remove(&wormhole, &name),
        },
        Commands::Check { file } => cmd_check(&wormhole, &file),
        Commands::Install(args) => cmd_install(&wormhole, args),
        Commands::Invoke { id, args, retries } => {
            cmd_invoke(&wormhole, &id, &args, retries).await
        }
        Commands::Functions { action } => match action {
            FunctionsAction::List => cmd_functions_list(&wormhole),
            FunctionsAction::Show { id } => cmd_functions_show(&wormhole, &id),
            FunctionsAction::Remove { id } => cmd_functions_remove(&wormhole, &id),
        },
    };

    wormhole.metrics().flush();
    result
}

fn load_config(path: Option<&Path>) -> Result<WormholeConfig> {
    let config = match path {
        Some(path) => WormholeConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => WormholeConfig::default(),
    };
    Ok(config.apply_env()?)
}

fn store_config(db: Option<&Path>, principal: Option<&str>) -> Result<StoreConfig> {
    let mut store = StoreConfig::from_env().map_err(anyhow::Error::msg)?;
    if let Some(db) = db {
        store.location = StoreLocation::File(db.to_path_buf());
    }
    if let Some(principal) = principal {
        store = store.with_principal(principal);
    }
    Ok(store)
}

fn read_source(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read source file: {}", path.display()))
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Seed the standard policy into a store that has none yet.
fn cmd_init(handle: &SqliteHandle) -> Result<()> {
    let session = handle.session()?;
    if !session.load_policy()?.is_empty() {
        println!("Store already initialized; policy left unchanged");
        return Ok(());
    }

    let standard = PolicySet::standard();
    for policy in standard.iter() {
        session.put_policy(&policy.to_record(handle.principal()))?;
    }
    info!(entries = standard.len(), "seeded standard policy");
    println!("Initialized Wormhole store with {} policy entries", standard.len());
    Ok(())
}

fn cmd_policy_list(wormhole: &Wormhole<SqliteSession>) -> Result<()> {
    let policy = wormhole.policy_list()?;
    if policy.is_empty() {
        println!("No capability policy; every import is denied");
        return Ok(());
    }
    for entry in policy.iter() {
        let verdict = if entry.allowed { "allow" } else { "deny" };
        println!("{:<12} {:<5} {}", entry.name, verdict, entry.note);
    }
    Ok(())
}

fn cmd_policy_set(
    wormhole: &Wormhole<SqliteSession>,
    name: &str,
    allowed: bool,
    note: &str,
) -> Result<()> {
    let policy = if allowed {
        CapabilityPolicy::allow(name, note)
    } else {
        CapabilityPolicy::deny(name, note)
    };
    wormhole.policy_set(&policy)?;
    println!("{} {}", if allowed { "Allowed" } else { "Denied" }, name);
    Ok(())
}

fn cmd_policy_remove(wormhole: &Wormhole<SqliteSession>, name: &str) -> Result<()> {
    if wormhole.policy_remove(name)? {
        println!("Removed policy entry {name}");
    } else {
        println!("No policy entry named {name}");
    }
    Ok(())
}

fn cmd_check(wormhole: &Wormhole<SqliteSession>, file: &Path) -> Result<()> {
    let source = read_source(file)?;
    let report = wormhole.check(&source)?;
    print_json(&report)?;
    if !report.accepted {
        bail!("{} violation(s) found", report.violations.len());
    }
    Ok(())
}

fn cmd_install(wormhole: &Wormhole<SqliteSession>, args: InstallArgs) -> Result<()> {
    let source = read_source(&args.file)?;
    let mut signature = Signature::new(args.params);
    if args.non_idempotent {
        signature = signature.non_idempotent();
    }
    let installed = wormhole.install(&args.name, &source, &signature)?;
    print_json(&installed)
}

async fn cmd_invoke(
    wormhole: &Wormhole<SqliteSession>,
    id: &str,
    raw_args: &str,
    retries: Option<u32>,
) -> Result<()> {
    let args: serde_json::Value =
        serde_json::from_str(raw_args).context("--args must be valid JSON")?;
    let mut ctx = RetryContext::from_defaults(&wormhole.config().retry);
    if let Some(retries) = retries {
        ctx.max_retries = retries;
    }
    let result = wormhole
        .with_retry(ctx, |tx| tx.invoke(id, &args))
        .await?;
    print_json(&result)
}

fn cmd_functions_list(wormhole: &Wormhole<SqliteSession>) -> Result<()> {
    let functions = wormhole.list()?;
    let summaries: Vec<FunctionSummary<'_>> = functions.iter().map(Into::into).collect();
    print_json(&summaries)
}

fn cmd_functions_show(wormhole: &Wormhole<SqliteSession>, id: &str) -> Result<()> {
    let function = wormhole.peek(id)?;
    print_json(&FunctionSummary::from(&function))?;
    println!();
    print!("{}", function.source);
    Ok(())
}

fn cmd_functions_remove(wormhole: &Wormhole<SqliteSession>, id: &str) -> Result<()> {
    if wormhole.remove(id)? {
        println!("Removed {id}");
    } else {
        println!("No cached function {id}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_install_with_params() {
        let cli = Cli::try_parse_from([
            "wormhole",
            "install",
            "total",
            "total.py",
            "--params",
            "values,scale",
            "--non-idempotent",
        ])
        .unwrap();
        match cli.command {
            Commands::Install(args) => {
                assert_eq!(args.name, "total");
                assert_eq!(args.params, vec!["values", "scale"]);
                assert!(args.non_idempotent);
            }
            _ => panic!("expected install"),
        }
    }

    #[test]
    fn parses_invoke_defaults() {
        let cli = Cli::try_parse_from(["wormhole", "--json", "invoke", "total_0123"]).unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Invoke { id, args, retries } => {
                assert_eq!(id, "total_0123");
                assert_eq!(args, "null");
                assert!(retries.is_none());
            }
            _ => panic!("expected invoke"),
        }
    }

    #[test]
    fn init_seeds_policy_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = StoreConfig::file(dir.path().join("wormhole.db")).with_principal("ops");
        let handle = SqliteHandle::open(&store).unwrap();

        cmd_init(&handle).unwrap();
        let seeded = handle.session().unwrap().load_policy().unwrap();
        assert_eq!(seeded.len(), PolicySet::standard().len());

        cmd_init(&handle).unwrap();
        assert_eq!(
            handle.session().unwrap().load_policy().unwrap().len(),
            seeded.len()
        );
    }

    #[tokio::test]
    async fn install_and_invoke_through_commands() {
        let dir = tempfile::tempdir().unwrap();
        let store = StoreConfig::file(dir.path().join("wormhole.db")).with_principal("ops");
        let handle = SqliteHandle::open(&store).unwrap();
        cmd_init(&handle).unwrap();

        let source = dir.path().join("double.py");
        std::fs::write(&source, "def double(x):\n    return x * 2\n").unwrap();

        let wormhole = Wormhole::new(handle.session().unwrap(), WormholeConfig::default()).unwrap();
        cmd_install(
            &wormhole,
            InstallArgs {
                name: "double".to_string(),
                file: source,
                params: vec!["x".to_string()],
                non_idempotent: false,
            },
        )
        .unwrap();
        let id = wormhole.list().unwrap()[0].id.clone();
        cmd_invoke(&wormhole, &id, "[4]", Some(0)).await.unwrap();
        assert_eq!(wormhole.peek(&id).unwrap().execution_count, 1);
        assert!(cmd_invoke(&wormhole, &id, "not json", None).await.is_err());
    }
}
