//! dbboot command line.
//!
//! Loads bootstrap options from a JSON file and `DBBOOT_*` variables, then
//! bootstraps, restores, resets or inspects the target database.

use clap::{Parser, Subcommand};
use dbboot_core::logging::{init_logging, LogConfig};
use dbboot_core::services::uri;
use dbboot_core::{ConnectionSpec, Database, DatabaseConfig, DbBootError, DbResult, Restorer};
use std::path::PathBuf;
use std::process::ExitCode;

/// Connect, prepare and inspect databases for data-processing jobs.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON bootstrap configuration. `DBBOOT_*` variables are used without it.
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. "info,dbboot_core=debug".
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bootstrap a session and print what was found.
    Check(CheckArgs),
    /// Print the connection URI built from parameters.
    Encode(EncodeArgs),
    /// Restore a pg_dump archive with pg_restore.
    Restore(RestoreArgs),
    /// Drop and recreate a schema.
    ResetSchema(SchemaArgs),
}

#[derive(Parser)]
struct CheckArgs {
    /// Connection URI, overrides the configuration.
    #[arg(long)]
    uri: Option<String>,

    /// Introspect the live schema and print it.
    #[arg(long)]
    reflect: bool,

    /// Drop and recreate the schema first.
    #[arg(long)]
    recreate_schema: bool,

    /// pg_dump archive to restore first.
    #[arg(long)]
    backup_file: Option<PathBuf>,
}

#[derive(Parser)]
struct EncodeArgs {
    #[arg(long)]
    database: String,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    username: Option<String>,
    #[arg(long)]
    password: Option<String>,
    #[arg(long, default_value = "postgresql")]
    dialect: String,
    #[arg(long)]
    driver: Option<String>,
    /// Leave out the driver.
    #[arg(long)]
    no_driver: bool,
}

#[derive(Parser)]
struct RestoreArgs {
    /// Archive to restore.
    file: PathBuf,
    #[arg(long)]
    uri: Option<String>,
    /// pg_restore executable.
    #[arg(long, default_value = "pg_restore")]
    program: String,
}

#[derive(Parser)]
struct SchemaArgs {
    #[arg(long)]
    uri: Option<String>,
    #[arg(long)]
    schema: Option<String>,
    /// Drop without recreating.
    #[arg(long)]
    drop: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut log_config = LogConfig::default();
    if let Some(filter) = &cli.log {
        log_config = log_config.with_filter(filter.as_str());
    }
    let _guard = init_logging(log_config);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(category = e.category(), error = %e, "dbboot failed");
            eprintln!("Error: {e}");
            if let Some(hint) = e.hint() {
                eprintln!("Hint: {hint}");
            }
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> DbResult<DatabaseConfig> {
    match path {
        Some(path) => DatabaseConfig::from_file(path),
        None => DatabaseConfig::from_env(),
    }
}

/// URI from the flag, the configuration's URI, or its parameters.
fn target_uri(flag: Option<String>, config: &DatabaseConfig) -> DbResult<String> {
    let resolved = flag
        .or_else(|| config.uri.clone())
        .unwrap_or_else(|| uri::encode(&config.params, true));
    if resolved.is_empty() {
        return Err(DbBootError::config("No database uri or connection parameters provided!"));
    }
    Ok(resolved)
}

fn run(cli: Cli) -> DbResult<()> {
    match cli.command {
        Commands::Check(args) => check(load_config(cli.config.as_ref())?, args),
        Commands::Encode(args) => {
            let mut spec = ConnectionSpec::new(args.database).with_dialect(args.dialect);
            spec.host = args.host;
            spec.port = args.port;
            spec.username = args.username;
            spec.password = args.password;
            spec.driver = args.driver;
            println!("{}", uri::encode(&spec, !args.no_driver));
            Ok(())
        }
        Commands::Restore(args) => {
            let config = load_config(cli.config.as_ref())?;
            let db_uri = target_uri(args.uri, &config)?;
            let output = Restorer::new().with_program(args.program).restore(&db_uri, &args.file)?;
            print!("{output}");
            Ok(())
        }
        Commands::ResetSchema(args) => {
            let config = load_config(cli.config.as_ref())?;
            let db_uri = target_uri(args.uri, &config)?;
            let schema = args.schema.unwrap_or(config.schema);
            let engine = dbboot_core::create_engine(&db_uri)?;
            let ok = if args.drop {
                Database::drop_schema(engine.as_ref(), &schema)
            } else {
                Database::reset_schema(engine.as_ref(), &schema)
            };
            engine.dispose()?;
            if ok {
                println!("{schema}: ok");
                Ok(())
            } else {
                Err(DbBootError::database(format!("Failed to update schema {schema}")))
            }
        }
    }
}

fn check(mut config: DatabaseConfig, args: CheckArgs) -> DbResult<()> {
    if args.uri.is_some() {
        config.uri = args.uri;
    }
    config.reflect |= args.reflect;
    config.recreate_schema |= args.recreate_schema;
    if args.backup_file.is_some() {
        config.backup_file = args.backup_file;
    }

    let mut db = config.into_builder().build()?;
    println!("Connected: {}", uri::redact(db.engine().url()));
    if let Some((host, port)) = db.tunnel_endpoint() {
        println!("Tunnel: {host}:{port}");
    }
    if let Some(catalog) = db.reflected_classes() {
        println!("{}", serde_json::to_string_pretty(catalog)?);
    }
    db.close()
}
