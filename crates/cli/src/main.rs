mod config;
mod error;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use policy::{Direction, Expr, Id, TableSchema};
use runtime::{Caller, RequestScope, RouteMatch};
use serde::Serialize;
use storage::{Page, Store};
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use config::Config;
use error::{Error, Result};

const CONFIG_FILE: &str = "dataward.toml";

#[derive(Parser)]
#[command(name = "dataward")]
#[command(about = "Row and column permission resolution over SQLite", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the data filter a user gets for a table
    Filter {
        #[command(flatten)]
        request: RequestArgs,
    },
    /// Print the columns a user may read and write
    Fields {
        #[command(flatten)]
        request: RequestArgs,
    },
    /// Compile a filter object against a table
    Compile {
        #[arg(short, long)]
        table: String,
        /// Filter as JSON
        filter: String,
    },
    /// Read rows of a table as a user
    Rows {
        #[command(flatten)]
        request: RequestArgs,
        /// Extra filter as JSON
        #[arg(long = "where")]
        filter: Option<String>,
        /// Declared query parameter, `key=value`
        #[arg(short, long = "param")]
        params: Vec<String>,
        #[arg(long)]
        limit: Option<u32>,
        #[arg(long, default_value = "0")]
        offset: u32,
    },
    /// List departments under (or above) a department
    Tree {
        #[arg(short, long)]
        dept: Id,
        #[arg(long)]
        ancestors: bool,
    },
}

#[derive(Args)]
struct RequestArgs {
    #[arg(short, long)]
    user: Id,
    #[arg(short, long)]
    table: String,
    /// Request path, enables menu resolution
    #[arg(long)]
    path: Option<String>,
    /// Route template the path matched
    #[arg(long)]
    template: Option<String>,
    #[arg(long, default_value = "GET")]
    method: String,
    /// Permission tag required by the route
    #[arg(long = "tag")]
    tags: Vec<String>,
}

impl RequestArgs {
    fn route(&self) -> Option<RouteMatch> {
        let path = self.path.clone()?;
        Some(RouteMatch {
            template: self.template.clone().unwrap_or_else(|| path.clone()),
            path,
            method: self.method.to_uppercase(),
            tags: self.tags.clone(),
        })
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load_or_default(&cli.config)?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .init();
    debug!(config = %cli.config.display(), tables = config.tables.len(), "configuration loaded");

    match cli.command {
        Commands::Filter { request } => cmd_filter(&config, &request).await,
        Commands::Fields { request } => cmd_fields(&config, &request).await,
        Commands::Compile { table, filter } => cmd_compile(&config, &table, &filter),
        Commands::Rows {
            request,
            filter,
            params,
            limit,
            offset,
        } => {
            let page = Page { limit, offset };
            cmd_rows(&config, &request, filter.as_deref(), &params, page).await
        }
        Commands::Tree { dept, ancestors } => cmd_tree(&config, dept, ancestors),
    }
}

async fn cmd_filter(config: &Config, request: &RequestArgs) -> Result<()> {
    let store = open_store(config)?;
    let schema = config.schema(&request.table)?;
    let mut scope = request_scope(&store, config, request).await?;
    let filter = scope.resolve_data_filter(&schema).await?;
    print_json(&filter)
}

async fn cmd_fields(config: &Config, request: &RequestArgs) -> Result<()> {
    let store = open_store(config)?;
    let schema = config.schema(&request.table)?;
    let mut scope = request_scope(&store, config, request).await?;
    let access = scope.resolve_allowed_fields(&schema).await?;
    print_json(&access.visible_columns(&schema))
}

fn cmd_compile(config: &Config, table: &str, filter: &str) -> Result<()> {
    let schema = config.schema(table)?;
    let filter: serde_json::Value = serde_json::from_str(filter)?;
    let expr = runtime::compile_filter(&schema, &filter)?;
    let lowered = storage::lower(&expr, &schema);
    print_json(&serde_json::json!({
        "expr": expr,
        "sql": lowered.sql,
        "params": lowered.params.len(),
    }))
}

async fn cmd_rows(
    config: &Config,
    request: &RequestArgs,
    filter: Option<&str>,
    params: &[String],
    page: Page,
) -> Result<()> {
    let store = open_store(config)?;
    let schema = config.schema(&request.table)?;
    let query = query_filter(config, &schema, filter, params)?;

    let mut scope = request_scope(&store, config, request).await?;
    let filter = scope.effective_filter(&schema, query).await?;
    let access = scope.resolve_allowed_fields(&schema).await?;
    let rows = store.select_rows(&schema, &filter, &access, page)?;
    info!(table = %schema.name(), rows = rows.len(), "rows read");
    print_json(&rows)
}

fn cmd_tree(config: &Config, dept: Id, ancestors: bool) -> Result<()> {
    let store = open_store(config)?;
    let tree = policy::DeptTree::new(store.department_edges()?);
    let direction = if ancestors {
        Direction::Ancestors
    } else {
        Direction::Descendants
    };
    print_json(&tree.resolve(dept, direction))
}

/// The `--where` object AND'ed with the declared `--param` keys.
fn query_filter(
    config: &Config,
    schema: &TableSchema,
    filter: Option<&str>,
    params: &[String],
) -> Result<Expr> {
    let mut parts = Vec::new();
    if let Some(filter) = filter {
        let filter: serde_json::Value = serde_json::from_str(filter)?;
        parts.push(runtime::compile_filter(schema, &filter)?);
    }
    if !params.is_empty() {
        let pairs = params
            .iter()
            .map(|param| {
                param
                    .split_once('=')
                    .ok_or_else(|| Error::InvalidParam(param.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        let sets = config.filter_sets()?;
        if let Some(set) = sets.get(schema.name()) {
            parts.push(set.compile(pairs)?);
        }
    }
    Ok(Expr::and(parts))
}

async fn request_scope<'s>(
    store: &'s Store,
    config: &Config,
    request: &RequestArgs,
) -> Result<RequestScope<'s, Store>> {
    let caller = Caller::load(store, request.user).await?;
    let mut scope = RequestScope::new(store, caller).with_superuser(config.superuser_id);
    if let Some(route) = request.route() {
        scope = scope.with_route(route);
    }
    Ok(scope)
}

fn open_store(config: &Config) -> Result<Store> {
    if !config.database.exists() {
        return Err(Error::DatabaseNotFound {
            path: config.database.clone(),
        });
    }
    Ok(Store::open(&config.database)?)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
