mod api;
mod config;
mod server;
mod ws;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axiom_core::{Coordinates, Layer, LayerPatch, TokenAttrs, TokenId, TokenPatch, TokenSpace, Vec3};
use axiom_signal::Axiom;
use axiom_store::TokenDb;
use clap::{Parser, Subcommand};

use crate::api::{QueryView, TokenView};
use crate::config::{AppConfig, DB_FILE};

#[derive(Parser)]
#[command(name = "axiom", about = "Layered spatial token space: CLI and server")]
struct Cli {
    /// Config file (TOML). Defaults to AXIOM_CONFIG or <data dir>/axiom.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP + WebSocket server
    Serve {
        /// Listen address, overrides [server] bind
        #[arg(long)]
        bind: Option<String>,
    },

    /// Create a token
    Create {
        #[arg(long, default_value_t = 0)]
        entity_type: u8,
        #[arg(long, default_value_t = 0)]
        domain: u8,
        #[arg(long)]
        weight: Option<f32>,
        #[arg(long)]
        field_radius: Option<f32>,
        #[arg(long)]
        field_strength: Option<f32>,
        #[arg(long)]
        persistent: bool,
        /// Position in one layer, e.g. `--at l1=1,2,3` (repeatable)
        #[arg(long = "at", value_parser = parse_placement)]
        placements: Vec<(Layer, Vec3)>,
    },

    /// Show one token
    Get {
        /// Decimal or 0x-prefixed hex id
        id: String,
    },

    /// List tokens in creation order
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },

    /// Update a token's attributes or positions
    Update {
        id: String,
        #[arg(long)]
        weight: Option<f32>,
        #[arg(long)]
        field_radius: Option<f32>,
        #[arg(long)]
        field_strength: Option<f32>,
        #[arg(long = "at", value_parser = parse_placement)]
        placements: Vec<(Layer, Vec3)>,
        /// Remove the token from a layer (repeatable)
        #[arg(long = "clear", value_parser = parse_layer)]
        clear: Vec<Layer>,
    },

    /// Delete a token
    Delete { id: String },

    /// Tokens within a radius of a point in one layer
    Query {
        #[arg(value_parser = parse_layer)]
        layer: Layer,
        /// Center as x,y,z
        #[arg(value_parser = parse_vec3, allow_hyphen_values = true)]
        center: Vec3,
        radius: f64,
        #[arg(long)]
        max_results: Option<usize>,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Show store and grid statistics
    Stats,

    /// Export state to a JSON file
    Export {
        /// Output file path
        path: PathBuf,
    },

    /// Import state from a JSON file
    Import {
        /// Input file path
        path: PathBuf,
    },
}

fn parse_layer(s: &str) -> std::result::Result<Layer, String> {
    Layer::parse(s).ok_or_else(|| format!("unknown layer {s:?} (expected l1..l8 or a name)"))
}

fn parse_vec3(s: &str) -> std::result::Result<Vec3, String> {
    let parts: Vec<f32> = s
        .split(',')
        .map(|p| p.trim().parse::<f32>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| format!("invalid coordinate in {s:?}: {e}"))?;
    match parts.as_slice() {
        [x, y, z] => Ok(Vec3::new(*x, *y, *z)),
        _ => Err(format!("expected x,y,z, got {s:?}")),
    }
}

fn parse_placement(s: &str) -> std::result::Result<(Layer, Vec3), String> {
    let (layer, position) = s
        .split_once('=')
        .ok_or_else(|| format!("expected LAYER=x,y,z, got {s:?}"))?;
    Ok((parse_layer(layer)?, parse_vec3(position)?))
}

fn parse_id(s: &str) -> Result<TokenId> {
    TokenId::parse(s).with_context(|| format!("invalid token id {s:?}"))
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

struct Env {
    config: AppConfig,
    db: TokenDb,
}

impl Env {
    fn open(cli: &Cli) -> Result<Self> {
        let data_dir = config::data_dir();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;
        let config = AppConfig::load(cli.config.as_deref(), &data_dir)?;
        let path = data_dir.join(DB_FILE);
        let db = TokenDb::open(&path)
            .with_context(|| format!("failed to open database {}", path.display()))?;
        Ok(Self { config, db })
    }

    fn load_space(&self) -> Result<TokenSpace> {
        self.db
            .load_space(self.config.core.clone())
            .context("failed to load token space")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let env = Env::open(&cli)?;

    match &cli.command {
        Commands::Serve { bind } => cmd_serve(env, bind.clone()).await,
        Commands::Create {
            entity_type,
            domain,
            weight,
            field_radius,
            field_strength,
            persistent,
            placements,
        } => {
            let defaults = TokenAttrs::new(*entity_type, *domain);
            let attrs = TokenAttrs {
                weight: weight.unwrap_or(defaults.weight),
                field_radius: field_radius.unwrap_or(defaults.field_radius),
                field_strength: field_strength.unwrap_or(defaults.field_strength),
                persistent: *persistent,
                ..defaults
            };
            let coordinates = placements
                .iter()
                .fold(Coordinates::new(), |c, (layer, p)| c.with(*layer, *p));
            cmd_create(&env, &attrs, coordinates)
        }
        Commands::Get { id } => cmd_get(&env, parse_id(id)?),
        Commands::List { limit, offset } => cmd_list(&env, *limit, *offset),
        Commands::Update {
            id,
            weight,
            field_radius,
            field_strength,
            placements,
            clear,
        } => {
            let mut patch = TokenPatch {
                weight: *weight,
                field_radius: *field_radius,
                field_strength: *field_strength,
                ..TokenPatch::default()
            };
            for (layer, p) in placements {
                patch.layers[layer.index()] = LayerPatch::Set(*p);
            }
            for layer in clear {
                patch.layers[layer.index()] = LayerPatch::Clear;
            }
            cmd_update(&env, parse_id(id)?, &patch)
        }
        Commands::Delete { id } => cmd_delete(&env, parse_id(id)?),
        Commands::Query {
            layer,
            center,
            radius,
            max_results,
            timeout_ms,
        } => cmd_query(&env, *layer, *center, *radius, *max_results, *timeout_ms),
        Commands::Stats => cmd_stats(&env),
        Commands::Export { path } => cmd_export(&env, path),
        Commands::Import { path } => cmd_import(&env, path),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to serialize output")?
    );
    Ok(())
}

async fn cmd_serve(env: Env, bind: Option<String>) -> Result<()> {
    let space = env.load_space()?;
    tracing::info!("loaded {} tokens", space.len());
    let bind = bind.unwrap_or_else(|| env.config.server.bind.clone());
    let axiom = Axiom::from_space(space, env.config.signal.clone());
    server::run(server::AppState::new(axiom, env.db), &bind).await
}

fn cmd_create(env: &Env, attrs: &TokenAttrs, coordinates: Coordinates) -> Result<()> {
    let space = env.load_space()?;
    let change = space
        .create(attrs, coordinates)
        .context("failed to create token")?;
    env.db
        .upsert_token(&change.token, space.next_local_id())
        .context("failed to save token")?;
    print_json(&TokenView::new(change.token))
}

fn cmd_get(env: &Env, id: TokenId) -> Result<()> {
    let token = env.load_space()?.get(id)?;
    print_json(&TokenView::new(token))
}

fn cmd_list(env: &Env, limit: usize, offset: usize) -> Result<()> {
    let space = env.load_space()?;
    let tokens = space.list(limit, offset);
    if tokens.is_empty() {
        println!("(no tokens)");
    }
    for t in tokens {
        let layers: Vec<&str> = t.coordinates.iter().map(|(l, _)| l.as_str()).collect();
        println!(
            "{}  type={} domain={} weight={:.3} layers=[{}]",
            t.id.hex(),
            t.entity_type,
            t.domain,
            t.weight,
            layers.join(",")
        );
    }
    Ok(())
}

fn cmd_update(env: &Env, id: TokenId, patch: &TokenPatch) -> Result<()> {
    let space = env.load_space()?;
    let change = space.update(id, patch)?;
    env.db
        .upsert_token(&change.token, space.next_local_id())
        .context("failed to save token")?;
    print_json(&TokenView::new(change.token))
}

fn cmd_delete(env: &Env, id: TokenId) -> Result<()> {
    let space = env.load_space()?;
    let change = space.delete(id)?;
    env.db
        .delete_token(change.token.id)
        .context("failed to delete token row")?;
    println!("deleted {}", change.token.id.hex());
    Ok(())
}

fn cmd_query(
    env: &Env,
    layer: Layer,
    center: Vec3,
    radius: f64,
    max_results: Option<usize>,
    timeout_ms: Option<u64>,
) -> Result<()> {
    let space = env.load_space()?;
    let timeout_ms = timeout_ms.unwrap_or(space.config().query_timeout_ms);
    let deadline = (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms));
    let outcome = space.range_query(layer, center, radius, max_results, deadline)?;
    let partial = outcome.is_partial();
    if partial {
        tracing::warn!("query deadline reached, results are partial");
    }
    print_json(&QueryView::new(outcome.into_hits(), partial))
}

fn cmd_stats(env: &Env) -> Result<()> {
    let space = env.load_space()?;
    println!("tokens:        {}", space.len());
    println!("next_local_id: {}", space.next_local_id());
    for stats in space.all_grid_stats() {
        println!(
            "{:<13}  cell={:<6} cells={:<6} tokens={:<6} max_occupancy={}",
            stats.layer.as_str(),
            stats.cell_size,
            stats.cells,
            stats.tokens,
            stats.max_cell_occupancy
        );
    }
    Ok(())
}

fn cmd_export(env: &Env, path: &Path) -> Result<()> {
    env.db
        .export_json_file(path, env.config.core.clone())
        .with_context(|| format!("failed to export to {}", path.display()))?;
    println!("exported to {}", path.display());
    Ok(())
}

fn cmd_import(env: &Env, path: &Path) -> Result<()> {
    let count = env
        .db
        .import_json_file(path, env.config.core.clone())
        .context("failed to import JSON")?;
    println!("imported {count} tokens from {}", path.display());
    Ok(())
}
