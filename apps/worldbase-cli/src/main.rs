use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use glam::Vec3;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use worldbase_common::Transform;
use worldbase_kernel::{EntityType, WorldDatabase};
use worldbase_render::{DebugTextRenderer, RenderView, Renderer};

#[derive(Parser)]
#[command(name = "worldbase-cli", about = "CLI tool for world database operations")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Either a single world document or the three separate files.
#[derive(Args)]
struct WorldSource {
    /// Single-document world (entity types, tiles and layout)
    #[arg(long, conflicts_with_all = ["entity_types", "tiles", "layout"])]
    world: Option<PathBuf>,
    /// Entity type definitions
    #[arg(long, requires_all = ["tiles", "layout"])]
    entity_types: Option<PathBuf>,
    /// Tile definitions
    #[arg(long)]
    tiles: Option<PathBuf>,
    /// Environment layout
    #[arg(long)]
    layout: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version and crate info
    Info,
    /// Parse and validate configuration without building a world
    Validate(WorldSource),
    /// Load a world and print it
    Inspect {
        #[command(flatten)]
        source: WorldSource,
        /// Reload environments from the layout before printing
        #[arg(long)]
        reload: bool,
        /// Append the full database dump
        #[arg(long)]
        dump: bool,
    },
    /// Mirror entity creation and destruction between two in-process peers
    Peers {
        /// Number of entities the first peer creates
        #[arg(short, long, default_value = "3")]
        entities: u16,
    },
}

fn load(db: &mut WorldDatabase, source: &WorldSource) -> anyhow::Result<usize> {
    let loaded = match (&source.world, &source.entity_types, &source.tiles, &source.layout) {
        (Some(world), ..) => db
            .load_world_file(world)
            .with_context(|| format!("loading world {}", world.display()))?,
        (None, Some(types), Some(tiles), Some(layout)) => db
            .load_world_database(types, tiles, layout)
            .context("loading world database")?,
        _ => bail!("pass --world, or --entity-types, --tiles and --layout"),
    };
    Ok(loaded)
}

fn validate(source: &WorldSource) -> anyhow::Result<()> {
    if let Some(world) = &source.world {
        let config = worldbase_config::load_world(world)
            .with_context(|| format!("reading {}", world.display()))?;
        config.validate()?;
        let base = world.parent();
        for placement in &config.layout.environments {
            placement
                .resolve(base)
                .with_context(|| format!("environment {}", placement.id))?;
        }
        println!(
            "OK: {} entity types, {} tiles, {} environments",
            config.entity_types.len(),
            config.tiles.len(),
            config.layout.environments.len()
        );
        return Ok(());
    }
    let (Some(types), Some(tiles), Some(layout)) =
        (&source.entity_types, &source.tiles, &source.layout)
    else {
        bail!("pass --world, or --entity-types, --tiles and --layout");
    };
    let types = worldbase_config::load_entity_types(types).context("reading entity types")?;
    let tiles_config = worldbase_config::load_tiles(tiles).context("reading tiles")?;
    let layout_config = worldbase_config::load_layout(layout).context("reading layout")?;
    for placement in &layout_config.environments {
        placement
            .resolve(layout.parent())
            .with_context(|| format!("environment {}", placement.id))?;
    }
    println!(
        "OK: {} entity types, {} tiles, {} environments",
        types.entity_types.len(),
        tiles_config.tiles.len(),
        layout_config.environments.len()
    );
    Ok(())
}

/// Hand every message of `from` to `to`.
fn exchange(from: &mut WorldDatabase, to: &mut WorldDatabase) -> anyhow::Result<usize> {
    let outgoing = from.process_events()?;
    for message in &outgoing {
        to.receive(message)?;
    }
    Ok(outgoing.len())
}

fn peers(entities: u16) -> anyhow::Result<()> {
    let mut first = WorldDatabase::new().with_peer_slot(0);
    let mut second = WorldDatabase::new().with_peer_slot(1);
    for db in [&mut first, &mut second] {
        db.add_entity_type(EntityType::new(1, "crate"))?;
    }

    first.create_environment(1, 0, 0, 10, 10)?;
    exchange(&mut first, &mut second)?;

    let mut ids = Vec::new();
    for i in 0..entities {
        let (db, z) = if i % 2 == 0 {
            (&mut first, 0.5)
        } else {
            (&mut second, 1.5)
        };
        let position = Vec3::new(f32::from(i) * 0.5, 0.0, z);
        ids.push(db.create_entity(1, 1, Transform::from_position(position), None)?);
    }
    let messages = exchange(&mut first, &mut second)? + exchange(&mut second, &mut first)?;
    let count = |db: &WorldDatabase| db.environments().map(|e| e.entity_count()).sum::<usize>();
    println!(
        "After creation: first={} second={} messages={}",
        count(&first),
        count(&second),
        messages
    );

    if let Some(&id) = ids.last() {
        second.destroy_entity(id, None)?;
        exchange(&mut second, &mut first)?;
        println!(
            "After destroying {id}: first={} second={}",
            count(&first),
            count(&second)
        );
    }

    let renderer = DebugTextRenderer::new();
    print!("{}", renderer.render(&first, &RenderView::default()));
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    match cli.command {
        Commands::Info => {
            println!("worldbase-cli v{}", env!("CARGO_PKG_VERSION"));
            println!("common: {}", worldbase_common::crate_info());
            println!("config: {}", worldbase_config::crate_info());
            println!("kernel: {}", worldbase_kernel::crate_info());
            println!("render: {}", worldbase_render::crate_info());
        }
        Commands::Validate(source) => validate(&source)?,
        Commands::Inspect { source, reload, dump } => {
            let mut db = WorldDatabase::new();
            let loaded = load(&mut db, &source)?;
            tracing::info!(loaded, "world loaded");
            if reload {
                db.reload_environments();
                db.process_events()?;
            }
            let renderer = DebugTextRenderer { verbose: dump };
            print!("{}", renderer.render(&db, &RenderView::default()));
        }
        Commands::Peers { entities } => peers(entities)?,
    }

    Ok(())
}
