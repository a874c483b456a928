use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use soundgraph::client::HttpApi;
use soundgraph::fetcher::Fetcher;
use soundgraph::graph::{GraphView, Layer, NodeKey};
use soundgraph::harvest::{CancelToken, HarvestEngine, HarvestReport, SeedRef};
use soundgraph::process::RelationshipProcessor;
use soundgraph::store::Store;

#[derive(Parser)]
#[command(
    name = "soundgraph",
    version,
    about = "Music-platform knowledge-graph harvester"
)]
struct Cli {
    /// Path to the SQLite database
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Harvest entities and raw facts starting from a seed track
    Harvest {
        /// Seed track: a numeric platform id or a permalink URL
        seed: String,

        /// Number of parallel workers (0 = auto-detect from config)
        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,

        /// Override the freshness TTL in hours
        #[arg(long)]
        ttl_hours: Option<i64>,

        /// Override the max likers/reposters harvested for the seed
        #[arg(long)]
        max_users: Option<usize>,
    },

    /// Derive weighted relationships from harvested raw data
    Process,

    /// Show entity store statistics
    Stats,

    /// List a node's neighbors, ranked by edge weight
    Neighbors {
        /// Node: "track:123", "user:5", "artist:9", or a bare track id
        node: String,

        /// Restrict to one layer (cooccurrence, engagement, similarity, artist)
        #[arg(long)]
        layer: Option<String>,

        /// Number of results
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,

        /// Neighborhood expansion depth
        #[arg(long)]
        depth: Option<usize>,
    },

    /// Find a path between two nodes across allowed layers
    Path {
        /// Source node ("track:1", "user:5", ...)
        src: String,

        /// Destination node
        dst: String,

        /// Maximum number of hops
        #[arg(long, default_value = "5")]
        max_hops: usize,

        /// Comma-separated allowed layers (default: all)
        #[arg(long)]
        layers: Option<String>,
    },

    /// Cross-layer track recommendations
    Recommend {
        /// Seed track id
        track_id: i64,

        /// Number of results
        #[arg(short = 'n', long, default_value = "15")]
        limit: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load config file (optional, defaults if missing) and fail fast on
    // invalid settings before touching the network.
    let mut config = soundgraph::config::AppConfig::load();
    config.validate().context("Invalid configuration")?;

    // Resolve database path: CLI > config > XDG default
    let db_path = cli
        .db_path
        .or(config.db_path.clone())
        .unwrap_or_else(soundgraph::config::default_db_path);
    log::info!("Database: {}", db_path.display());

    let store = Store::open(&db_path).context("Failed to open entity store")?;

    match cli.command {
        Commands::Harvest {
            seed,
            jobs,
            ttl_hours,
            max_users,
        } => {
            if let Some(ttl) = ttl_hours {
                config.harvest.fresh_ttl_hours = ttl;
            }
            if let Some(max) = max_users {
                config.harvest.max_users_per_track = max;
            }
            config.validate().context("Invalid configuration")?;

            let workers = if jobs > 0 { jobs } else { config.resolve_workers() };
            let api = Arc::new(HttpApi::from_env(&config.api.base_url));
            let fetcher = Fetcher::new(api, &config.api);

            let cancel = CancelToken::new();
            let handler_token = cancel.clone();
            ctrlc::set_handler(move || {
                log::warn!("cancellation requested, finishing in-flight fetches");
                handler_token.cancel();
            })
            .context("Failed to install Ctrl-C handler")?;

            let engine = HarvestEngine::new(&fetcher, &store, &config.harvest, workers, cancel);
            let report = engine
                .run(&SeedRef::parse(&seed))
                .context("Harvest failed")?;
            print_harvest_report(&report);
        }

        Commands::Process => {
            let report = RelationshipProcessor::new(&store, &config.process)
                .run()
                .context("Relationship processing failed")?;
            println!(
                "Processing complete: {} user similarities, {} track co-occurrences, {} artist relationships",
                report.user_similarities,
                report.track_cooccurrences,
                report.artist_relationships
            );
        }

        Commands::Stats => {
            let stats = store.stats().context("Failed to read stats")?;
            println!("Entity store:");
            println!("  tracks:                {:>8}", stats.tracks);
            println!("  users:                 {:>8}", stats.users);
            println!("  playlists:             {:>8}", stats.playlists);
            println!("  playlist memberships:  {:>8}", stats.memberships);
            println!("  engagements:           {:>8}", stats.engagements);
            println!("  follows:               {:>8}", stats.follows);
            println!("Derived:");
            println!("  user similarities:     {:>8}", stats.user_similarities);
            println!("  artist relationships:  {:>8}", stats.artist_relationships);
            println!("  track co-occurrences:  {:>8}", stats.track_cooccurrences);
        }

        Commands::Neighbors {
            node,
            layer,
            limit,
            depth,
        } => {
            let key = parse_node(&node)?;
            let layer_filter = match layer.as_deref() {
                Some(name) => Some(
                    Layer::parse(name)
                        .with_context(|| format!("Unknown layer \"{name}\""))?,
                ),
                None => None,
            };
            if let Some(depth) = depth {
                config.graph.max_depth = depth;
            }

            let view = GraphView::build(&store, key, &config.graph)
                .context("Failed to build graph view")?;
            let neighbors = view.neighbors(key, layer_filter, limit);
            if neighbors.is_empty() {
                println!("No neighbors found for {key}.");
                return Ok(());
            }

            println!("{:<14} {:<12} {:>8}  target", "layer", "relation", "weight");
            println!("{}", "-".repeat(60));
            for n in &neighbors {
                println!(
                    "{:<14} {:<12} {:>8.3}  {} ({})",
                    n.layer.name(),
                    n.relation,
                    n.weight,
                    n.key,
                    n.label
                );
            }
        }

        Commands::Path {
            src,
            dst,
            max_hops,
            layers,
        } => {
            let src_key = parse_node(&src)?;
            let dst_key = parse_node(&dst)?;
            let allowed: Vec<Layer> = match layers.as_deref() {
                Some(list) => list
                    .split(',')
                    .map(|name| {
                        Layer::parse(name)
                            .with_context(|| format!("Unknown layer \"{name}\""))
                    })
                    .collect::<Result<_>>()?,
                None => Layer::ALL.to_vec(),
            };

            // The view is seeded at the source so the searched
            // neighborhood matches the harvest's reachable set.
            config.graph.max_depth = config.graph.max_depth.max(max_hops);
            let view = GraphView::build(&store, src_key, &config.graph)
                .context("Failed to build graph view")?;

            match view.path(src_key, dst_key, max_hops, &allowed) {
                Some(path) => {
                    for step in &path {
                        match step.layer {
                            None => println!("{}", step.node),
                            Some(layer) => println!("  -[{}]-> {}", layer.name(), step.node),
                        }
                    }
                }
                None => println!("no path found"),
            }
        }

        Commands::Recommend { track_id, limit } => {
            let view = GraphView::build(&store, NodeKey::Track(track_id), &config.graph)
                .context("Failed to build graph view")?;
            let recommendations = view
                .cross_layer_recommendation(track_id, limit)
                .context("Recommendation failed")?;

            if recommendations.is_empty() {
                println!("No recommendations. Run `soundgraph process` after harvesting.");
                return Ok(());
            }

            println!("{:<10} {:>7}  title", "track", "score");
            println!("{}", "-".repeat(50));
            for rec in &recommendations {
                println!("{:<10} {:>7.3}  {}", rec.track_id, rec.score, rec.title);
            }
        }
    }

    Ok(())
}

fn parse_node(input: &str) -> Result<NodeKey> {
    NodeKey::parse(input).with_context(|| {
        format!("Invalid node \"{input}\" (expected track:ID, user:ID, artist:ID, or a track id)")
    })
}

fn print_harvest_report(report: &HarvestReport) {
    println!();
    println!("Harvest of track {} complete:", report.seed_track_id);
    println!("  {:<16} {:>8} {:>8} {:>8}", "phase", "written", "failed", "skipped");
    println!("  {}", "-".repeat(44));
    for (phase, outcome) in &report.phases {
        println!(
            "  {:<16} {:>8} {:>8} {:>8}",
            phase.name(),
            outcome.written,
            outcome.failures,
            outcome.skipped
        );
    }
    println!(
        "Totals: {} written, {} failed",
        report.total_written(),
        report.total_failures()
    );
    if report.cancelled {
        println!("(cancelled — already-written entities remain valid; re-run to resume)");
    }
}
