use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use normandy_api::JsonFileSource;
use normandy_core::{categorize_recipes, CategorizedRecipe, Revision, BUCKET_COUNT};
use normandy_namespaces::NamespaceCoordinator;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "normandyctl", version, about = "Inspect recipe namespaces and bucket allocation")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// JSON dump of recipes (array or API page with `results`)
    #[arg(long = "recipes", global = true, env = "NORMANDY_RECIPES")]
    recipes: Option<PathBuf>,

    /// Environment name used to key cached fetches
    #[arg(long = "env", global = true, env = "NORMANDY_ENV", default_value = "local")]
    env: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Group recipes by sampling-filter validity, sorted by bucket range
    Categorize,
    /// List every namespace referenced by a sampling filter
    Namespaces,
    /// Show occupied bucket ranges of a namespace
    Occupancy {
        namespace: String,
    },
    /// Find the lowest free run of buckets in a namespace
    FindSpace {
        namespace: String,
        size: u32,
    },
    /// Resolve auto-bucketed namespace samples of a revision draft (JSON file)
    Resolve {
        draft: PathBuf,
    },
}

fn init_tracing() {
    let env = std::env::var("NORMANDY_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("NORMANDY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid NORMANDY_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_source(path: Option<&PathBuf>) -> Result<JsonFileSource> {
    let path = path.context("no recipe dump given; pass --recipes or set NORMANDY_RECIPES")?;
    JsonFileSource::open(path)
}

fn print_group(title: &str, entries: &[CategorizedRecipe<'_>]) {
    println!("{} ({})", title, entries.len());
    for e in entries {
        let range = match e.bucket_range {
            Some((start, end)) => format!("[{:>5}, {:>5}]", start, end),
            None => "       -      ".to_string(),
        };
        let name = &e.recipe.latest_revision.name;
        match &e.err {
            Some(err) => println!("  {} #{:<6} {} • {}", range, e.recipe.id, name, err),
            None => println!("  {} #{:<6} {}", range, e.recipe.id, name),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let t0 = Instant::now();

    match cli.command {
        Commands::Categorize => {
            let source = load_source(cli.recipes.as_ref())?;
            let categorized = categorize_recipes(source.recipes());
            info!(
                ok = categorized.ok.len(),
                backwards = categorized.backwards.len(),
                error = categorized.error.len(),
                "categorize done"
            );
            match cli.output {
                Output::Human => {
                    print_group("OK", &categorized.ok);
                    print_group("BACKWARDS", &categorized.backwards);
                    print_group("ERROR", &categorized.error);
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&categorized)?),
            }
        }
        Commands::Namespaces => {
            let coordinator = NamespaceCoordinator::new(cli.env.clone(), Arc::new(load_source(cli.recipes.as_ref())?));
            coordinator.refresh_all_namespace_names().await?;
            let names = coordinator.namespaces();
            match cli.output {
                Output::Human => {
                    for name in &names {
                        println!("{}", name);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&names)?),
            }
        }
        Commands::Occupancy { namespace } => {
            let coordinator = NamespaceCoordinator::new(cli.env.clone(), Arc::new(load_source(cli.recipes.as_ref())?));
            coordinator.refresh(&namespace).await?;
            let summary = coordinator.find_occupied_buckets(&namespace).summary(&namespace);
            match cli.output {
                Output::Human => {
                    println!("{} • {} occupied • {} free", summary.namespace, summary.occupied, summary.free);
                    for (start, end) in &summary.ranges {
                        println!("  [{:>5}, {:>5})  {}", start, end, end - start);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
            }
        }
        Commands::FindSpace { namespace, size } => {
            if size > BUCKET_COUNT {
                bail!("size {} exceeds the {} bucket space", size, BUCKET_COUNT);
            }
            let coordinator = NamespaceCoordinator::new(cli.env.clone(), Arc::new(load_source(cli.recipes.as_ref())?));
            let found = coordinator.find_space_in_namespace(&namespace, size).await?;
            match cli.output {
                Output::Human => match found {
                    Some(start) => println!("{} • [{}, {})", namespace, start, start + size),
                    None => println!("{} • no free run of {} buckets", namespace, size),
                },
                Output::Json => println!("{}", serde_json::json!({ "namespace": namespace, "size": size, "start": found })),
            }
        }
        Commands::Resolve { draft } => {
            let coordinator = NamespaceCoordinator::new(cli.env.clone(), Arc::new(load_source(cli.recipes.as_ref())?));
            let bytes = std::fs::read(&draft).with_context(|| format!("reading draft {}", draft.display()))?;
            let mut revision: Revision = serde_json::from_slice(&bytes).with_context(|| format!("parsing draft {}", draft.display()))?;
            if let Err(e) = coordinator.resolve_auto_bucketing(&mut revision).await {
                error!(error = %e, "resolve failed; draft left unchanged");
                return Err(e.into());
            }
            // Drafts are always written as JSON; `--output` only affects listings.
            println!("{}", serde_json::to_string_pretty(&revision)?);
        }
    }
    info!(took_ms = %t0.elapsed().as_millis(), "done");
    Ok(())
}
