use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use futures::TryStreamExt;
use mongodb::bson::{Bson, Document};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

use airbnb_madrid::adapters::memory::MemoryStore;
use airbnb_madrid::adapters::mongo::MongoStore;
use airbnb_madrid::bootstrap::{BootstrapOptions, bootstrap, create_indexes};
use airbnb_madrid::config::load_config_with_env;
use airbnb_madrid::config::types::{Backend, Config, DatabaseConfig};
use airbnb_madrid::domain::analytics::{price_stats_pipeline, room_type_count_pipeline};
use airbnb_madrid::domain::filter::Filter;
use airbnb_madrid::domain::pipeline::{Pipeline, parse_sort};
use airbnb_madrid::domain::projection::Projection;
use airbnb_madrid::domain::query::FindQuery;
use airbnb_madrid::domain::value::parse_json_document;
use airbnb_madrid::import::{ImportOptions, Importer};
use airbnb_madrid::ports::listing_store::ListingStore;
use airbnb_madrid::repository::ListingRepository;

#[derive(Parser, Debug)]
#[command(
    name = "airbnb-madrid",
    version,
    about = "Load Airbnb Madrid listings into MongoDB and query them"
)]
struct Cli {
    /// Path to config.yaml (defaults to ./config.yaml or next to the binary)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check the database answers
    Ping,
    /// Create the app user, the validated collection and the indexes
    Bootstrap,
    /// Import an Inside Airbnb listings CSV
    Import(ImportArgs),
    /// Import a JSON array of listing documents
    ImportJson {
        file: PathBuf,
        /// Remove existing listings first
        #[arg(long)]
        clear: bool,
    },
    /// Print collection statistics
    Stats,
    /// Print matching listings, one JSON document per line
    Find {
        /// Filter as JSON, e.g. '{"price": {"$lt": 100}}'
        #[arg(long)]
        filter: Option<String>,
        /// Sort as JSON, e.g. '{"price": -1}'
        #[arg(long)]
        sort: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: u64,
        /// Projection as JSON, e.g. '{"name": 1, "price": 1}'
        #[arg(long)]
        projection: Option<String>,
    },
    /// Count matching listings
    Count {
        #[arg(long)]
        filter: Option<String>,
    },
    /// Distinct values of a field
    Distinct {
        field: String,
        #[arg(long)]
        filter: Option<String>,
    },
    /// Run an aggregation and write the result as a JSON array
    Export(ExportArgs),
}

#[derive(Parser, Debug)]
struct ImportArgs {
    file: PathBuf,
    /// Import a random sample of this many rows (0 = all)
    #[arg(long)]
    sample: Option<usize>,
    /// Keep every CSV column instead of the standard set
    #[arg(long)]
    keep_all: bool,
    /// Add to the existing listings instead of replacing them
    #[arg(long)]
    append: bool,
    #[arg(long)]
    batch_size: Option<usize>,
    /// Target collection (overrides config)
    #[arg(long)]
    collection: Option<String>,
}

#[derive(Parser, Debug)]
struct ExportArgs {
    out: PathBuf,
    /// Pipeline as a JSON array, or a path to a file holding one
    #[arg(long, conflicts_with = "preset")]
    pipeline: Option<String>,
    #[arg(long, value_enum)]
    preset: Option<Preset>,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum Preset {
    PriceByNeighbourhood,
    RoomTypes,
}

fn find_config_path() -> PathBuf {
    let candidates = [
        PathBuf::from("config.yaml"),
        dirs_next().join("config.yaml"),
    ];

    for path in &candidates {
        if path.exists() {
            return path.clone();
        }
    }

    candidates[0].clone()
}

fn dirs_next() -> PathBuf {
    // Look in the directory where the binary is
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Plain-text subscriber; `RUST_LOG` wins over `level`.
fn log_subscriber<W>(level: &str, writer: W) -> impl tracing::Subscriber + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(writer)
        .with_ansi(false)
        .finish()
}

async fn open_store(config: &DatabaseConfig) -> Result<Arc<dyn ListingStore>> {
    Ok(match config.backend {
        Backend::Mongodb => Arc::new(MongoStore::connect(config).await?),
        Backend::Memory => {
            tracing::warn!("Using the in-memory backend; nothing is persisted");
            Arc::new(MemoryStore::new(&config.name, &config.collection))
        }
    })
}

fn parse_filter(raw: Option<&str>) -> Result<Filter> {
    match raw {
        Some(text) => Filter::from_json(text).context("invalid --filter"),
        None => Ok(Filter::all()),
    }
}

fn to_json(doc: Document) -> serde_json::Value {
    Bson::Document(doc).into_relaxed_extjson()
}

fn load_pipeline(args: &ExportArgs) -> Result<Pipeline> {
    match (args.preset, args.pipeline.as_deref()) {
        (Some(Preset::PriceByNeighbourhood), _) => Ok(price_stats_pipeline()),
        (Some(Preset::RoomTypes), _) => Ok(room_type_count_pipeline()),
        (None, Some(raw)) if raw.trim_start().starts_with('[') => {
            Pipeline::from_json(raw).context("invalid --pipeline")
        }
        (None, Some(path)) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read pipeline file {path}"))?;
            Pipeline::from_json(&text).with_context(|| format!("invalid pipeline in {path}"))
        }
        (None, None) => bail!("export needs --pipeline or --preset"),
    }
}

async fn run(command: Command, config: &Config, store: Arc<dyn ListingStore>) -> Result<()> {
    let repository = ListingRepository::new(Arc::clone(&store))
        .with_timestamps(config.database.record_timestamps);

    match command {
        Command::Ping => {
            repository.ping().await?;
            println!("OK");
        }
        Command::Bootstrap => {
            let options = BootstrapOptions {
                app_user: config.database.app_user.clone(),
            };
            let report = bootstrap(store.as_ref(), &options).await?;
            println!("{report}");
        }
        Command::Import(args) => {
            let mut options = ImportOptions::from(&config.import);
            options.show_progress = true;
            options.clear_existing = !args.append;
            options.keep_all_columns |= args.keep_all;
            if let Some(sample) = args.sample {
                options.sample_size = sample;
            }
            if let Some(batch_size) = args.batch_size {
                options.batch_size = batch_size;
            }
            let report = Importer::new(repository.clone(), options)
                .import_csv(&args.file)
                .await?;
            println!("{report}");
            let indexes = create_indexes(store.as_ref()).await?;
            tracing::info!("{} indexes created after import", indexes.created.len());
            println!("{}", repository.collection_stats().await?);
        }
        Command::ImportJson { file, clear } => {
            let options = ImportOptions {
                clear_existing: clear,
                ..ImportOptions::from(&config.import)
            };
            let report = Importer::new(repository.clone(), options)
                .import_json(&file)
                .await?;
            println!("{report}");
            create_indexes(store.as_ref()).await?;
        }
        Command::Stats => {
            println!("{}", repository.collection_stats().await?);
            for row in repository.count_by_room_type().await? {
                println!("  {row}");
            }
        }
        Command::Find {
            filter,
            sort,
            limit,
            projection,
        } => {
            let mut query = FindQuery::new(parse_filter(filter.as_deref())?).limit(limit);
            if let Some(raw) = sort {
                query.sort = parse_sort(&parse_json_document(&raw)?).context("invalid --sort")?;
            }
            if let Some(raw) = projection {
                let projection = Projection::from_document(&parse_json_document(&raw)?)
                    .context("invalid --projection")?;
                query = query.project(projection);
            }
            let mut stream = repository.find(&query).await?;
            while let Some(doc) = stream.try_next().await? {
                println!("{}", to_json(doc));
            }
        }
        Command::Count { filter } => {
            println!("{}", repository.count(&parse_filter(filter.as_deref())?).await?);
        }
        Command::Distinct { field, filter } => {
            let filter = parse_filter(filter.as_deref())?;
            for value in repository.distinct_values_matching(&field, &filter).await? {
                println!("{}", value.into_relaxed_extjson());
            }
        }
        Command::Export(args) => {
            let pipeline = load_pipeline(&args)?;
            let rows: Vec<Document> = repository.aggregate(&pipeline).await?.try_collect().await?;
            let json: Vec<serde_json::Value> = rows.into_iter().map(to_json).collect();
            let file = std::fs::File::create(&args.out)
                .with_context(|| format!("failed to create {}", args.out.display()))?;
            serde_json::to_writer_pretty(std::io::BufWriter::new(file), &json)?;
            tracing::info!("Wrote {} rows to {}", json.len(), args.out.display());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(find_config_path);
    // Config messages go through a provisional subscriber until log_level is known
    let mut config = tracing::subscriber::with_default(
        log_subscriber("info", std::io::stderr),
        || load_config_with_env(&config_path),
    )?;
    tracing::subscriber::set_global_default(log_subscriber(&config.log_level, std::io::stderr))?;

    if let Command::Import(ImportArgs {
        collection: Some(ref collection),
        ..
    }) = cli.command
    {
        config.database.collection.clone_from(collection);
    }

    let store = open_store(&config.database).await?;
    let result = run(cli.command, &config, Arc::clone(&store)).await;
    store.close().await;
    result
}
