use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use objstore::storage::remote::OfflineProvider;
use objstore::{
    build_object_store, AppConfig, AssignmentLedger, DatasetId, DirRole, ObjectParams,
    StoreContext,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "objstore")]
#[command(about = "Dataset object store", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to $OBJSTORE_CONFIG, then ~/.config/objstore/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Seed for distributed placement
    #[arg(long, global = true)]
    seed: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check whether a dataset exists
    Exists {
        id: u64,

        #[command(flatten)]
        target: Target,
    },

    /// Print a dataset's size in bytes
    Size {
        id: u64,

        #[command(flatten)]
        target: Target,
    },

    /// Write a dataset's bytes to stdout
    Cat {
        id: u64,

        /// First byte to read
        #[arg(long, default_value_t = 0)]
        start: u64,

        /// Number of bytes to read (to the end when omitted)
        #[arg(long)]
        count: Option<u64>,

        #[command(flatten)]
        target: Target,
    },

    /// Print a local path for a dataset
    Path {
        id: u64,

        #[command(flatten)]
        target: Target,
    },

    /// Store a file as a dataset
    Put {
        id: u64,

        /// File to copy from
        file: PathBuf,

        /// Create the dataset first
        #[arg(long)]
        create: bool,

        #[command(flatten)]
        target: Target,
    },

    /// Delete a dataset
    Delete {
        id: u64,

        #[command(flatten)]
        target: Target,
    },

    /// Print the store usage percentage
    Usage,

    /// Print the configuration and recorded assignments as JSON
    Describe,
}

/// Location within a dataset's storage
#[derive(Args, Debug, Default)]
struct Target {
    /// Role directory to address instead of the main files path
    #[arg(long, value_parser = parse_role)]
    base_dir: Option<DirRole>,

    /// Extra directory below the dataset's hashed directory
    #[arg(long)]
    extra_dir: Option<String>,

    /// Put the extra directory above the hashed directories
    #[arg(long)]
    extra_dir_at_root: bool,

    /// File name to use instead of dataset_<id>.dat
    #[arg(long)]
    alt_name: Option<String>,

    /// Address the directory instead of a file
    #[arg(long)]
    dir_only: bool,

    /// Add a per-dataset directory
    #[arg(long)]
    obj_dir: bool,

    /// With --extra-dir, delete the whole extra directory
    #[arg(long)]
    entire_extra_files_dir: bool,
}

impl From<Target> for ObjectParams {
    fn from(target: Target) -> Self {
        ObjectParams {
            base_dir: target.base_dir,
            extra_dir: target.extra_dir,
            extra_dir_at_root: target.extra_dir_at_root,
            alt_name: target.alt_name,
            dir_only: target.dir_only,
            obj_dir: target.obj_dir,
            entire_extra_files_dir: target.entire_extra_files_dir,
        }
    }
}

fn parse_role(value: &str) -> std::result::Result<DirRole, String> {
    DirRole::ALL
        .into_iter()
        .find(|role| role.as_str() == value)
        .ok_or_else(|| {
            let known: Vec<&str> = DirRole::ALL.iter().map(|role| role.as_str()).collect();
            format!("unknown role '{}', expected one of {}", value, known.join(", "))
        })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::from_file(path).await?,
        None => AppConfig::load().await?,
    };

    let ledger = AssignmentLedger::open(&config.assignments_db_path()).await?;
    let mut context = StoreContext::new(Arc::new(ledger.clone()), Arc::new(OfflineProvider));
    if let Some(seed) = cli.seed {
        context = context.with_seed(seed);
    }
    let store = build_object_store(&config.object_store, &context)
        .with_context(|| format!("Failed to build {} object store", config.object_store.type_name()))?;

    match cli.command {
        Commands::Exists { id, target } => {
            let dataset = ledger.dataset_ref(DatasetId::new(id)).await?;
            let exists = store.exists(&dataset, &target.into()).await?;
            println!("{}", exists);
        }
        Commands::Size { id, target } => {
            let dataset = ledger.dataset_ref(DatasetId::new(id)).await?;
            println!("{}", store.size(&dataset, &target.into()).await?);
        }
        Commands::Cat {
            id,
            start,
            count,
            target,
        } => {
            let dataset = ledger.dataset_ref(DatasetId::new(id)).await?;
            let data = store.get_data(&dataset, &target.into(), start, count).await?;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&data).context("Failed to write to stdout")?;
            stdout.flush()?;
        }
        Commands::Path { id, target } => {
            let dataset = ledger.dataset_ref(DatasetId::new(id)).await?;
            let path = store.get_filename(&dataset, &target.into()).await?;
            println!("{}", path.display());
        }
        Commands::Put {
            id,
            file,
            create,
            target,
        } => {
            let dataset = ledger.dataset_ref(DatasetId::new(id)).await?;
            tracing::info!("Storing {} as dataset {}", file.display(), id);
            store
                .update_from_file(&dataset, &target.into(), &file, create)
                .await?;
            if let Some(backend_id) = dataset.assigned_backend_id() {
                println!("Stored dataset {} on backend '{}'", id, backend_id);
            } else {
                println!("Stored dataset {}", id);
            }
        }
        Commands::Delete { id, target } => {
            let dataset = ledger.dataset_ref(DatasetId::new(id)).await?;
            let deleted = store.delete(&dataset, &target.into()).await?;
            println!("{}", deleted);
        }
        Commands::Usage => {
            println!("{:.1}", store.get_store_usage_percent().await?);
        }
        Commands::Describe => {
            let assignments: serde_json::Map<String, serde_json::Value> = ledger
                .counts_by_backend()
                .await?
                .into_iter()
                .map(|(backend_id, count)| (backend_id, count.into()))
                .collect();
            let description = serde_json::json!({
                "type": store.backend_type(),
                "assignments_db": config.assignments_db_path(),
                "assignments": assignments,
                "object_store": config.object_store,
            });
            println!("{}", serde_json::to_string_pretty(&description)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        // Test that CLI parsing works
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_cat_range() {
        let cli = Cli::try_parse_from([
            "objstore", "--config", "store.toml", "cat", "42", "--start", "1", "--count", "6",
        ])
        .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("store.toml")));
        match cli.command {
            Commands::Cat { id, start, count, .. } => {
                assert_eq!((id, start, count), (42, 1, Some(6)));
            }
            _ => panic!("expected cat"),
        }
    }

    #[test]
    fn test_parse_target_params() {
        let cli = Cli::try_parse_from([
            "objstore", "put", "7", "out.dat", "--create", "--base-dir", "job_work", "--obj-dir",
            "--extra-dir", "dataset_7_files", "--alt-name", "a.txt",
        ])
        .unwrap();

        let Commands::Put { create, target, .. } = cli.command else {
            panic!("expected put");
        };
        assert!(create);
        let params: ObjectParams = target.into();
        assert_eq!(
            params,
            ObjectParams::new()
                .base_dir(DirRole::JobWork)
                .obj_dir()
                .extra_dir("dataset_7_files")
                .alt_name("a.txt")
        );
    }

    #[test]
    fn test_rejects_unknown_role() {
        assert!(parse_role("scratch").is_err());
        assert!(Cli::try_parse_from(["objstore", "exists", "1", "--base-dir", "scratch"]).is_err());
    }
}
