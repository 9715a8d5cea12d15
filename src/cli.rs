use clap::{Parser, Subcommand};
use serde::Serialize;

use crate::{
    app::{AppContext, AppFactory, AppPaths},
    config::Config,
    eid::Eid,
    rows::{EntityKind, RowCreate, RowUpdate},
    semantic::ModelDescriptor,
    store::{LocalStore, StoreCounts},
};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start nodesearch as a service.
    Daemon {},

    /// Add a row
    Add {
        /// node or actor
        #[clap(short, long)]
        kind: EntityKind,

        /// Type within the kind, e.g. product or collection
        #[clap(short = 'g', long)]
        type_tag: Option<String>,

        #[clap(short, long)]
        title: String,

        #[clap(short, long)]
        description: Option<String>,
    },

    /// Update a row
    Update {
        id: Eid,

        #[clap(short = 'g', long)]
        type_tag: Option<String>,

        #[clap(short, long)]
        title: Option<String>,

        #[clap(short, long)]
        description: Option<String>,
    },

    /// Print a row
    Show { id: Eid },

    /// Delete a row
    Delete { id: Eid },

    /// Semantic search. Waits for the embedding model.
    Search {
        query: String,

        /// Number of results
        #[clap(short, long)]
        k: Option<usize>,
    },

    /// Embed rows that have no vector yet. Waits for the embedding model.
    Sweep {},

    /// Print model, indexing and store status
    Status {},

    /// Drop every stored vector and index again
    Reindex {},
}

pub async fn run(command: Command, paths: AppPaths) -> anyhow::Result<()> {
    match command {
        Command::Daemon {} => anyhow::bail!("daemon runs on its own runtime"),

        Command::Search { .. } | Command::Sweep {} | Command::Reindex {} => {
            let app = AppFactory::create_context(&paths)?;
            let result = run_semantic(&app, command).await;
            app.shutdown();
            result
        }

        command => {
            let (config, store) = AppFactory::open_store(&paths)?;
            run_rows(&config, &store, command)
        }
    }
}

/// Row and status commands. They never load the embedding model.
fn run_rows(config: &Config, store: &LocalStore, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Add {
            kind,
            type_tag,
            title,
            description,
        } => {
            if title.trim().is_empty() {
                anyhow::bail!("title must not be empty");
            }

            let row = store.create(RowCreate {
                kind,
                type_tag,
                title,
                description,
            })?;
            println!("{}", serde_json::to_string_pretty(&row)?);
        }

        Command::Update {
            id,
            type_tag,
            title,
            description,
        } => {
            let update = RowUpdate {
                type_tag,
                title,
                description,
            };
            if update.is_empty() {
                anyhow::bail!("nothing to update");
            }

            let row = store.update(&id, update)?;
            println!("{}", serde_json::to_string_pretty(&row)?);
        }

        Command::Show { id } => {
            let row = store.get(&id)?;
            println!("{}", serde_json::to_string_pretty(&row)?);
        }

        Command::Delete { id } => {
            store.delete(&id)?;
            println!("deleted {id}");
        }

        Command::Status {} => {
            let status = StoreStatus {
                model: ModelDescriptor::new(
                    &config.semantic_search.model,
                    config.semantic_search.cache_key,
                ),
                store: store.counts()?,
            };
            println!("{}", serde_json::to_string_pretty(&status)?);
        }

        other => anyhow::bail!("{other:?} needs the embedding model"),
    }

    Ok(())
}

/// Configured model and row counts. Model readiness is only known to a
/// running daemon, see `GET /api/status`.
#[derive(Debug, Serialize)]
struct StoreStatus {
    model: ModelDescriptor,
    store: StoreCounts,
}

async fn run_semantic(app: &AppContext, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Search { query, k } => {
            wait_for_model(app).await?;

            let search = app.search();
            let k = k.unwrap_or_else(|| search.default_limit());
            let results = search.search_latest(&query, k).await.unwrap_or_default();

            if results.is_empty() {
                println!("nothing found");
            }
            for result in results {
                println!(
                    "{}  {}  [{} {}]  {}",
                    result.display_similarity(),
                    result.id,
                    result.kind,
                    result.type_tag,
                    result.title
                );
            }
        }

        Command::Sweep {} => {
            wait_for_model(app).await?;

            let report = app.sweeper().sweep().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Command::Reindex {} => {
            let cleared = app.store().clear_vectors()?;
            log::info!("cleared {cleared} vectors");

            wait_for_model(app).await?;

            // one batch per kind per sweep
            while let Some(report) = app.sweeper().sweep().await {
                if report.processed == 0 {
                    break;
                }
            }
            println!("{}", serde_json::to_string_pretty(&app.status()?)?);
        }

        other => anyhow::bail!("{other:?} does not use the embedding model"),
    }

    Ok(())
}

async fn wait_for_model(app: &AppContext) -> anyhow::Result<()> {
    log::info!("waiting for embedding model");
    let state = app.wait_for_model().await;

    if !state.is_ready {
        anyhow::bail!(
            "embedding model unavailable: {}",
            state.last_error.unwrap_or_else(|| "unknown error".to_string())
        );
    }
    Ok(())
}
