use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tablebridge::codec::preview_source;
use tablebridge::inference::infer_column_types;
use tablebridge::transfer::DEFAULT_PREVIEW_LIMIT;
use tablebridge::{
    export_to_path, import, preview, CatalogClient, ConnectionConfig, Delimiter, ExportRequest,
    ImportOptions, ImportStrategy, JoinSpec, ProjectionQuery,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tablebridge")]
#[command(about = "Move delimited text in and out of ClickHouse tables")]
struct Args {
    /// Field delimiter; a character or an escape such as \t (default: CLICKHOUSE_DELIMITER or ,)
    #[arg(short, long, global = true)]
    delimiter: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show a local file's header, first rows and suggested column types
    Inspect {
        file: PathBuf,

        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },

    #[command(flatten)]
    Remote(RemoteCommand),
}

/// Commands that talk to the store.
#[derive(Subcommand)]
enum RemoteCommand {
    /// List tables in the configured database
    Tables,

    /// List a table's columns and types
    Columns { table: String },

    /// List types a new column can have
    Types,

    /// Show the first rows of a projection
    Preview {
        table: String,

        #[arg(short, long, value_delimiter = ',', required = true)]
        columns: Vec<String>,

        /// KIND:TABLE[ ALIAS]:CONDITION, repeatable
        #[arg(short, long = "join")]
        joins: Vec<String>,

        #[arg(short, long, default_value_t = DEFAULT_PREVIEW_LIMIT)]
        limit: usize,
    },

    /// Export a projection to a file
    Export {
        table: String,

        #[arg(short, long, value_delimiter = ',', required = true)]
        columns: Vec<String>,

        /// KIND:TABLE[ ALIAS]:CONDITION, repeatable
        #[arg(short, long = "join")]
        joins: Vec<String>,

        #[arg(short, long)]
        output: PathBuf,
    },

    /// Import a local file into a table, creating it if needed
    Import {
        table: String,

        file: PathBuf,

        /// Source columns to import (default: all, in file order)
        #[arg(short, long, value_delimiter = ',')]
        columns: Vec<String>,

        /// COLUMN=TYPE for a created table, repeatable
        #[arg(short = 't', long = "type")]
        types: Vec<String>,

        /// Use INSERT ... VALUES batches instead of the bulk-insert channel
        #[arg(long)]
        batched: bool,

        #[arg(long, default_value_t = 1000)]
        batch_size: usize,

        /// Fail instead of creating a missing table
        #[arg(long)]
        no_create: bool,
    },
}

fn projection(table: String, columns: Vec<String>, joins: &[String]) -> Result<ExportRequest> {
    let joins = joins
        .iter()
        .map(|raw| JoinSpec::parse_cli(raw))
        .collect::<tablebridge::Result<Vec<_>>>()?;
    Ok(ProjectionQuery::new(table, columns).with_joins(joins).into())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tablebridge=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = ConnectionConfig::from_env().context("loading connection settings")?;
    let delimiter = match &args.delimiter {
        Some(raw) => Delimiter::parse(raw)?,
        None => config.delimiter,
    };

    let command = match args.command {
        Command::Inspect { file, limit } => {
            let source = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("opening {}", file.display()))?;
            let preview = preview_source(source, delimiter, limit).await?;
            let types = infer_column_types(&preview.headers, &preview.rows);
            return print_json(&serde_json::json!({ "preview": preview, "suggested_types": types }));
        }
        Command::Remote(command) => command,
    };

    let client = CatalogClient::connect(&config).await?;
    info!("Connected to {}", client.target());

    match command {
        RemoteCommand::Tables => {
            for table in client.list_tables().await? {
                println!("{}", table);
            }
        }
        RemoteCommand::Columns { table } => {
            for column in client.list_columns(&table).await? {
                println!("{}\t{}", column.name, column.column_type);
            }
        }
        RemoteCommand::Types => {
            for name in client.list_creatable_types().await?.names() {
                println!("{}", name);
            }
        }
        RemoteCommand::Preview {
            table,
            columns,
            joins,
            limit,
        } => {
            let request = projection(table, columns, &joins)?;
            print_json(&preview(&client, &request, delimiter, limit).await?)?;
        }
        RemoteCommand::Export {
            table,
            columns,
            joins,
            output,
        } => {
            let request = projection(table, columns, &joins)?;
            let summary = export_to_path(&client, &request, delimiter, &output).await?;
            info!("Wrote {} rows to {}", summary.rows, output.display());
            print_json(&summary)?;
        }
        RemoteCommand::Import {
            table,
            file,
            columns,
            types,
            batched,
            batch_size,
            no_create,
        } => {
            let mut options = ImportOptions::default().with_batch_size(batch_size);
            if !columns.is_empty() {
                options = options.with_columns(columns);
            }
            for pair in &types {
                let Some((column, column_type)) = pair.split_once('=') else {
                    bail!("--type expects COLUMN=TYPE, got {:?}", pair);
                };
                options = options.with_type(column.trim(), column_type.trim());
            }
            if batched {
                options = options.with_strategy(ImportStrategy::BatchedSql);
            }
            if no_create {
                options = options.without_table_creation();
            }

            let source = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("opening {}", file.display()))?;
            let summary = import(&client, &table, source, delimiter, options).await?;
            print_json(&summary)?;
        }
    }

    Ok(())
}
