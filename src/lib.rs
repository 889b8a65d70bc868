pub mod catalog;
pub mod codec;
pub mod config;
pub mod error;
pub mod inference;
pub mod query;
pub mod store;
pub mod transfer;

// Re-export the types most callers need
pub use catalog::{CatalogClient, ColumnInfo, TypeCatalog, TypeCatalogCache};
pub use codec::{parse_row, read_header, write_row, Preview, Row};
pub use config::{resolve_delimiter_token, ConnectionConfig, Credential, Delimiter};
pub use error::{BridgeError, Result};
pub use query::{
    build_create_table, build_projection, JoinCondition, JoinKind, JoinSpec, ProjectionQuery,
};
pub use store::{HttpTransport, StoreTransport};
pub use transfer::{
    export, export_rows, export_to_path, import, preview, ExportRequest, ExportSummary, ImportMode,
    ImportOptions, ImportStrategy, ImportSummary, RowVisitor,
};
