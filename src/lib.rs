pub mod classify;
pub mod config;
pub mod credential;
pub mod enrich;
pub mod export;
pub mod group;
pub mod io;
pub mod pipeline;
pub mod probe;
pub mod report;
pub mod resolve;
pub mod store;

pub mod prelude {
    pub use crate::config::PipelineConfig;
    pub use crate::credential::{CredentialRecord, OutputRecord};
    pub use crate::pipeline::{Pipeline, RunSummary};
    pub use crate::store::{RecordFilter, RecordStore, SqliteStore};
}
