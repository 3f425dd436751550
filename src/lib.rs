// Dedup Store - Core Library
// Deduplicating persistence: equal values share one row, collections are found by hash,
// bulk loads resolve thousands of values through a staging table.

pub mod error;
pub mod gateway;
pub mod criteria;
pub mod db;
pub mod entities;
pub mod hasher;
pub mod resolver;
pub mod bulk;
pub mod config;

// Re-export commonly used types
pub use error::{DedupError, Result};
pub use gateway::{unit_of_work, Id, SqlValue, SqliteGateway, StorageGateway};
pub use criteria::Criteria;
pub use db::{
    BulkJob, Change,
    setup_database, save_change, get_change,
    begin_job, end_job, orphaned_jobs, reclaim_job, row_count,
};
pub use entities::{
    Evolvable, Lifecycle, Persistable,
    ProteinSequence, ProteinSequenceList, SequenceBulkAdapter,
    ProteinAccnum, ProteinAccnumSet, AccnumBulkAdapter,
    ProteinDescription, DescriptionBulkAdapter,
    Curation,
};
pub use hasher::{calculate_hash, CollectionSchema, HashedCollection};
pub use resolver::EqualityResolver;
pub use bulk::{
    BulkAdapter, BulkLoader, CollectionBulkAdapter, LoadOutcome, LoadStats, MemberStaging,
    StagingRow, BATCH_SIZE,
};
pub use config::{LoaderConfig, StoreConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Staging tables the bulk loaders write to.
pub const STAGING_TABLES: &[&str] = &[
    "temp_protein_sequence",
    "temp_protein_accnum",
    "temp_protein_description",
    "temp_hashed_set",
    "temp_hashed_set_member",
];
