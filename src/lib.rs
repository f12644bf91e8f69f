//! # medcorpus
//!
//! A batch pipeline that turns remote archives of medical articles (JATS
//! XML) into a searchable, vector-indexed corpus.
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────────┐   ┌──────────┐
//! │  fetch   │──▶│ extract  │──▶│  locate  │──▶│   process    │──▶│   load   │
//! │ S3/local │   │ tar.gz   │   │  *.xml   │   │ batch × pool │   │  SQLite  │
//! └──────────┘   └──────────┘   └──────────┘   └──────────────┘   └──────────┘
//!  downloads/     extracted/                    processed_data/    chroma_db/
//!                                               processing_log.txt
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Data flowing between stages |
//! | [`remote`] | Object store trait and local-directory store |
//! | [`remote_s3`] | S3-compatible store (SigV4) |
//! | [`fetch`] | Archive fetcher |
//! | [`archive`] | Archive extractor |
//! | [`locate`] | Document locator |
//! | [`partition`] | XML element partitioner |
//! | [`transform`] | Document transformer |
//! | [`batch`] | Batch coordinator |
//! | [`progress`] | Batch progress reporting |
//! | [`embedding`] | Embedding providers |
//! | [`store`] | SQLite corpus store |
//! | [`load`] | Corpus loader |
//! | [`query`] | Similarity search |
//! | [`stats`] | Pipeline status |
//! | [`pipeline`] | End-to-end run |

pub mod archive;
pub mod batch;
pub mod config;
pub mod embedding;
pub mod fetch;
pub mod load;
pub mod locate;
pub mod models;
pub mod partition;
pub mod pipeline;
pub mod progress;
pub mod query;
pub mod remote;
pub mod remote_s3;
pub mod stats;
pub mod store;
pub mod transform;
