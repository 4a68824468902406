//! wxdl core - metadata extraction, profile store and content rewriting.
//!
//! This crate holds the synchronous half of the interception pipeline. It has
//! no knowledge of the proxy engine: it turns JSON payloads into profile
//! records, folds them into a [`ProfileStore`], and rewrites page and script
//! bodies.
//!
//! ## Modules
//!
//! - [`profile`]: `Profile`/`Video` records and the first-non-empty-wins merge
//! - [`extractor`]: payload classification, field-mapping tables, ingestion
//! - [`store`]: mutex-guarded profile table with write-through persistence
//! - [`rewriter`]: cache busting, bootstrap injection and script patch rules

pub mod error;
pub mod extractor;
pub mod profile;
pub mod rewriter;
pub mod store;

pub use error::{Result, StoreError};
pub use extractor::{extract, Extracted, MetadataExtractor, PayloadKind, SourceUrl};
pub use profile::{Profile, Video};
pub use rewriter::{ContentRewriter, PatchOutcome, PatchRule, Rewrite, ScriptTarget, ASSET_VERSION};
pub use store::{sanitize_identifier, ProfileStore, ProfileWriter, Upsert};
