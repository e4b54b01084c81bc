//! Row models for the collector store
//!
//! Ids are UUIDs persisted as TEXT. Metadata and source configs are JSON
//! persisted as TEXT.

mod article;
mod comment;
mod source;

pub use article::Article;
pub use comment::Comment;
pub use source::{NewSource, ScheduleEntry, Source, SourceStatus, SourceType};
