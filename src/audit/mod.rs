//! Access logger: the decision stream and the administrative activity stream.

pub mod entries;
pub mod logger;
pub mod query;
