//! Reference HTTP provider adapters.
//!
//! These implement [`crate::providers::IntelSource`] against two
//! common styles of intelligence API (an IP abuse tracker and a
//! multi-engine analyzer). The core never depends on their wire
//! shapes; they exist to exercise the plugin boundary.

pub mod abuse_feed;
pub mod hash_analyzer;

pub use abuse_feed::AbuseFeedSource;
pub use hash_analyzer::HashAnalyzerSource;
