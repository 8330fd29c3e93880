//! Security news aggregation: proxied feed fetching, content sanitization,
//! keyword search and a persistent watchlist.

pub mod config;
pub mod feed;
pub mod search;
pub mod storage;
pub mod util;
pub mod watchlist;
