//! Content-safety utilities for untrusted feed data.
//!
//! This module provides:
//!
//! - **Text sanitization**: markup, `javascript:` and event-handler removal
//! - **Link safety**: scheme checks and placeholder links for unsafe URLs
//! - **Feed URL validation**: SSRF guard applied before a source is ever fetched
//!
//! # Examples
//!
//! ```
//! use feedsentry::util::{create_safe_link, sanitize_text, validate_feed_url};
//!
//! assert_eq!(sanitize_text("<b>Alert</b>"), "Alert");
//!
//! let link = create_safe_link("javascript:alert(1)", "Alert");
//! assert!(!link.safe);
//!
//! assert!(validate_feed_url("http://localhost/feed").is_err());
//! ```

mod sanitize;
mod url_validator;

pub use sanitize::{
    create_safe_link, is_url_safe, sanitize_text, strip_control_chars, SafeLink, PLACEHOLDER_HREF,
};
pub use url_validator::{validate_feed_url, ValidationError};
