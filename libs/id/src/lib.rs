//! # amiforge-id
//!
//! Typed identifiers for provider resources handled by amiforge.
//!
//! ## Design Principles
//!
//! - IDs are assigned by the provider; amiforge never invents them outside tests
//! - All IDs have a canonical string representation with strict parsing
//! - IDs are typed so an image id can never be passed where a snapshot id is expected
//!
//! ## ID Format
//!
//! Resource IDs use the provider's prefixed format: `{prefix}-{suffix}`
//!
//! Examples:
//! - `ami-0c55b159cbfafe1f0`
//! - `snap-066877671789bd71b`
//!
//! Regions are plain lowercase names such as `us-east-1`.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;
