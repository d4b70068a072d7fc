//! Security helpers: outbound URL screening and filesystem containment.

pub mod path;
pub mod ssrf;

pub use path::{canonical_dir, contained_in};
pub use ssrf::screen_url;
