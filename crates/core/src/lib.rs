pub mod blacklist;
pub mod cache;
pub mod cache_hint;
pub mod error;
pub mod identifier_map;
pub mod job;
pub mod result;
pub mod value;

pub use blacklist::*;
pub use cache::*;
pub use cache_hint::CacheSelectHint;
pub use error::*;
pub use identifier_map::*;
pub use job::*;
pub use result::*;
pub use value::*;
