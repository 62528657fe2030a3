mod entry;
mod key;
mod manager;
mod policy;
mod store;

pub use entry::{CacheEntry, Validator};
pub use key::{Fingerprint, KeyRules};
pub use manager::{CacheManager, CacheStats, Revalidation};
pub use policy::CachePolicy;
pub use store::{CacheError, CacheStore, MemoryCacheStore};
