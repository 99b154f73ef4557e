//! System-wide constants.

/// Bounded retries for a claim that loses the optimistic-concurrency
/// race against another poller.
pub const DEFAULT_CLAIM_RETRY_ATTEMPTS: u32 = 5;

/// Priority reserved for bot-termination requests.
pub const TERMINATION_PRIORITY: u8 = 0;

/// Maximum number of `k:v` tags on a single request.
pub const MAX_TAGS: usize = 64;

/// Maximum length of a single tag string.
pub const MAX_TAG_LENGTH: usize = 256;

/// Maximum number of dimension keys on a single request.
pub const MAX_DIMENSION_KEYS: usize = 32;

/// Maximum number of values per dimension key.
pub const MAX_DIMENSION_VALUES: usize = 16;

/// Maximum entries returned by a single paginated query page.
pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const MAX_PAGE_SIZE: usize = 1000;
