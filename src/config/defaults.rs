//! Default constants for unicontact configuration.
//!
//! All magic numbers are centralized here with documentation.

// =============================================================================
// Network Defaults
// =============================================================================

/// Default HTTP listen interface (loopback)
pub const DEFAULT_LISTEN_IP: [u8; 4] = [127, 0, 0, 1];

/// Default HTTP listen port
pub const DEFAULT_LISTEN_PORT: u16 = 3000;

// =============================================================================
// Storage Defaults
// =============================================================================

/// Default number of decoded contacts kept in the persistent store's LRU cache
pub const DEFAULT_CACHE_CAPACITY: usize = 100_000;

// =============================================================================
// Reconciliation Defaults
// =============================================================================

/// Lock-scope attempts per observation before it fails with
/// `StoreError::ScopeUnstable`. The first widening is routine; later ones
/// need concurrent bridges growing the same clusters.
pub const DEFAULT_MAX_SCOPE_ATTEMPTS: usize = 8;

// =============================================================================
// Logging Defaults
// =============================================================================

/// Default tracing filter when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "info";
