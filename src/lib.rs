//! tollgate - time-boxed, rate-limited download entitlements
//!
//! The download-entitlement engine of a storefront: each purchased product
//! gets a 48-hour download window, a 3-download cap, and a 30-second
//! cooldown between download requests.
//!
//! ## Components
//!
//! - **Store**: durable entitlement records and cooldown markers, keyed
//!   per product with alias-set resolution
//! - **Eligibility**: pure classification of a record against the window
//!   and the cap
//! - **Scheduler**: per-product countdown loop publishing fresh snapshots
//!   to registered presentation targets
//! - **Authority**: the remote service that actually signs downloads and
//!   owns the true remaining count
//! - **Reset**: admin invalidation across every store, with broadcast
//!   fan-out to other processes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tollgate::{
//!     EntitlementEngine, KeyCodec, MemoryStore, ProductStore, ScriptedAuthority,
//! };
//!
//! # async fn demo() -> Result<(), tollgate::TollgateError> {
//! let store = ProductStore::new(Arc::new(MemoryStore::new()), KeyCodec::default());
//! let authority = Arc::new(ScriptedAuthority::demo());
//! let engine = EntitlementEngine::builder(store, authority).build();
//!
//! engine.register_purchase("ultimate-bundle").await?;
//! let grant = engine.request_download("ultimate-bundle", None).await?;
//! println!("signed url: {}", grant.download_url);
//! # Ok(())
//! # }
//! ```

pub mod authority;
pub mod broadcast;
pub mod clock;
pub mod config;
pub mod eligibility;
pub mod engine;
pub mod error;
pub mod keys;
pub mod record;
pub mod reset;
pub mod scheduler;
pub mod store;

// Re-exports for convenience
pub use authority::{
    AuthorityError, AuthorityErrorCode, DownloadAuthority, DownloadGrant, HttpAuthority,
    NullRemote, RemoteEntitlements, ScriptedAuthority,
};
pub use broadcast::{ResetBroadcast, ResetNotice, RESET_CHANNEL, RESET_MARKER_TTL_MS};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, EngineParams, TollgateConfig};
pub use eligibility::{
    check_cooldown, evaluate, CooldownVerdict, EligibilitySnapshot, EligibilityState,
};
pub use engine::{EngineBuilder, EntitlementEngine, ProductStatus, DEFAULT_AUTHORITY_TIMEOUT};
pub use error::TollgateError;
pub use keys::{validate_product_key, AliasResolver, AliasSet, KeyCodec, StaticAliasResolver};
pub use record::{EntitlementRecord, COOLDOWN_MS, MAX_DOWNLOADS, WINDOW_MS};
pub use reset::{
    JsonFileOwnedProducts, MemoryOwnedProducts, OwnedProductsCache, ResetCoordinator, ResetReport,
};
pub use scheduler::{
    ChannelTarget, CountdownScheduler, PresentationTarget, TargetId, TargetRegistry,
};
pub use store::{EntitlementStore, JsonFileStore, MemoryStore, ProductStore, StoreError};
