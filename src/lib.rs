//! duokv: a uniform key-value store over a durable SQLite engine and an
//! in-process cache, with TTL expiry and pattern queries.
//!
//! Open a [`Store`] by provider, then use the same calls regardless of the
//! engine underneath:
//!
//! ```no_run
//! use duokv::{Query, Store};
//! use std::time::Duration;
//!
//! # async fn run() -> duokv::Result<()> {
//! let options: toml::Table = toml::from_str(r#"data_dir = "/var/lib/duokv""#).unwrap();
//! let store = Store::open("durable", options).await?;
//!
//! store.set("user/1", b"alice").await?;
//! store.set_with_ttl("session/abc", b"token", Duration::from_secs(2)).await?;
//!
//! let page = store.query(&Query::new("user/*")).await?;
//! assert_eq!(page.total, 1);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod query;
pub mod record;
pub mod store;
pub mod telemetry;

pub use config::{BackendConfig, CacheConfig, DurableConfig, Provider, StoreConfig};
pub use error::{Error, Result};
pub use query::{Pagination, Query, QueryFilter, TimeRange};
pub use record::{Entry, Metadata, QueryItem, QueryPage, Record};
pub use store::{Store, StoreBackend};
