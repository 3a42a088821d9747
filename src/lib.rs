#![deny(unsafe_code)]

//! MQTT v5 session lifecycle and publish/subscribe routing core.
//!
//! Three cooperating pieces: a per-session last-will watchdog
//! ([`will::WillWatchdog`]), a wildcard topic router
//! ([`router::DefaultRouter`]) and a retained-message store
//! ([`retain::DefaultRetainStorage`]), wired together per broker pool by a
//! [`context::PoolContext`] and guarded by the [`hook::AuthHook`]
//! authorization callbacks. The wire codec, transports and the session
//! packet state machine live outside this crate.
//!
//! # Overall Example
//! ```rust,no_run
//! use std::str::FromStr;
//!
//! use routemq::context::PoolContext;
//! use routemq::router::Router as _;
//! use routemq::topic::TopicPath;
//! use routemq::types::{null_context, Id, Publish};
//!
//! #[tokio::main]
//! async fn main() -> routemq::Result<()> {
//!     let scx = PoolContext::new("default").build();
//!
//!     let publish = Publish::new(TopicPath::from_str("sensors/42/temp")?, "21.5");
//!     scx.router.publish(&Id::new("probe-42"), publish, null_context()).await?;
//!     Ok(())
//! }
//! ```

pub mod context; // Pool wiring and builder
pub mod error; // Error types
pub mod hook; // Runtime authorization callbacks
pub mod retain; // Retained message storage
pub mod router; // Publish/subscribe routing core
pub mod topic; // Topic parsing and validation
pub mod trie; // Subscription matching structure
pub mod types; // Common data types
pub mod utils; // Counters and small helpers
pub mod will; // Last-will watchdog

pub use error::{Result, RouteError};
