//! WebCdn node
//!
//! Loads content-addressed resources from peers that already hold them and
//! falls back to plain HTTP when no peer does or a peer sends bad data.
//!
//! ```rust,no_run
//! use webcdn::{LoadRequest, WebCdn};
//! use webcdn_config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cdn = WebCdn::connect(Config::load_or_default()).await?;
//!     let data = cdn
//!         .load(LoadRequest::url("https://example.com/logo.png"))
//!         .await?;
//!     println!("{} bytes", data.len());
//!     cdn.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod download;
pub mod fallback;
pub mod integrity;
pub mod messenger;

pub use client::{LoadRequest, WebCdn};
pub use download::{Download, DownloadError};
pub use fallback::{FallbackClient, FallbackError};
pub use integrity::{content_hash, resource_id_for_url, verify, IntegrityError};
pub use messenger::{coordinator_url, LookupResponse, Messenger, MessengerError};
