//! Client library for the node-local device API.
//!
//! [`GpuClient`] speaks the gRPC API directly. For consumers that need a
//! continuously updated view, [`SharedInformerFactory`] maintains a cache fed
//! by a list-then-watch loop and exposes it through [`GpuLister`] and
//! [`ResourceEventHandler`] callbacks.
//!
//! ```no_run
//! # async fn demo() -> device_api_client::ClientResult<()> {
//! use device_api_client::{DialOptions, GpuClient, SharedInformerFactory};
//! use tokio_util::sync::CancellationToken;
//!
//! let client = GpuClient::connect(&DialOptions::from_env()).await?;
//! let factory = SharedInformerFactory::new(client, None);
//! let gpus = factory.gpus();
//!
//! let cancel = CancellationToken::new();
//! factory.start(&cancel);
//! factory.wait_for_cache_sync(&cancel).await;
//! for gpu in gpus.lister().list(&Default::default()) {
//!     println!("{} {}", gpu.metadata.name, gpu.spec.uuid);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod factory;
pub mod indexer;
pub mod informer;
pub mod lister;
pub mod reflector;
pub mod token;
pub mod transport;
pub mod watch;

pub use client::GpuClient;
pub use error::ClientError;
pub use error::ClientResult;
pub use factory::GpuInformer;
pub use factory::SharedInformerFactory;
pub use indexer::Indexer;
pub use informer::ResourceEventHandler;
pub use informer::SharedIndexInformer;
pub use lister::GpuLister;
pub use reflector::ListerWatcher;
pub use token::TokenSource;
pub use transport::DialOptions;
pub use watch::WatchEvent;
pub use watch::Watcher;
