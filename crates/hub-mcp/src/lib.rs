//! Gateway core: provider supervision, the aggregated catalog and request
//! routing between one host and many tool providers.

pub mod builtin;
pub mod catalog;
pub mod codec;
pub mod connection;
pub mod gateway;
pub mod host;
pub mod provider;
pub mod remote;
pub mod router;
pub mod supervisor;
pub mod transport;
pub mod types;

pub use catalog::{qualify, Catalog, CatalogEntry, CatalogHandle, Collision};
pub use gateway::{Gateway, GatewayBuilder};
pub use host::HostConnection;
pub use provider::{CallContext, LocalProvider, Provider, ProviderEvent, ProviderStatus};
pub use remote::{RemoteProvider, SupervisionOptions};
pub use router::{RequestRouter, Routed};
pub use supervisor::ProcessSupervisor;
pub use transport::{ExitInfo, Launcher, ProcessHandle, ProcessLauncher, Spawned};

pub use tokio_util::sync::CancellationToken;
