//! Provisioning, configuration and link generation for a sing-box proxy
//! published through a Cloudflare tunnel.

pub mod arch;
pub mod error;
pub mod launcher;
pub mod links;
pub mod materialize;
pub mod meta;
pub mod persistence;
pub mod probe;
pub mod provision;
pub mod resolver;
pub mod store;
pub mod subscription;

pub use error::{CoreError, Result};
pub use launcher::{Component, ComponentState, LaunchSpec, ProcessLauncher};
pub use links::{assemble, Endpoint, LinkOptions, ProxyLink, Scheme};
pub use probe::{select_best, ProbeMode, ProbeResult};
pub use resolver::{resolve, ResolvePolicy, TunnelControl, TunnelSession};
pub use store::{InstallPaths, InstallRecord, InstallationConfig, InstallationStore};
