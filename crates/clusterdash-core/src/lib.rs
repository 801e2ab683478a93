// clusterdash-core: resource synchronization between clusterdash-api and
// consumers (CLI). Polled HTTP resources, delta-reconciled WebSocket
// feeds, and the session state that gates both.

pub mod auth;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod feed;
pub mod logs;
pub mod model;
pub mod notice;
pub mod poll;
pub mod resources;
pub mod store;
pub mod stream;

// ── Primary re-exports ──────────────────────────────────────────────
pub use auth::{AuthState, AuthStatus};
pub use config::ClientConfig;
pub use dashboard::Dashboard;
pub use error::CoreError;
pub use feed::{DeltaFeed, FeedTarget};
pub use logs::{LogHistory, LogTail};
pub use notice::{Notice, NoticeLevel, Notifier};
pub use poll::{HttpSource, PollOptions, Resource, ResourceSource, ResourceState, Schedule};
pub use resources::PolledResource;
pub use store::{ApplyStats, EntityCollection, EntityPatch, UpdateBatch};
pub use stream::{Snapshot, SnapshotStream};

pub use clusterdash_api::{ChannelState, ReconnectConfig, TlsMode};

pub use model::{
    ClusterAge, ClusterNode, DeploymentMode, Entity, JupyterAddress, Kernel, KernelSpec, SchedulingPolicy,
    Workload, WorkloadPreset, WorkloadRegistration,
};
