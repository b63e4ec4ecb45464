pub mod bootstrap;
pub mod cleanup;
pub mod core;
pub mod credential;
pub mod error;
pub mod gateway;
pub mod handler;
pub mod heartbeat;
pub mod pool;
pub mod session;
pub mod strategy;

pub use bootstrap::{Runtime, RuntimeError};
pub use cleanup::{
    CleanupConfig, CleanupCounters, CleanupQueue, CleanupWorker, ProtectedSessions,
    ScheduleOutcome, spawn_cleanup,
};
pub use self::core::{Core, CoreState, ModelCatalog};
pub use credential::{
    CredentialError, CredentialProvider, CredentialStore, CredentialWatcher, Credentials,
    EnvFileSource,
};
pub use error::{ClaimError, GatewayError, PoolError, ProxyError, TransportErrorKind};
pub use gateway::{CompletionStream, GatewayConfig, Pacer, SessionGateway, SessionSpec, WreqGateway};
pub use handler::REQUEST_ID_HEADER;
pub use heartbeat::{
    HeartbeatConfig, HeartbeatHandle, HeartbeatReport, HeartbeatScheduler, HeartbeatState,
    HeartbeatStore, HeartbeatStoreError,
};
pub use pool::{PoolStats, SessionPool};
pub use session::{SessionState, TrackedSession};
pub use strategy::{SessionLease, SessionStrategy};
