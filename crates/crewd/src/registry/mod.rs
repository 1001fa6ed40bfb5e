//! Session registry using one actor per session.
//!
//! The registry is the central state manager for all agent sessions the
//! daemon launched. A shared index maps launch tokens and session ids to
//! session actors; each actor owns its session's cache, queue and
//! subscribers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  lookup   ┌──────────────────────────────┐
//! │ RegistryHandle  │──────────▶│ RwLock<HashMap<SessionKey,   │
//! │  (cheap clone)  │           │           SessionHandle>>    │
//! └────────┬────────┘           └──────────────────────────────┘
//!          │ SessionCommand (mpsc)
//!          ▼
//! ┌─────────────────┐  Output/Exited  ┌─────────────────────┐
//! │  SessionActor   │◀────────────────│ attachment task     │
//! │  cache, queue,  │                 │ (stdout, wait, kill)│
//! │  broadcaster    │────────────────▶│ agent process       │
//! └─────────────────┘      kill       └─────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::debug;

mod actor;
mod attachment;
mod broadcaster;
mod commands;
mod handle;

pub use actor::SESSION_COMMAND_BUFFER;
pub use broadcaster::{Binding, Broadcaster, SubscriberId};
pub use commands::{RegistryError, SessionCommand, Subscription};
pub use handle::{RegistryHandle, SessionHandle, SessionIndex};

use crate::launcher::Launcher;

/// Registry tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Events kept per session.
    pub cache_capacity: usize,
    /// Idle time before an unwatched, finished session is dropped.
    pub retention: Duration,
    /// Time a cancelled process gets to exit before it is detached.
    pub cancel_grace: Duration,
    pub cleanup_interval: Duration,
    /// Bound on reading leftover output after a process exits.
    pub drain_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cache_capacity: crew_core::DEFAULT_CACHE_CAPACITY,
            retention: Duration::from_secs(1800),
            cancel_grace: Duration::from_secs(3),
            cleanup_interval: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(2),
        }
    }
}

/// Create the registry and its cleanup task.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use crewd::launcher::{BinaryDiscovery, Launcher, TokioSpawner};
/// use crewd::registry::{spawn_registry, RegistryConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let launcher = Launcher::new(BinaryDiscovery::new("claude"), Arc::new(TokioSpawner));
///     let registry = spawn_registry(Arc::new(launcher), RegistryConfig::default());
///     let running = registry.list_running().await;
///     println!("{} running", running.len());
/// }
/// ```
pub fn spawn_registry(launcher: Arc<Launcher>, config: RegistryConfig) -> RegistryHandle {
    let handle = RegistryHandle::new(launcher, config);
    spawn_cleanup_task(handle.clone());
    handle
}

/// Periodically drops stale sessions. Stops when only the task itself
/// still holds the registry.
fn spawn_cleanup_task(handle: RegistryHandle) {
    let period = handle.config().cleanup_interval;
    let weak = handle.downgrade();
    drop(handle);

    tokio::spawn(async move {
        let mut ticker = interval(period);
        // First tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(handle) = RegistryHandle::upgrade(&weak) else {
                debug!("Cleanup task stopping: registry dropped");
                break;
            };
            handle.cleanup_stale().await;
        }
    });
}
