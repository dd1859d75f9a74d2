//! Idempotent remote directory provisioning.

use tracing::{debug, info, warn};

use super::{RemoteError, RemoteSession};
use crate::context::UplinkContext;

/// What `ensure` found or did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// Directory was already there
    Present,
    /// Directory was missing and has been created
    Created,
    /// Listing or creation failed for another reason; logged and ignored
    Unknown,
}

/// Makes sure destination directories exist before uploads.
///
/// Tolerates another writer creating the same path concurrently: creation
/// uses parent-creating semantics, so a racing `mkdir -p` is harmless.
#[derive(Debug, Default, Clone, Copy)]
pub struct RemoteDirectoryProvisioner;

impl RemoteDirectoryProvisioner {
    pub fn new() -> Self {
        Self
    }

    pub async fn ensure(&self, session: &mut RemoteSession, path: &str, ctx: &UplinkContext) -> ProvisionOutcome {
        match session.list_dir(path).await {
            Ok(_) => {
                debug!(path, "Remote directory present");
                ProvisionOutcome::Present
            }
            Err(RemoteError::PathMissing(_)) => match session.make_dirs(path).await {
                Ok(()) => {
                    info!(path, "Created remote directory");
                    ctx.log().log(&format!("created remote directory {}", path)).await;
                    ProvisionOutcome::Created
                }
                Err(e) => {
                    warn!(path, error = %e, "Could not create remote directory");
                    ctx.log()
                        .log(&format!("could not create remote directory {}: {}", path, e))
                        .await;
                    ProvisionOutcome::Unknown
                }
            },
            Err(e) => {
                warn!(path, error = %e, "Could not check remote directory");
                ctx.log()
                    .log(&format!("could not check remote directory {}: {}", path, e))
                    .await;
                ProvisionOutcome::Unknown
            }
        }
    }
}
