//! Explicit runtime context handed to every uplink component.
//!
//! Built once at startup. Replaces process globals for the node name and the
//! shared diagnostic log.

use std::sync::Arc;

use crate::diagnostics::DiagnosticLog;

/// Node identity plus the shared diagnostic log.
#[derive(Clone)]
pub struct UplinkContext {
    node: Arc<str>,
    log: Arc<DiagnosticLog>,
}

impl UplinkContext {
    pub fn new(node: impl Into<Arc<str>>, log: Arc<DiagnosticLog>) -> Self {
        Self {
            node: node.into(),
            log,
        }
    }

    /// Node identifier used in remote paths.
    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn log(&self) -> &DiagnosticLog {
        &self.log
    }
}

impl std::fmt::Debug for UplinkContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UplinkContext")
            .field("node", &self.node)
            .field("log", &self.log.path())
            .finish()
    }
}
