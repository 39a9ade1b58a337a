// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Best-Effort Shutdown
//!
//! Components that hold broker resources implement [`Shutdown`]. The gateway
//! runs them in order and never lets a failure escape: each one is logged and
//! collected into a [`ShutdownReport`].

use crate::errors::GatewayError;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, error};

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Shutdown: Send + Sync {
    /// Name used in logs and in the report.
    fn component(&self) -> &'static str;

    /// Releases the component's broker resources. Must be safe to call twice.
    async fn shutdown(&self) -> Result<(), GatewayError>;
}

/// What went wrong while shutting down, if anything.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub failures: Vec<(&'static str, GatewayError)>,
}

impl ShutdownReport {
    /// `true` when every step shut down without error.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Shuts the components down in the given order. A failing step does not
/// prevent the following ones from running.
///
/// # Parameters
/// * `components` - The components, first to shut down first
///
/// # Returns
/// A report with one entry per failed component, in shutdown order
pub async fn shutdown_in_order(components: &[&dyn Shutdown]) -> ShutdownReport {
    let mut report = ShutdownReport::default();

    for component in components {
        debug!(component = component.component(), "shutting down...");
        match component.shutdown().await {
            Ok(()) => debug!(component = component.component(), "shut down"),
            Err(err) => {
                error!(
                    error = err.to_string(),
                    component = component.component(),
                    "exception occurred while closing"
                );
                report.failures.push((component.component(), err));
            }
        }
    }

    report
}
