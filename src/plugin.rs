// src/plugin.rs

//! Hooks for code that needs to bracket a whole run.
//!
//! Plugins are set up in registration order before tests load, see the loaded
//! suite right before the reporter does, and are torn down in reverse order
//! at the end (also when a later step failed).

use crate::config::ConfigFile;
use crate::suite::Suite;
use crate::tasks::BoxFuture;

pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn setup<'a>(&'a self, _config: &'a ConfigFile) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn begin<'a>(&'a self, _suite: &'a Suite) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn teardown(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}
