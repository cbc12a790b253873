//! Sequential machine provisioning with rollback.
//!
//! Each step that leaves something behind on the host registers an undo
//! action once it has succeeded. If a later step fails, the pipeline unwinds
//! the steps completed so far and returns the original error.

use color_eyre::Result;
use tracing::{debug, info};

use crate::cleanup::CleanupStack;

/// Drives one provisioning run; see [`Provisioner::run`].
#[derive(Debug)]
pub(crate) struct Provisioner {
    stack: CleanupStack,
    completed: Vec<String>,
}

impl Provisioner {
    /// Run `body` as a provisioning pipeline.
    ///
    /// On success the undo actions are discarded and the machine is
    /// considered committed. On failure every completed step is rolled back
    /// in reverse order before the error is returned unchanged. An interrupt
    /// received while `body` runs triggers the same rollback.
    pub(crate) fn run<T>(body: impl FnOnce(&mut Provisioner) -> Result<T>) -> Result<T> {
        let mut p = Provisioner {
            stack: CleanupStack::new(),
            completed: Vec::new(),
        };
        let _guard = p.stack.clean_on_interrupt()?;
        match body(&mut p) {
            Ok(v) => {
                p.stack.discard();
                debug!("Provisioning committed after {} steps", p.completed.len());
                Ok(v)
            }
            Err(e) => {
                info!("Provisioning failed, rolling back {} steps", p.stack.len());
                p.stack.clean();
                Err(e)
            }
        }
    }

    /// Run one step and, if it succeeds, register `undo` for it.
    pub(crate) fn step<T>(
        &mut self,
        name: &str,
        action: impl FnOnce() -> Result<T>,
        undo: impl FnOnce() -> Result<()> + Send + 'static,
    ) -> Result<T> {
        let v = self.run_step(name, action)?;
        self.stack.push(name, undo);
        Ok(v)
    }

    /// Run a step whose effects are covered by an earlier step's undo.
    pub(crate) fn run_step<T>(&mut self, name: &str, action: impl FnOnce() -> Result<T>) -> Result<T> {
        debug!("Provisioning: {name}");
        let v = action()?;
        self.completed.push(name.to_owned());
        Ok(v)
    }

    /// Names of the steps completed so far.
    #[cfg(test)]
    pub(crate) fn completed(&self) -> &[String] {
        &self.completed
    }
}
