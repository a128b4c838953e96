use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, warn};

/// A long-lived component the daemon starts and stops as a unit.
#[async_trait]
pub trait Module: Send + Sync {
    fn name(&self) -> &str;
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("cannot {action} modules while {state:?}")]
    InvalidState {
        action: &'static str,
        state: LifecycleState,
    },
}

pub struct LifecycleManager {
    state: LifecycleState,
    modules: Vec<Arc<dyn Module>>,
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Stopped,
            modules: Vec::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Modules start in registration order and stop in reverse.
    pub fn register(&mut self, module: Arc<dyn Module>) {
        self.modules.push(module);
    }

    async fn stop_reversed(modules: &[Arc<dyn Module>]) {
        for module in modules.iter().rev() {
            info!("Stopping module: {}", module.name());
            if let Err(e) = module.stop().await {
                warn!("Module {} stop error: {}", module.name(), e);
            }
        }
    }

    /// Start everything. If one module fails, those already started are
    /// stopped again and the original error is returned.
    pub async fn start_all(&mut self) -> Result<()> {
        if self.state != LifecycleState::Stopped {
            return Err(LifecycleError::InvalidState {
                action: "start",
                state: self.state,
            }
            .into());
        }
        self.state = LifecycleState::Starting;

        for (index, module) in self.modules.iter().enumerate() {
            info!("Starting module: {}", module.name());
            if let Err(e) = module.start().await {
                error!("Module {} failed to start: {}", module.name(), e);
                Self::stop_reversed(&self.modules[..index]).await;
                self.state = LifecycleState::Stopped;
                return Err(e.context(format!("module '{}' failed to start", module.name())));
            }
        }

        self.state = LifecycleState::Running;
        info!("All {} module(s) running", self.modules.len());
        Ok(())
    }

    /// Stop everything in reverse order. Individual stop errors are logged.
    pub async fn stop_all(&mut self) -> Result<()> {
        match self.state {
            LifecycleState::Stopped => return Ok(()),
            LifecycleState::Running => {}
            state => {
                return Err(LifecycleError::InvalidState {
                    action: "stop",
                    state,
                }
                .into());
            }
        }
        self.state = LifecycleState::Stopping;
        Self::stop_reversed(&self.modules).await;
        self.state = LifecycleState::Stopped;
        info!("All modules stopped");
        Ok(())
    }
}
