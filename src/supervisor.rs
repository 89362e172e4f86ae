//! Runs every configured frontend side by side
//!
//! Each frontend gets its own task. A frontend that fails to start or whose
//! listener dies only ends its own task; the supervisor waits for all of them.

use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::frontend::Frontend;

pub struct Supervisor {
    config: Arc<Config>,
    access_log: bool,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            access_log: false,
        }
    }

    pub fn with_access_log(mut self, enabled: bool) -> Self {
        self.access_log = enabled;
        self
    }

    /// Start one task per frontend and wait until every task has finished.
    ///
    /// Returns the name and outcome of each frontend in completion order. In
    /// normal operation this never returns.
    pub async fn run(self) -> Vec<(String, Result<()>)> {
        let mut tasks = JoinSet::new();

        for (name, frontend_config) in &self.config.frontends {
            let name = name.clone();
            let frontend_config = frontend_config.clone();
            let config = self.config.clone();
            let access_log = self.access_log;

            info!(frontend = %name, bind = %frontend_config.bind, "Starting frontend");
            tasks.spawn(async move {
                let result = match Frontend::new(frontend_config, &config) {
                    Ok(frontend) => frontend.with_access_log(access_log).run().await,
                    Err(e) => Err(e),
                };
                (name, result)
            });
        }

        if tasks.is_empty() {
            warn!("No frontends configured");
        }

        let mut finished = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, result)) => {
                    match &result {
                        Ok(()) => info!(frontend = %name, "Frontend stopped"),
                        Err(e) => error!(frontend = %name, "Frontend failed: {}", e),
                    }
                    finished.push((name, result));
                }
                Err(e) => error!("Frontend task aborted: {}", e),
            }
        }

        info!("All frontends have stopped");
        finished
    }
}
