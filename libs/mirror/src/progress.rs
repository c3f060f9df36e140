//! User-facing progress output.
//!
//! Internal diagnostics go through `tracing`; this is the human channel an
//! operator watches while a mirror run is in flight. It writes to stderr so
//! stdout stays free for machine-readable output.

use std::fmt::Display;
use std::future::Future;
use std::time::Instant;

use colored::Colorize;
use tracing::{debug, info, warn};

/// Progress printer owned by each service.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    verbose: bool,
    silent: bool,
}

impl Progress {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            silent: false,
        }
    }

    /// A printer that only forwards to `tracing`.
    pub fn silent() -> Self {
        Self {
            verbose: false,
            silent: true,
        }
    }

    pub fn info(&self, message: impl Display) {
        info!(%message);
        if !self.silent {
            eprintln!("{} {}", "Info:".blue().bold(), message);
        }
    }

    pub fn debug(&self, message: impl Display) {
        debug!(%message);
        if self.verbose && !self.silent {
            eprintln!("{} {}", "Debug:".dimmed(), message.to_string().dimmed());
        }
    }

    pub fn warn(&self, message: impl Display) {
        warn!(%message);
        if !self.silent {
            eprintln!("{} {}", "Warning:".yellow().bold(), message);
        }
    }

    /// Run `task` framed by start and finish lines carrying `label`.
    pub async fn process<T, E, Fut>(&self, label: &str, task: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let started = Instant::now();
        if !self.silent {
            eprintln!("{} {}", "╔".cyan(), label.bold());
        }

        let result = task.await;
        let elapsed = started.elapsed();

        match &result {
            Ok(_) => {
                debug!(label, elapsed_ms = elapsed.as_millis() as u64, "Process succeeded");
                if !self.silent {
                    eprintln!(
                        "{} {} {}",
                        "╚".cyan(),
                        label,
                        format!("succeeded in {:.2}s", elapsed.as_secs_f64()).green()
                    );
                }
            }
            Err(e) => {
                warn!(label, elapsed_ms = elapsed.as_millis() as u64, error = %e, "Process failed");
                if !self.silent {
                    eprintln!(
                        "{} {} {}",
                        "╚".cyan(),
                        label,
                        format!("failed after {:.2}s: {e}", elapsed.as_secs_f64()).red()
                    );
                }
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_process_passes_result_through() {
        let progress = Progress::silent();

        let ok: Result<u32, String> = progress.process("ok", async { Ok(7) }).await;
        assert_eq!(ok, Ok(7));

        let err: Result<u32, String> = progress
            .process("err", async { Err("boom".to_string()) })
            .await;
        assert_eq!(err, Err("boom".to_string()));
    }
}
