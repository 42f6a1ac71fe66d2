/// Run context: run directory, log file, summary writer, cancellation
///
/// Created once per run by `TrainingContext::init` and handed to the
/// components that need it; `shutdown` tears it down explicitly.
use std::path::{Path, PathBuf};

use super::telemetry::SummaryWriter;
use crate::config::TrainConfig;
use crate::data::CancelToken;
use crate::PoseError;

pub const LOG_FILE: &str = "train_log.log";
pub const CONFIG_FILE: &str = "train_config.json";

pub struct TrainingContext {
    run_dir: PathBuf,
    fresh: bool,
    summary: Option<SummaryWriter>,
    cancel: CancelToken,
    shut_down: bool,
}

impl TrainingContext {
    /// Create (fresh run) or reuse (resume) the run directory
    ///
    /// A fresh run directory is `<checkpoint_path><Y>-<m>-<d>-<H>-<M>-<S>` and
    /// must not exist yet; a resumed run uses `checkpoint_path` itself, which
    /// must exist. `train_config.json` is written for fresh runs only.
    pub fn init(config: &TrainConfig) -> crate::Result<Self> {
        let fresh = config.not_continue_training;
        let run_dir = if fresh {
            let stamp = chrono::Local::now().format("%Y-%m-%d-%H-%M-%S");
            let dir = PathBuf::from(format!("{}{}", config.checkpoint_path.display(), stamp));
            if dir.exists() {
                return Err(PoseError::Startup(format!("run directory {:?} already exists", dir)));
            }
            std::fs::create_dir_all(&dir).map_err(|e| {
                PoseError::Startup(format!("cannot create run directory {:?}: {}", dir, e))
            })?;
            dir
        } else {
            let dir = config.checkpoint_path.clone();
            if !dir.is_dir() {
                return Err(PoseError::Startup(format!(
                    "cannot resume: run directory {:?} does not exist",
                    dir
                )));
            }
            dir
        };

        let log_path = run_dir.join(LOG_FILE);
        let installed = crate::utils::init_logging(Some(&log_path)).map_err(|e| {
            PoseError::Startup(format!("cannot open log file {:?}: {}", log_path, e))
        })?;
        if !installed {
            log::debug!("Global logger already installed; {:?} is not attached", log_path);
        }

        // A resumed run keeps the configuration it was started with
        if fresh {
            let config_json = serde_json::to_string_pretty(config)?;
            std::fs::write(run_dir.join(CONFIG_FILE), config_json).map_err(|e| {
                PoseError::Startup(format!("cannot write {:?}: {}", run_dir.join(CONFIG_FILE), e))
            })?;
        }

        let summary = match SummaryWriter::open(&run_dir) {
            Ok(writer) => Some(writer),
            Err(e) => {
                log::warn!("Summaries disabled: {}", e);
                None
            }
        };

        log::info!(
            "{} run in {:?}",
            if fresh { "Fresh" } else { "Resumed" },
            run_dir
        );
        log::info!("Configuration: {:?}", config);

        Ok(Self {
            run_dir,
            fresh,
            summary,
            cancel: CancelToken::new(),
            shut_down: false,
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Whether the run started from scratch
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    /// Coordinator token shared with the prefetch workers
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Summary writer, if the event file could be opened
    pub fn summary(&mut self) -> Option<&mut SummaryWriter> {
        self.summary.as_mut()
    }

    /// Cancel the token and flush summaries; safe to call twice
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.cancel.cancel();
        if let Some(writer) = self.summary.as_mut() {
            if let Err(e) = writer.flush() {
                log::warn!("Failed to flush summaries: {}", e);
            }
        }
        log::debug!("Run context {:?} shut down", self.run_dir);
    }
}

impl Drop for TrainingContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_run_creates_timestamped_dir() -> crate::Result<()> {
        let root = tempfile::tempdir()?;
        let config = TrainConfig {
            checkpoint_path: root.path().join("run-"),
            not_continue_training: true,
            ..Default::default()
        };

        let mut ctx = TrainingContext::init(&config)?;
        let name = ctx.run_dir().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("run-"));
        assert_eq!(name.split('-').count(), 7);
        assert!(ctx.is_fresh());
        assert!(ctx.run_dir().join(CONFIG_FILE).is_file());
        assert!(ctx.summary().is_some());

        let token = ctx.cancel_token();
        ctx.shutdown();
        ctx.shutdown();
        assert!(token.is_cancelled());

        Ok(())
    }

    #[test]
    fn test_resume_requires_existing_dir() -> crate::Result<()> {
        let root = tempfile::tempdir()?;
        let config = TrainConfig {
            checkpoint_path: root.path().join("missing"),
            not_continue_training: false,
            ..Default::default()
        };

        assert!(matches!(TrainingContext::init(&config), Err(PoseError::Startup(_))));
        Ok(())
    }

    #[test]
    fn test_resume_reuses_dir() -> crate::Result<()> {
        let root = tempfile::tempdir()?;
        let config = TrainConfig {
            checkpoint_path: root.path().to_path_buf(),
            not_continue_training: false,
            ..Default::default()
        };

        std::fs::write(root.path().join(CONFIG_FILE), "{\"max_echos\": 1.0}")?;

        let ctx = TrainingContext::init(&config)?;
        assert_eq!(ctx.run_dir(), root.path());
        assert!(!ctx.is_fresh());
        assert_eq!(
            std::fs::read_to_string(root.path().join(CONFIG_FILE))?,
            "{\"max_echos\": 1.0}"
        );

        Ok(())
    }
}
