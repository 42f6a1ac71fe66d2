/// Utility functions: logging setup and device selection
use candle_core::Device;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// Timestamp layout of log lines, e.g. `2024-05-01 12:00:00,123`
pub const LOG_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S,%3f";

/// Level used when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Copies every log line to stderr and, when present, to a log file
struct TeeWriter {
    file: Option<File>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        if let Some(file) = self.file.as_mut() {
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

/// Install the global logger
///
/// Lines are rendered as `[timestamp] [target] [LEVEL] message`. The level
/// defaults to `DEFAULT_LOG_FILTER` and can be overridden with
/// `RUST_LOG`.
///
/// # Returns
/// `false` if another logger was already installed; the existing one stays.
pub fn init_logging(log_file: Option<&Path>) -> io::Result<bool> {
    let file = match log_file {
        Some(path) => Some(OpenOptions::new().create(true).append(true).open(path)?),
        None => None,
    };

    let installed = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(DEFAULT_LOG_FILTER),
    )
    .format(|buf, record| {
        writeln!(
            buf,
            "[{}] [{}] [{}] {}",
            chrono::Local::now().format(LOG_TIME_FORMAT),
            record.target(),
            record.level(),
            record.args()
        )
    })
    .target(env_logger::Target::Pipe(Box::new(TeeWriter { file })))
    .try_init()
    .is_ok();

    Ok(installed)
}

/// CUDA device 0 when available, CPU otherwise
pub fn select_device() -> candle_core::Result<Device> {
    if candle_core::utils::cuda_is_available() {
        Device::new_cuda(0)
    } else {
        Ok(Device::Cpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tee_writes_file() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("train_log.log");
        let mut tee = TeeWriter {
            file: Some(File::create(&path)?),
        };

        writeln!(tee, "[t] [cpm] [INFO] hello")?;
        tee.flush()?;

        assert_eq!(std::fs::read_to_string(&path)?, "[t] [cpm] [INFO] hello\n");
        Ok(())
    }

    #[test]
    fn test_time_format() {
        let ts = chrono::NaiveDate::from_ymd_opt(2024, 5, 1)
            .and_then(|d| d.and_hms_milli_opt(12, 3, 4, 56))
            .unwrap();
        assert_eq!(ts.format(LOG_TIME_FORMAT).to_string(), "2024-05-01 12:03:04,056");
    }

    #[test]
    fn test_default_filter_hides_per_step_lines() {
        let level: log::LevelFilter = DEFAULT_LOG_FILTER.parse().unwrap();
        assert_eq!(level, log::LevelFilter::Info);
        assert!(log::Level::Trace > level);
    }
}
