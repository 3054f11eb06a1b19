//! Training Logger
//!
//! Prints one progress line per logged step or epoch and, when given a path,
//! mirrors each line into a CSV file.
//!
//! ## CSV Format
//!
//! Supervised runs:
//!
//! ```text
//! step,epoch,elapsed_seconds,learning_rate,train_loss,val_loss,grad_norm
//! ```
//!
//! Policy runs:
//!
//! ```text
//! epoch,elapsed_seconds,mean_return,std_return,min_return,max_return,percent_of_max
//! ```
//!
//! Each row is flushed as soon as it is written, so a crashed run keeps its log.

use crate::reinforce::EpochSummary;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::time::Instant;

const SUPERVISED_HEADER: &str =
    "step,epoch,elapsed_seconds,learning_rate,train_loss,val_loss,grad_norm";
const POLICY_HEADER: &str =
    "epoch,elapsed_seconds,mean_return,std_return,min_return,max_return,percent_of_max";

/// One supervised training log entry
#[derive(Clone, Debug, Default)]
pub struct StepRecord {
    pub step: usize,
    pub epoch: usize,
    pub learning_rate: f64,
    pub train_loss: f64,
    pub val_loss: Option<f64>,
    pub grad_norm: f64,
}

pub struct TrainingLogger {
    csv: Option<File>,
    header_written: bool,
    start_time: Instant,
    last_log_time: Instant,
    quiet: bool,
}

impl TrainingLogger {
    /// Logger that only prints to stdout
    pub fn stdout() -> Self {
        let now = Instant::now();
        Self {
            csv: None,
            header_written: false,
            start_time: now,
            last_log_time: now,
            quiet: false,
        }
    }

    /// Logger that prints and also writes CSV rows to `path`
    pub fn with_csv(path: impl AsRef<Path>) -> io::Result<Self> {
        let mut logger = Self::stdout();
        logger.csv = Some(File::create(path)?);
        Ok(logger)
    }

    /// Suppress console output; CSV rows are still written
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    fn write_row(&mut self, header: &str, row: &str) -> io::Result<()> {
        if let Some(file) = &mut self.csv {
            if !self.header_written {
                writeln!(file, "{header}")?;
                self.header_written = true;
            }
            writeln!(file, "{row}")?;
            file.flush()?;
        }
        Ok(())
    }

    pub fn log_step(&mut self, record: &StepRecord) -> io::Result<()> {
        let elapsed = self.elapsed_seconds();
        let val = record.val_loss.map(|v| format!("{v:.6}")).unwrap_or_default();

        self.write_row(
            SUPERVISED_HEADER,
            &format!(
                "{},{},{:.2},{:e},{:.6},{},{:.6}",
                record.step,
                record.epoch,
                elapsed,
                record.learning_rate,
                record.train_loss,
                val,
                record.grad_norm
            ),
        )?;

        if !self.quiet {
            let step_time = self.last_log_time.elapsed().as_secs_f64();
            let val = record
                .val_loss
                .map(|v| format!(" | Val: {v:.6}"))
                .unwrap_or_default();
            println!(
                "Step {:5} (Epoch {}) | Time: {:7.1}s (+{:.1}s) | LR: {:.3e} | Loss: {:.6}{}",
                record.step, record.epoch, elapsed, step_time, record.learning_rate, record.train_loss, val
            );
        }

        self.last_log_time = Instant::now();
        Ok(())
    }

    /// Log a finished policy epoch
    ///
    /// The console line is the summary line itself, followed by the share of
    /// the theoretical maximum return.
    pub fn log_epoch(&mut self, summary: &EpochSummary, theoretical_max: f64) -> io::Result<()> {
        let elapsed = self.elapsed_seconds();
        let percent = if theoretical_max > 0.0 {
            summary.mean / theoretical_max * 100.0
        } else {
            0.0
        };

        self.write_row(
            POLICY_HEADER,
            &format!(
                "{},{:.2},{:.6},{:.6},{:.6},{:.6},{:.2}",
                summary.iteration, elapsed, summary.mean, summary.std, summary.min, summary.max, percent
            ),
        )?;

        if !self.quiet {
            println!("{summary}");
            println!(
                "  {:.2}/{:.2} ({:.1}% of max) | {:.1}s",
                summary.mean, theoretical_max, percent, elapsed
            );
        }

        self.last_log_time = Instant::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_csv_has_header_and_rows() {
        let path = std::env::temp_dir().join(format!("flightnet_log_{}.csv", std::process::id()));
        {
            let mut logger = TrainingLogger::with_csv(&path).unwrap().quiet();
            for step in 1..=2 {
                logger
                    .log_step(&StepRecord {
                        step,
                        learning_rate: 1e-4,
                        train_loss: 0.5,
                        ..Default::default()
                    })
                    .unwrap();
            }
        }

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], SUPERVISED_HEADER);
        assert!(lines[1].starts_with("1,0,"));
        assert_eq!(lines[2].split(',').count(), 7);
        fs::remove_file(&path).ok();
    }
}
