//! Invocation report.
//!
//! Splits an invocation's wall-clock time into the time until the handler
//! started (read), the handler itself (process) and the time until the
//! caller had the result (write).

use std::fmt;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Errors building a report
#[derive(Debug, Error, PartialEq)]
pub enum ReportError {
    #[error("Result is not a pair of timestamps: {0}")]
    NotTimestamps(String),
}

/// Elapsed-time deltas of one invocation, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct InvocationReport {
    /// From the call until the handler started.
    pub read: f64,

    /// Handler execution.
    pub process: f64,

    /// From the handler's end until the caller had the result.
    pub write: f64,
}

impl InvocationReport {
    /// Build a report from the caller's timestamps and a `[t1, t2]` result.
    pub fn from_timestamps(start: f64, result: &Value, finish: f64) -> Result<Self, ReportError> {
        let pair = result
            .as_array()
            .filter(|a| a.len() == 2)
            .and_then(|a| Some((a[0].as_f64()?, a[1].as_f64()?)));
        let (t1, t2) = pair.ok_or_else(|| ReportError::NotTimestamps(result.to_string()))?;

        Ok(Self {
            read: t1 - start,
            process: t2 - t1,
            write: finish - t2,
        })
    }

    /// Sum of the three deltas.
    pub fn total(&self) -> f64 {
        self.read + self.process + self.write
    }
}

impl fmt::Display for InvocationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "read {:.6}\nprocess {:.6}\nwrite {:.6}",
            self.read, self.process, self.write
        )
    }
}
