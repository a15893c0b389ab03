//! 传输结果摘要

use std::fmt;

use gattlink_core::transfer::TransferResult;
use gattlink_core::TransferState;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct TransferSummary {
    pub device: String,
    pub state: String,
    pub request_bytes: usize,
    pub response_bytes: Option<usize>,
    pub duration_ms: Option<u128>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TransferSummary {
    pub fn new(
        device: &str,
        request_bytes: usize,
        state: TransferState,
        result: &TransferResult,
    ) -> Self {
        let (response_bytes, duration_ms, error) = match result {
            Ok(response) => (
                Some(response.data.len()),
                Some(response.duration.as_millis()),
                None,
            ),
            Err(e) => (None, None, Some(e.to_string())),
        };
        Self {
            device: device.to_string(),
            state: state.to_string(),
            request_bytes,
            response_bytes,
            duration_ms,
            output: None,
            response: None,
            error,
        }
    }
}

impl fmt::Display for TransferSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.error, self.response_bytes, self.duration_ms) {
            (Some(error), _, _) => write!(f, "❌ {} ({}): {}", self.device, self.state, error),
            (None, Some(bytes), Some(ms)) => {
                write!(
                    f,
                    "✅ {}: sent {} bytes, received {} bytes in {}ms",
                    self.device, self.request_bytes, bytes, ms
                )?;
                if let Some(path) = &self.output {
                    write!(f, " (saved to {path})")?;
                }
                Ok(())
            }
            _ => write!(f, "{} ({})", self.device, self.state),
        }
    }
}
