//! Translate a request row into the filter handed to the host capability.

use serde::Serialize;
use thiserror::Error;

use super::{Request, RequestKind, TargetMode};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("{kind} request requires a non-empty filter")]
    MissingSelector { kind: RequestKind },

    #[error("refresh-paths filter is not a JSON string array: {0}")]
    MalformedPaths(String),
}

/// The capability-facing description of one unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionFilter {
    Tests {
        mode: TargetMode,
        names: Vec<String>,
        categories: Vec<String>,
    },
    Refresh {
        /// Empty means a full refresh.
        paths: Vec<String>,
    },
}

impl ExecutionFilter {
    pub fn from_request(request: &Request) -> Result<Self, FilterError> {
        let raw = request.filter.as_deref().unwrap_or("");

        match request.kind {
            RequestKind::RunAll => Ok(ExecutionFilter::Tests {
                mode: request.target_mode,
                names: Vec::new(),
                categories: Vec::new(),
            }),
            RequestKind::RunClass | RequestKind::RunMethod => {
                let names = split_selectors(raw);
                if names.is_empty() {
                    return Err(FilterError::MissingSelector { kind: request.kind });
                }
                Ok(ExecutionFilter::Tests {
                    mode: request.target_mode,
                    names,
                    categories: Vec::new(),
                })
            }
            RequestKind::RunCategory => {
                let categories = split_selectors(raw);
                if categories.is_empty() {
                    return Err(FilterError::MissingSelector { kind: request.kind });
                }
                Ok(ExecutionFilter::Tests {
                    mode: request.target_mode,
                    names: Vec::new(),
                    categories,
                })
            }
            RequestKind::RefreshFull => Ok(ExecutionFilter::Refresh { paths: Vec::new() }),
            RequestKind::RefreshPaths => {
                let paths = parse_paths(raw)?;
                if paths.is_empty() {
                    return Err(FilterError::MissingSelector { kind: request.kind });
                }
                Ok(ExecutionFilter::Refresh { paths })
            }
        }
    }

    /// Whether the finish callback can be trusted for this filter.
    /// Refreshes never switch runtime mode.
    pub fn callbacks_reliable(&self) -> bool {
        match self {
            ExecutionFilter::Tests { mode, .. } => mode.callbacks_reliable(),
            ExecutionFilter::Refresh { .. } => true,
        }
    }
}

fn split_selectors(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// Controllers store either a JSON array or a comma-separated list.
fn parse_paths(raw: &str) -> Result<Vec<String>, FilterError> {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') {
        let paths: Vec<String> = serde_json::from_str(trimmed)
            .map_err(|e| FilterError::MalformedPaths(e.to_string()))?;
        return Ok(paths
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect());
    }
    Ok(split_selectors(trimmed))
}
