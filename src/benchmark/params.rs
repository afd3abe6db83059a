// src/benchmark/params.rs
//! Benchmark trigger parameters

use crate::event::RoutingTarget;
use crate::utils::errors::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Run length when the request omits one or sends zero
pub const DEFAULT_DURATION_SEC: u64 = 30;
/// Shortest accepted run length
pub const MIN_DURATION_SEC: u64 = 5;
/// Longest accepted run length
pub const MAX_DURATION_SEC: u64 = 300;

/// Virtual users when the request omits the count
pub const DEFAULT_VUS: usize = 10;
pub const MIN_VUS: usize = 1;
/// Upper bound on concurrent virtual users
pub const MAX_VUS: usize = 50;

/// Label stored when the request names none
pub const DEFAULT_RUN_LABEL: &str = "api-run";

/// Shortest accepted base URL, scheme included
const MIN_BASE_URL_LEN: usize = 11;

/// Values API explorers pre-fill for string fields
const PLACEHOLDER_URLS: [&str; 2] = ["http://string", "https://string"];

/// Raw `POST /benchmark-results/run` body.
///
/// Numeric fields accept numbers or numeric strings. Zero and non-numeric
/// values fall back to the default; any other number is clamped into range.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BenchmarkRequest {
    #[serde(default)]
    pub duration_sec: Option<Value>,
    #[serde(default)]
    pub vus: Option<Value>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub run_label: Option<String>,
    #[serde(default)]
    pub routing_target: Option<String>,
}

/// Validated run parameters
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkParams {
    pub duration_sec: u64,
    pub vus: usize,
    pub base_url: String,
    pub run_label: String,
    pub routing_target: Option<RoutingTarget>,
}

impl BenchmarkRequest {
    /// Clamp and validate into run parameters.
    ///
    /// `default_base_url` is used when the body names none. Fails only on a
    /// bad base URL; every other field is clamped or defaulted.
    pub fn into_params(self, default_base_url: &str) -> Result<BenchmarkParams> {
        let duration_sec = nonzero(self.duration_sec.as_ref())
            .map(|d| d.clamp(MIN_DURATION_SEC as f64, MAX_DURATION_SEC as f64) as u64)
            .unwrap_or(DEFAULT_DURATION_SEC);

        let vus = nonzero(self.vus.as_ref())
            .map(|v| v.clamp(MIN_VUS as f64, MAX_VUS as f64) as usize)
            .unwrap_or(DEFAULT_VUS);

        let raw_base = self
            .base_url
            .unwrap_or_else(|| default_base_url.to_string());
        let base_url = normalize_base_url(&raw_base).ok_or_else(|| {
            PipelineError::validation(
                "base_url must be a real gateway URL (e.g. http://localhost:7070), not a placeholder",
                Some(raw_base.clone()),
            )
        })?;

        let routing_target = self.routing_target.as_deref().and_then(|raw| {
            match raw.parse::<RoutingTarget>() {
                Ok(target) => Some(target),
                Err(_) => {
                    warn!("Ignoring unknown routing_target {:?}; broadcasting", raw);
                    None
                }
            }
        });

        Ok(BenchmarkParams {
            duration_sec,
            vus,
            base_url,
            run_label: self
                .run_label
                .unwrap_or_else(|| DEFAULT_RUN_LABEL.to_string()),
            routing_target,
        })
    }
}

/// Finite non-zero number, from a JSON number or numeric string
fn nonzero(value: Option<&Value>) -> Option<f64> {
    let n = match value? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    (n.is_finite() && n != 0.0).then_some(n)
}

/// Strip one trailing slash and check that the URL is absolute http(s) and
/// not a placeholder
pub fn normalize_base_url(raw: &str) -> Option<String> {
    let url = raw.strip_suffix('/').unwrap_or(raw);
    let absolute = url.starts_with("http://") || url.starts_with("https://");

    if !absolute || url.len() < MIN_BASE_URL_LEN || PLACEHOLDER_URLS.contains(&url) {
        return None;
    }
    Some(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const DEFAULT_BASE: &str = "http://localhost:7070";

    fn request(body: Value) -> BenchmarkRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn test_defaults() {
        let params = BenchmarkRequest::default().into_params(DEFAULT_BASE).unwrap();
        assert_eq!(params.duration_sec, 30);
        assert_eq!(params.vus, 10);
        assert_eq!(params.base_url, DEFAULT_BASE);
        assert_eq!(params.run_label, "api-run");
        assert!(params.routing_target.is_none());
    }

    #[test]
    fn test_clamping() {
        let low = request(json!({"duration_sec": 1, "vus": 0}))
            .into_params(DEFAULT_BASE)
            .unwrap();
        assert_eq!(low.duration_sec, 5);
        assert_eq!(low.vus, 10);

        let high = request(json!({"duration_sec": 10_000, "vus": "500"}))
            .into_params(DEFAULT_BASE)
            .unwrap();
        assert_eq!(high.duration_sec, 300);
        assert_eq!(high.vus, 50);

        let junk = request(json!({"duration_sec": "soon", "vus": true}))
            .into_params(DEFAULT_BASE)
            .unwrap();
        assert_eq!(junk.duration_sec, 30);
        assert_eq!(junk.vus, 10);
    }

    #[test]
    fn test_negative_values_clamp_to_lower_bound() {
        let params = request(json!({"duration_sec": -5, "vus": -3}))
            .into_params(DEFAULT_BASE)
            .unwrap();
        assert_eq!(params.duration_sec, 5);
        assert_eq!(params.vus, 1);

        let params = request(json!({"duration_sec": "-120", "vus": 0.5}))
            .into_params(DEFAULT_BASE)
            .unwrap();
        assert_eq!(params.duration_sec, 5);
        assert_eq!(params.vus, 1);
    }

    #[test]
    fn test_rejects_placeholder_and_short_urls() {
        for bad in ["http://string", "https://string/", "http://a.b", "ftp://example.com", "localhost:7070"] {
            let err = request(json!({"base_url": bad}))
                .into_params(DEFAULT_BASE)
                .unwrap_err();
            match err {
                PipelineError::Validation { received, .. } => {
                    assert_eq!(received.as_deref(), Some(bad));
                }
                other => panic!("unexpected error {:?}", other),
            }
        }
    }

    #[test]
    fn test_trailing_slash_stripped() {
        let params = request(json!({"base_url": "http://gateway:7070/"}))
            .into_params(DEFAULT_BASE)
            .unwrap();
        assert_eq!(params.base_url, "http://gateway:7070");
    }

    #[test]
    fn test_routing_target() {
        let params = request(json!({"routing_target": "postgres"}))
            .into_params(DEFAULT_BASE)
            .unwrap();
        assert_eq!(params.routing_target, Some(RoutingTarget::Relational));

        let params = request(json!({"routing_target": "redis"}))
            .into_params(DEFAULT_BASE)
            .unwrap();
        assert!(params.routing_target.is_none());
    }
}
