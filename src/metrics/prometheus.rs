use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{MetricsError, MetricsProvider, Usage};

/* ============================= WIRE TYPES ============================= */

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<QueryResult>,
}

#[derive(Debug, Deserialize)]
struct QueryResult {
    /// `[ <unix timestamp>, "<number as string>" ]`
    value: (f64, String),
}

/// Extract the first sample value from an instant-query response.
/// `None` means the query matched no series.
fn first_sample(response: &QueryResponse) -> Result<Option<f64>, MetricsError> {
    if response.status != "success" {
        return Err(MetricsError::Unavailable(format!(
            "query status '{}'",
            response.status
        )));
    }
    let Some(data) = &response.data else {
        return Ok(None);
    };
    let Some(first) = data.result.first() else {
        return Ok(None);
    };
    first
        .value
        .1
        .parse::<f64>()
        .map(Some)
        .map_err(|_| MetricsError::Other(format!("non-numeric sample '{}'", first.value.1)))
}

/* ============================= PROVIDER ============================= */

/// Prometheus backend. Issues instant queries over a 5-minute window via
/// `GET /api/v1/query?query=<urlencoded>`.
pub struct PrometheusProvider {
    base_url: String,
    http: reqwest::Client,
}

impl PrometheusProvider {
    pub fn new(base_url: &str) -> Result<Self, MetricsError> {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(MetricsError::Other(format!(
                "prometheus URL must start with http:// or https://, got '{base_url}'"
            )));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| MetricsError::Other(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    async fn instant_query(&self, query: &str) -> Result<Option<f64>, MetricsError> {
        let url = format!(
            "{}/api/v1/query?query={}",
            self.base_url,
            urlencoding::encode(query)
        );

        let response = self.http.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                MetricsError::Timeout(e.to_string())
            } else {
                MetricsError::Unavailable(e.to_string())
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(MetricsError::Unauthorized(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(MetricsError::Unavailable(format!("HTTP {status}")));
        }

        let parsed: QueryResponse = response
            .json()
            .await
            .map_err(|e| MetricsError::Other(format!("bad query response: {e}")))?;
        first_sample(&parsed)
    }

    fn cpu_query(namespace: &str, pod: &str) -> String {
        format!(
            r#"sum(rate(container_cpu_usage_seconds_total{{namespace="{namespace}",pod="{pod}",container!=""}}[5m])) * 1000"#
        )
    }

    fn memory_query(namespace: &str, pod: &str) -> String {
        format!(
            r#"sum(container_memory_usage_bytes{{namespace="{namespace}",pod="{pod}",container!=""}})"#
        )
    }

    fn throttle_query(namespace: &str, pod: &str) -> String {
        format!(
            r#"sum(increase(container_cpu_cfs_throttled_periods_total{{namespace="{namespace}",pod="{pod}"}}[5m])) / sum(increase(container_cpu_cfs_periods_total{{namespace="{namespace}",pod="{pod}"}}[5m])) * 100"#
        )
    }
}

#[async_trait]
impl MetricsProvider for PrometheusProvider {
    fn name(&self) -> &'static str {
        "prometheus"
    }

    async fn fetch_pod_usage(&self, namespace: &str, pod: &str) -> Result<Usage, MetricsError> {
        let cpu = self
            .instant_query(&Self::cpu_query(namespace, pod))
            .await?;
        let memory_bytes = self
            .instant_query(&Self::memory_query(namespace, pod))
            .await?;

        let (Some(cpu_milli), Some(memory_bytes)) = (cpu, memory_bytes) else {
            return Err(MetricsError::NotFound(format!("{namespace}/{pod}")));
        };

        // Throttling is advisory; a failed ratio query degrades to zero.
        let cpu_throttled_pct = self
            .instant_query(&Self::throttle_query(namespace, pod))
            .await
            .ok()
            .flatten()
            .unwrap_or(0.0);

        let mut usage = Usage::new(cpu_milli, memory_bytes / (1024.0 * 1024.0));
        usage.cpu_throttled_pct = Some(cpu_throttled_pct);
        Ok(usage)
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_bad_url() {
        assert!(PrometheusProvider::new("prometheus:9090").is_err());
        assert!(PrometheusProvider::new("http://localhost:9090").is_ok());
        assert!(PrometheusProvider::new("https://prom.example.com/").is_ok());
    }

    #[test]
    fn test_queries_scope_to_pod_and_window() {
        let cpu = PrometheusProvider::cpu_query("app", "web-1");
        assert!(cpu.contains(r#"namespace="app""#));
        assert!(cpu.contains(r#"pod="web-1""#));
        assert!(cpu.contains("[5m]"));
        assert!(cpu.contains("* 1000"));

        let mem = PrometheusProvider::memory_query("app", "web-1");
        assert!(mem.contains("container_memory_usage_bytes"));

        let throttle = PrometheusProvider::throttle_query("app", "web-1");
        assert!(throttle.contains("container_cpu_cfs_throttled_periods_total"));
        assert!(throttle.contains("* 100"));
    }

    #[test]
    fn test_first_sample_success() {
        let json = r#"{"status":"success","data":{"resultType":"vector","result":[
            {"metric":{},"value":[1750000000.0,"182.5"]}
        ]}}"#;
        let response: QueryResponse = serde_json::from_str(json).unwrap();
        assert_eq!(first_sample(&response).unwrap(), Some(182.5));
    }

    #[test]
    fn test_first_sample_empty_result() {
        let json = r#"{"status":"success","data":{"resultType":"vector","result":[]}}"#;
        let response: QueryResponse = serde_json::from_str(json).unwrap();
        assert_eq!(first_sample(&response).unwrap(), None);
    }

    #[test]
    fn test_first_sample_error_status() {
        let json = r#"{"status":"error","errorType":"bad_data","error":"parse error"}"#;
        let response: QueryResponse = serde_json::from_str(json).unwrap();
        assert!(matches!(
            first_sample(&response),
            Err(MetricsError::Unavailable(_))
        ));
    }

    #[test]
    fn test_first_sample_non_numeric() {
        let json = r#"{"status":"success","data":{"result":[
            {"metric":{},"value":[1750000000.0,"NaN-ish"]}
        ]}}"#;
        let response: QueryResponse = serde_json::from_str(json).unwrap();
        assert!(matches!(
            first_sample(&response),
            Err(MetricsError::Other(_))
        ));
    }
}
