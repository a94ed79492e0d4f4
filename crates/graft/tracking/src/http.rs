//! HTTP client for a tracking server.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use graft_types::{Artifact, Experiment, MetricSample, Run, RunParam, RunStatus, RunTag};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{TrackingError, TrackingResult};
use crate::store::TrackingStore;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for one tracking server endpoint.
///
/// Speaks the `ajax-api/2.0/mlflow` dialect both servers expose. Missing
/// entities come back as `Ok(None)`; any other non-success status is an
/// [`TrackingError::Api`] error.
pub struct HttpTrackingStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpTrackingStore {
    /// Builds a client for the given server URL.
    pub fn new(base_url: impl Into<String>) -> TrackingResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()?;
        Ok(HttpTrackingStore {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        })
    }

    /// Attaches a bearer token to every request.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/ajax-api/2.0/mlflow/{path}", self.base_url)
    }

    fn apply_auth(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> TrackingResult<Option<T>> {
        let request = self.client.get(self.url(path)).query(query);
        let response = self.apply_auth(request).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TrackingError::Api {
                status: status.as_u16(),
                message,
            });
        }
        let value = response
            .json::<T>()
            .await
            .map_err(|err| TrackingError::InvalidResponse(err.to_string()))?;
        Ok(Some(value))
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> TrackingResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self.client.post(self.url(path)).json(body);
        let response = self.apply_auth(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TrackingError::Api {
                status: status.as_u16(),
                message,
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|err| TrackingError::InvalidResponse(err.to_string()))
    }
}

#[async_trait]
impl TrackingStore for HttpTrackingStore {
    async fn list_experiments(
        &self,
        max_items: usize,
        page_token: &str,
    ) -> TrackingResult<(Vec<Experiment>, Option<String>)> {
        let max = max_items.to_string();
        let mut query = vec![("max_results", max.as_str())];
        if !page_token.is_empty() {
            query.push(("page_token", page_token));
        }
        let response: Option<ExperimentListResponse> =
            self.get_json("experiments/list", &query).await?;
        let response = response.unwrap_or_default();
        let next = response.next_page_token.filter(|token| !token.is_empty());
        Ok((response.experiments, next))
    }

    async fn get_experiment(&self, experiment_id: &str) -> TrackingResult<Option<Experiment>> {
        let response: Option<ExperimentResponse> = self
            .get_json("experiments/get", &[("experiment_id", experiment_id)])
            .await?;
        Ok(response.map(|r| r.experiment))
    }

    async fn get_experiment_by_name(&self, name: &str) -> TrackingResult<Option<Experiment>> {
        let response: Option<ExperimentResponse> = self
            .get_json("experiments/get-by-name", &[("experiment_name", name)])
            .await?;
        Ok(response.map(|r| r.experiment))
    }

    async fn create_experiment(&self, name: &str) -> TrackingResult<String> {
        let response: CreateExperimentResponse = self
            .post_json("experiments/create", &CreateExperimentRequest { name })
            .await?;
        if response.experiment_id.is_empty() {
            return Err(TrackingError::InvalidResponse(
                "experiment created without an id".into(),
            ));
        }
        Ok(response.experiment_id)
    }

    async fn list_runs(&self, experiment_id: &str) -> TrackingResult<Vec<Run>> {
        let response: RunsResponse = self
            .post_json(
                "runs/search",
                &SearchRunsRequest {
                    experiment_ids: [experiment_id],
                    max_results: 1000,
                },
            )
            .await?;
        Ok(response.runs)
    }

    async fn get_run(&self, run_id: &str) -> TrackingResult<Option<Run>> {
        let response: Option<RunResponse> =
            self.get_json("runs/get", &[("run_id", run_id)]).await?;
        Ok(response.map(|r| r.run))
    }

    async fn create_run(
        &self,
        experiment_id: &str,
        name: &str,
        start_time: DateTime<Utc>,
        tags: &[RunTag],
    ) -> TrackingResult<String> {
        let response: RunResponse = self
            .post_json(
                "runs/create",
                &CreateRunRequest {
                    experiment_id,
                    run_name: (!name.is_empty()).then_some(name),
                    start_time: start_time.timestamp_millis(),
                    tags,
                },
            )
            .await?;
        let run_id = response.run.info.run_id;
        if run_id.is_empty() {
            return Err(TrackingError::InvalidResponse(
                "run created without an id".into(),
            ));
        }
        Ok(run_id)
    }

    async fn update_run(&self, run: &Run) -> TrackingResult<Run> {
        let info = &run.info;
        let _: serde_json::Value = self
            .post_json(
                "runs/update",
                &UpdateRunRequest {
                    run_id: &info.run_id,
                    run_name: &info.name,
                    status: info.status,
                    end_time: (info.end_time > 0).then_some(info.end_time),
                },
            )
            .await?;
        let data = &run.data;
        if !data.metrics.is_empty() || !data.params.is_empty() || !data.tags.is_empty() {
            let _: serde_json::Value = self
                .post_json(
                    "runs/log-batch",
                    &LogBatchRequest {
                        run_id: &info.run_id,
                        metrics: &data.metrics,
                        params: &data.params,
                        tags: &data.tags,
                    },
                )
                .await?;
        }
        match self.get_run(&info.run_id).await? {
            Some(updated) => Ok(updated),
            None => Err(TrackingError::InvalidResponse(format!(
                "run {} vanished after update",
                info.run_id
            ))),
        }
    }

    async fn metrics(
        &self,
        _experiment_id: &str,
        run_id: &str,
    ) -> TrackingResult<Vec<MetricSample>> {
        let run = match self.get_run(run_id).await? {
            Some(run) => run,
            None => return Ok(Vec::new()),
        };
        let mut samples = Vec::new();
        for latest in &run.data.metrics {
            let response: Option<MetricHistoryResponse> = self
                .get_json(
                    "metrics/get-history",
                    &[("run_id", run_id), ("metric_key", &latest.key)],
                )
                .await?;
            match response {
                Some(history) if !history.metrics.is_empty() => samples.extend(history.metrics),
                // Servers without history still report the latest sample on
                // the run itself.
                _ => samples.push(latest.clone()),
            }
        }
        Ok(samples)
    }

    async fn artifacts(&self, run_id: &str, path: Option<&str>) -> TrackingResult<Vec<Artifact>> {
        let mut query = vec![("run_id", run_id)];
        if let Some(path) = path {
            query.push(("path", path));
        }
        let response: Option<ArtifactsResponse> = self.get_json("artifacts/list", &query).await?;
        Ok(response.map(|r| r.files).unwrap_or_default())
    }

    async fn get_artifact(&self, run_id: &str, path: &str) -> TrackingResult<Vec<u8>> {
        let request = self
            .client
            .get(self.url("get-artifact"))
            .query(&[("run_id", run_id), ("path", path)]);
        let response = self.apply_auth(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TrackingError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

// ---- wire envelopes ----

#[derive(Debug, Default, Deserialize)]
struct ExperimentListResponse {
    #[serde(default)]
    experiments: Vec<Experiment>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExperimentResponse {
    experiment: Experiment,
}

#[derive(Debug, Serialize)]
struct CreateExperimentRequest<'a> {
    name: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateExperimentResponse {
    #[serde(default)]
    experiment_id: String,
}

#[derive(Debug, Serialize)]
struct SearchRunsRequest<'a> {
    experiment_ids: [&'a str; 1],
    max_results: usize,
}

#[derive(Debug, Default, Deserialize)]
struct RunsResponse {
    #[serde(default)]
    runs: Vec<Run>,
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    run: Run,
}

#[derive(Debug, Serialize)]
struct CreateRunRequest<'a> {
    experiment_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_name: Option<&'a str>,
    start_time: i64,
    tags: &'a [RunTag],
}

#[derive(Debug, Serialize)]
struct UpdateRunRequest<'a> {
    run_id: &'a str,
    run_name: &'a str,
    status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    end_time: Option<i64>,
}

#[derive(Debug, Serialize)]
struct LogBatchRequest<'a> {
    run_id: &'a str,
    metrics: &'a [MetricSample],
    params: &'a [RunParam],
    tags: &'a [RunTag],
}

#[derive(Debug, Default, Deserialize)]
struct MetricHistoryResponse {
    #[serde(default)]
    metrics: Vec<MetricSample>,
}

#[derive(Debug, Default, Deserialize)]
struct ArtifactsResponse {
    #[serde(default)]
    files: Vec<Artifact>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let store = HttpTrackingStore::new("http://tracking.local:5000/").unwrap();
        assert_eq!(
            store.url("runs/get"),
            "http://tracking.local:5000/ajax-api/2.0/mlflow/runs/get"
        );
    }

    #[test]
    fn create_run_request_omits_empty_name() {
        let request = CreateRunRequest {
            experiment_id: "7",
            run_name: None,
            start_time: 1_700_000_000_000,
            tags: &[],
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("run_name").is_none());
        assert_eq!(json["experiment_id"], "7");
    }

    #[test]
    fn sparse_envelopes_decode_to_defaults() {
        let empty: ExperimentListResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.experiments.is_empty());
        assert!(empty.next_page_token.is_none());

        let history: MetricHistoryResponse = serde_json::from_str(
            r#"{"metrics":[{"key":"loss","value":0.5,"timestamp":1700000000,"step":2}]}"#,
        )
        .unwrap();
        assert_eq!(history.metrics.len(), 1);
        assert_eq!(history.metrics[0].value, 0.5);
    }
}
