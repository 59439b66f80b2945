//! Thin HTTP client over the control plane API.

use anyhow::{Context, Result, bail};
use conveyor_core::pipeline::{Job, Pipeline, Resource};
use reqwest::{Method, RequestBuilder, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
}

impl ApiClient {
    pub fn new(api_url: &str) -> Result<Self> {
        let mut base = Url::parse(api_url).with_context(|| format!("invalid API URL: {api_url}"))?;
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        Ok(Self {
            http: reqwest::Client::new(),
            base: base.join("api/v1/")?,
        })
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let url = self.base.join(path.trim_start_matches('/'))?;
        Ok(self.http.request(method, url))
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = check(request.send().await?).await?;
        let bytes = response.bytes().await?;
        // Endpoints answering 204 carry no body.
        let body = if bytes.is_empty() { b"null".as_slice() } else { &bytes };
        serde_json::from_slice(body).context("unexpected response from API")
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(self.request(Method::GET, path)?).await
    }

    pub async fn get_query<T: DeserializeOwned, Q: Serialize + ?Sized>(
        &self,
        path: &str,
        query: &Q,
    ) -> Result<T> {
        self.send(self.request(Method::GET, path)?.query(query)).await
    }

    pub async fn post<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(self.request(Method::POST, path)?).await
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        self.send(self.request(Method::POST, path)?.json(body)).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(self.request(Method::DELETE, path)?).await
    }

    pub async fn delete_query<T: DeserializeOwned, Q: Serialize + ?Sized>(
        &self,
        path: &str,
        query: &Q,
    ) -> Result<T> {
        self.send(self.request(Method::DELETE, path)?.query(query)).await
    }

    /// Look a pipeline up by team and name.
    pub async fn find_pipeline(&self, team: &str, name: &str) -> Result<Pipeline> {
        let pipelines: Vec<Pipeline> = self
            .get_query("pipelines", &[("team", team), ("name", name)])
            .await?;
        match pipelines.into_iter().next() {
            Some(pipeline) => Ok(pipeline),
            None => bail!("pipeline {team}/{name} not found"),
        }
    }

    pub async fn find_job(&self, team: &str, target: &Target) -> Result<Job> {
        let pipeline = self.find_pipeline(team, &target.pipeline).await?;
        let jobs: Vec<Job> = self.get(&format!("pipelines/{}/jobs", pipeline.id)).await?;
        jobs.into_iter()
            .find(|j| j.name == target.name)
            .with_context(|| format!("job {target} not found"))
    }

    pub async fn find_resource(&self, team: &str, target: &Target) -> Result<Resource> {
        let pipeline = self.find_pipeline(team, &target.pipeline).await?;
        let resources: Vec<Resource> = self
            .get(&format!("pipelines/{}/resources", pipeline.id))
            .await?;
        resources
            .into_iter()
            .find(|r| r.name == target.name)
            .with_context(|| format!("resource {target} not found"))
    }
}

async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response
        .json::<Value>()
        .await
        .ok()
        .and_then(|body| body.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| status.to_string());
    bail!("{message} ({})", status.as_u16())
}

/// A `pipeline/name` reference to a job or resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub pipeline: String,
    pub name: String,
}

impl std::str::FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((pipeline, name)) if !pipeline.is_empty() && !name.is_empty() => Ok(Self {
                pipeline: pipeline.to_string(),
                name: name.to_string(),
            }),
            _ => Err(format!("expected PIPELINE/NAME, got '{s}'")),
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.pipeline, self.name)
    }
}

/// Escape a value used as one path segment.
pub fn segment(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}
