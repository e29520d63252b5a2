//! Docker Engine REST client over a Unix socket or plain TCP.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use futures::StreamExt;
use http_body_util::{BodyExt, BodyStream, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use hyperlocal::UnixConnector;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use super::models::{
    ConfigObject, ErrorResponse, PullProgress, Service, ServiceCreateResponse, ServiceSpec,
    ServiceUpdateResponse, Task,
};
use super::{LogStream, Orchestrator, OrchestratorResult};
use crate::error::{ConfigError, OrchestratorError};

pub const DEFAULT_API_VERSION: &str = "v1.41";
const DEFAULT_TCP_PORT: u16 = 2375;

/// Where the daemon listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    /// Base URL such as `http://10.0.0.5:2375`.
    Tcp(String),
}

impl Endpoint {
    /// Parse a `DOCKER_HOST` style address.
    pub fn parse(host: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidHost(host.to_string());

        if let Some(path) = host.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(invalid());
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        if host.starts_with('/') {
            return Ok(Endpoint::Unix(PathBuf::from(host)));
        }
        if host.starts_with("https://") {
            return Err(invalid());
        }

        let authority = host
            .strip_prefix("tcp://")
            .or_else(|| host.strip_prefix("http://"))
            .unwrap_or(host)
            .trim_end_matches('/');
        if authority.is_empty() || authority.contains('/') {
            return Err(invalid());
        }
        if authority.contains(':') {
            Ok(Endpoint::Tcp(format!("http://{authority}")))
        } else {
            Ok(Endpoint::Tcp(format!("http://{authority}:{DEFAULT_TCP_PORT}")))
        }
    }
}

enum Transport {
    Unix {
        client: Client<UnixConnector, Full<Bytes>>,
        socket: PathBuf,
    },
    Tcp {
        client: Client<HttpConnector, Full<Bytes>>,
        base_url: String,
    },
}

/// Client for the Docker Engine API.
pub struct DockerClient {
    transport: Transport,
    api_version: String,
}

impl DockerClient {
    pub fn new(endpoint: Endpoint, api_version: impl Into<String>) -> Self {
        let transport = match endpoint {
            Endpoint::Unix(socket) => Transport::Unix {
                client: Client::builder(TokioExecutor::new()).build(UnixConnector),
                socket,
            },
            Endpoint::Tcp(base_url) => Transport::Tcp {
                client: Client::builder(TokioExecutor::new()).build_http(),
                base_url,
            },
        };
        Self {
            transport,
            api_version: api_version.into(),
        }
    }

    fn uri(&self, path_and_query: &str) -> OrchestratorResult<Uri> {
        let path = format!("/{}{}", self.api_version, path_and_query);
        match &self.transport {
            Transport::Unix { socket, .. } => Ok(hyperlocal::Uri::new(socket, &path).into()),
            Transport::Tcp { base_url, .. } => format!("{base_url}{path}")
                .parse::<Uri>()
                .map_err(OrchestratorError::transport),
        }
    }

    /// Send a request and turn non-2xx responses into typed errors.
    async fn send(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<Vec<u8>>,
    ) -> OrchestratorResult<Response<Incoming>> {
        debug!(method = %method, path = %path_and_query, "Docker API request");

        let mut builder = Request::builder().method(method).uri(self.uri(path_and_query)?);
        if body.is_some() {
            builder = builder.header("Content-Type", "application/json");
        }
        let req = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(OrchestratorError::transport)?;

        let resp = match &self.transport {
            Transport::Unix { client, .. } => client.request(req).await,
            Transport::Tcp { client, .. } => client.request(req).await,
        }
        .map_err(OrchestratorError::transport)?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let bytes = collect(resp).await?;
        Err(api_error(status.as_u16(), &bytes))
    }

    async fn get_json<T: DeserializeOwned>(&self, path_and_query: &str) -> OrchestratorResult<T> {
        let resp = self.send(Method::GET, path_and_query, None).await?;
        Ok(serde_json::from_slice(&collect(resp).await?)?)
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path_and_query: &str,
        body: &B,
    ) -> OrchestratorResult<T> {
        let body = serde_json::to_vec(body)?;
        let resp = self.send(Method::POST, path_and_query, Some(body)).await?;
        Ok(serde_json::from_slice(&collect(resp).await?)?)
    }
}

async fn collect(resp: Response<Incoming>) -> OrchestratorResult<Bytes> {
    Ok(resp
        .into_body()
        .collect()
        .await
        .map_err(OrchestratorError::transport)?
        .to_bytes())
}

/// Build the error for a failed response, preferring the daemon's message.
fn api_error(status: u16, body: &[u8]) -> OrchestratorError {
    let message = serde_json::from_slice::<ErrorResponse>(body)
        .map(|e| e.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string());
    OrchestratorError::from_status(status, message)
}

fn query<T: Serialize + ?Sized>(params: &T) -> OrchestratorResult<String> {
    serde_urlencoded::to_string(params).map_err(OrchestratorError::transport)
}

fn filters(key: &str, value: &str) -> OrchestratorResult<String> {
    let mut map = HashMap::new();
    map.insert(key, [value]);
    let filters = serde_json::to_string(&map)?;
    query(&[("filters", filters)])
}

/// Split an image reference into the `fromImage` and `tag` pull parameters.
///
/// A pinned digest is dropped when the reference also names a tag, so the
/// pull fetches whatever the tag currently points to.
fn split_image(image: &str) -> (&str, &str) {
    let (name, digest) = match image.split_once('@') {
        Some((name, digest)) => (name, Some(digest)),
        None => (image, None),
    };
    let name_start = name.rfind('/').map_or(0, |i| i + 1);
    match name[name_start..].rfind(':') {
        Some(i) => (&name[..name_start + i], &name[name_start + i + 1..]),
        None => (name, digest.unwrap_or("latest")),
    }
}

/// First error reported in a newline delimited pull progress body.
fn pull_error(body: &[u8]) -> Option<String> {
    serde_json::Deserializer::from_slice(body)
        .into_iter::<PullProgress>()
        .filter_map(|line| line.ok())
        .find_map(|progress| progress.error)
}

#[async_trait]
impl Orchestrator for DockerClient {
    async fn create_service(&self, spec: &ServiceSpec) -> OrchestratorResult<ServiceCreateResponse> {
        self.post_json("/services/create", spec).await
    }

    async fn inspect_service(&self, id: &str) -> OrchestratorResult<Service> {
        self.get_json(&format!("/services/{id}")).await
    }

    async fn update_service(
        &self,
        id: &str,
        spec: &ServiceSpec,
        version: u64,
    ) -> OrchestratorResult<ServiceUpdateResponse> {
        let q = query(&[("version", version)])?;
        self.post_json(&format!("/services/{id}/update?{q}"), spec).await
    }

    async fn delete_service(&self, id: &str) -> OrchestratorResult<()> {
        let resp = self.send(Method::DELETE, &format!("/services/{id}"), None).await?;
        collect(resp).await?;
        Ok(())
    }

    async fn list_tasks(&self, service_id: &str) -> OrchestratorResult<Vec<Task>> {
        let q = filters("service", service_id)?;
        self.get_json(&format!("/tasks?{q}")).await
    }

    async fn inspect_task(&self, task_id: &str) -> OrchestratorResult<Task> {
        self.get_json(&format!("/tasks/{task_id}")).await
    }

    async fn fetch_logs(&self, task_id: &str, follow: bool) -> OrchestratorResult<LogStream> {
        let q = query(&[("stdout", true), ("stderr", true), ("follow", follow)])?;
        let resp = self
            .send(Method::GET, &format!("/tasks/{task_id}/logs?{q}"), None)
            .await?;

        let stream = BodyStream::new(resp.into_body()).filter_map(|frame| async move {
            match frame {
                Ok(frame) => frame.into_data().ok().map(|data| Ok(data.to_vec())),
                Err(e) => Some(Err(OrchestratorError::transport(e))),
            }
        });
        Ok(stream.boxed())
    }

    async fn pull_image(&self, image: &str) -> OrchestratorResult<()> {
        let (from_image, tag) = split_image(image);
        info!(image = %from_image, tag = %tag, "Pulling image");

        let q = query(&[("fromImage", from_image), ("tag", tag)])?;
        let resp = self
            .send(Method::POST, &format!("/images/create?{q}"), None)
            .await?;
        let status = resp.status().as_u16();
        let body = collect(resp).await?;

        // Pull failures arrive as a 200 with an error entry in the progress stream.
        match pull_error(&body) {
            Some(message) => Err(OrchestratorError::Api { status, message }),
            None => Ok(()),
        }
    }

    async fn resolve_config(&self, name: &str) -> OrchestratorResult<String> {
        let q = filters("name", name)?;
        let configs: Vec<ConfigObject> = self.get_json(&format!("/configs?{q}")).await?;
        // The name filter matches prefixes.
        configs
            .into_iter()
            .find(|c| c.spec.name == name)
            .map(|c| c.id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("config {name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unix_endpoints() {
        assert_eq!(
            Endpoint::parse("unix:///var/run/docker.sock").unwrap(),
            Endpoint::Unix(PathBuf::from("/var/run/docker.sock"))
        );
        assert_eq!(
            Endpoint::parse("/tmp/dj.sock").unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/dj.sock"))
        );
        assert!(Endpoint::parse("unix://").is_err());
    }

    #[test]
    fn test_parse_tcp_endpoints() {
        assert_eq!(
            Endpoint::parse("tcp://10.0.0.5:2376").unwrap(),
            Endpoint::Tcp("http://10.0.0.5:2376".into())
        );
        assert_eq!(
            Endpoint::parse("http://manager:4243/").unwrap(),
            Endpoint::Tcp("http://manager:4243".into())
        );
        assert_eq!(
            Endpoint::parse("manager").unwrap(),
            Endpoint::Tcp("http://manager:2375".into())
        );
        assert!(matches!(
            Endpoint::parse("https://manager:2376"),
            Err(ConfigError::InvalidHost(_))
        ));
        assert!(Endpoint::parse("tcp://host/path").is_err());
    }

    #[test]
    fn test_split_image() {
        assert_eq!(split_image("alpine"), ("alpine", "latest"));
        assert_eq!(split_image("alpine:3.19"), ("alpine", "3.19"));
        assert_eq!(
            split_image("registry:5000/team/app"),
            ("registry:5000/team/app", "latest")
        );
        assert_eq!(
            split_image("registry:5000/team/app:v2"),
            ("registry:5000/team/app", "v2")
        );
        assert_eq!(
            split_image("alpine@sha256:abcd"),
            ("alpine", "sha256:abcd")
        );
        assert_eq!(split_image("alpine:3@sha256:abcd"), ("alpine", "3"));
    }

    #[test]
    fn test_api_error_classification() {
        let err = api_error(404, br#"{"message":"service web not found"}"#);
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "not found: service web not found");

        let err = api_error(409, br#"{"message":"name conflicts"}"#);
        assert!(matches!(err, OrchestratorError::Conflict(_)));

        let err = api_error(500, b"plain failure\n");
        assert!(matches!(
            err,
            OrchestratorError::Api { status: 500, ref message } if message == "plain failure"
        ));
    }

    #[test]
    fn test_pull_error_in_progress_stream() {
        let ok = b"{\"status\":\"Pulling from library/alpine\"}\n{\"status\":\"Done\"}\n";
        assert_eq!(pull_error(ok), None);

        let failed = b"{\"status\":\"Pulling\"}\n{\"errorDetail\":{\"message\":\"denied\"},\"error\":\"denied\"}\n";
        assert_eq!(pull_error(failed).as_deref(), Some("denied"));
    }

    #[test]
    fn test_query_encoding() {
        assert_eq!(
            filters("service", "abc").unwrap(),
            "filters=%7B%22service%22%3A%5B%22abc%22%5D%7D"
        );
        assert_eq!(
            query(&[("stdout", true), ("follow", false)]).unwrap(),
            "stdout=true&follow=false"
        );
    }

    #[tokio::test]
    async fn test_uri_includes_api_version() {
        let client = DockerClient::new(Endpoint::Tcp("http://manager:2375".into()), "v1.41");
        let uri = client.uri("/services/abc").unwrap();
        assert_eq!(uri.to_string(), "http://manager:2375/v1.41/services/abc");
    }
}
