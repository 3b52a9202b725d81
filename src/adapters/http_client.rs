use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::Result;
use http_body_util::BodyExt;
use hyper::{Request, Response, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use tokio::time::timeout;

use crate::ports::http_client::{HttpClient, HttpClientError, HttpClientResult, ProbeResponse};

const USER_AGENT: &str = concat!("keel/", env!("CARGO_PKG_VERSION"));

/// Backend client on Hyper with Rustls (HTTP/1.1, TLS when the instance URL asks for it).
///
/// Used both for forwarding and for health probes. Timeouts for forwarded calls
/// are applied by the router; probes carry their own.
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, AxumBody>,
}

impl HttpClientAdapter {
    pub fn new() -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);
        http_connector.set_nodelay(true);

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();
        for cert in native_certs.certs {
            if root_cert_store.add(cert).is_err() {
                tracing::warn!("Failed to add native certificate to rustls RootCertStore");
            }
        }
        if !native_certs.errors.is_empty() {
            tracing::warn!(
                errors = ?native_certs.errors,
                "Some native certificates failed to load"
            );
        }
        tracing::debug!(roots = root_cert_store.len(), "Loaded native root certificates");

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new()).build::<_, AxumBody>(https_connector);
        Ok(Self { client })
    }

    fn set_host_and_agent(req: &mut Request<AxumBody>) -> HttpClientResult<()> {
        let host = match (req.uri().host(), req.uri().port_u16()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(HttpClientError::InvalidRequest(format!(
                    "Outgoing URI has no host: {}",
                    req.uri()
                )));
            }
        };
        let host = HeaderValue::from_str(&host)
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;

        let headers = req.headers_mut();
        headers.insert(header::HOST, host);
        if !headers.contains_key(header::USER_AGENT) {
            headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
        }
        Ok(())
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(
        &self,
        mut req: Request<AxumBody>,
    ) -> HttpClientResult<Response<AxumBody>> {
        Self::set_host_and_agent(&mut req)?;
        *req.version_mut() = Version::HTTP_11;

        let method = req.method().clone();
        let uri = req.uri().clone();
        tracing::debug!(method = %method, uri = %uri, "Sending upstream request");

        match self.client.request(req).await {
            Ok(response) => {
                let (mut parts, body) = response.into_parts();
                // body is re-framed by the server side
                parts.headers.remove(header::TRANSFER_ENCODING);
                Ok(Response::from_parts(parts, AxumBody::new(body)))
            }
            Err(e) => {
                tracing::debug!(method = %method, uri = %uri, error = %e, "Upstream request failed");
                Err(HttpClientError::ConnectionError(format!(
                    "Request to {method} {uri} failed: {e}"
                )))
            }
        }
    }

    async fn probe(&self, url: &str, probe_timeout: Duration) -> HttpClientResult<ProbeResponse> {
        let mut request = Request::builder()
            .method("GET")
            .uri(url)
            .version(Version::HTTP_11)
            .header(header::ACCEPT, "application/json")
            .body(AxumBody::empty())
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;
        Self::set_host_and_agent(&mut request)?;

        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| HttpClientError::ConnectionError(e.to_string()))?;
            let status = response.status();
            let content_type = response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| HttpClientError::ConnectionError(e.to_string()))?
                .to_bytes();
            Ok(ProbeResponse {
                status,
                content_type,
                body,
            })
        };

        match timeout(probe_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(HttpClientError::Timeout(probe_timeout.as_millis() as u64)),
        }
    }
}
