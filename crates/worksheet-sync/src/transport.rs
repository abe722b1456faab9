//! Request/response exchange with the notebook server.
//!
//! A [`Transport`] issues one request per call and hands back the raw body.
//! Decoding into typed responses happens in [`crate::protocol`] so that the
//! same decoders run against the HTTP transport and the scripted one in
//! `testing` (behind the `testing` feature).

use std::future::Future;
use std::time::Duration;

use log::debug;
use url::Url;

use crate::protocol::{Command, Params};

/// Error type for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server answered {command} with status {status}")]
    Status { command: Command, status: u16 },

    #[error("Invalid server URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("No scripted response for {0}")]
    Unscripted(Command),

    #[error("Connection failed: {0}")]
    Failed(String),
}

/// One asynchronous request/response exchange with the worksheet endpoints.
///
/// Parameters are posted form-encoded when present; an empty parameter set
/// is sent as a GET.
pub trait Transport: Send + Sync {
    fn request(
        &self,
        command: Command,
        params: Params,
    ) -> impl Future<Output = Result<String, TransportError>> + Send;
}

/// Transport talking HTTP to a live notebook server.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base: Url,
}

impl HttpTransport {
    /// Create a transport for `worksheet` (`owner/number`) on `server`.
    pub fn new(server: &str, worksheet: &str) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Self::with_client(client, server, worksheet)
    }

    /// Create a transport reusing an existing client (and its cookies/auth).
    pub fn with_client(
        client: reqwest::Client,
        server: &str,
        worksheet: &str,
    ) -> Result<Self, TransportError> {
        let base = Url::parse(&format!(
            "{}/home/{}/",
            server.trim_end_matches('/'),
            worksheet.trim_matches('/')
        ))?;
        Ok(Self { client, base })
    }

    /// URL of `command` for this worksheet.
    pub fn endpoint(&self, command: Command) -> Result<Url, TransportError> {
        Ok(self.base.join(command.as_str())?)
    }
}

impl Transport for HttpTransport {
    async fn request(&self, command: Command, params: Params) -> Result<String, TransportError> {
        let url = self.endpoint(command)?;
        debug!("[transport] {} {}", if params.is_empty() { "GET" } else { "POST" }, url);

        let request = if params.is_empty() {
            self.client.get(url)
        } else {
            self.client.post(url).form(params.as_pairs())
        };

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                command,
                status: status.as_u16(),
            });
        }
        Ok(response.text().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_urls() {
        let transport = HttpTransport::new("http://localhost:8080/", "admin/3").unwrap();
        assert_eq!(
            transport.endpoint(Command::CellUpdate).unwrap().as_str(),
            "http://localhost:8080/home/admin/3/cell_update"
        );
        assert_eq!(
            transport.endpoint(Command::NewCellAfter).unwrap().as_str(),
            "http://localhost:8080/home/admin/3/new_cell_after"
        );
    }

    #[test]
    fn test_invalid_server_url() {
        assert!(matches!(
            HttpTransport::new("not a url", "admin/0"),
            Err(TransportError::InvalidUrl(_))
        ));
    }
}
