//! Streaming GET over reqwest

use super::{HttpEvent, HttpEventHandler, HttpRequest, HttpTransport};
use crate::error::TransportError;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// [`HttpTransport`] backed by a shared reqwest client
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    http: Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn perform(
        &self,
        request: &HttpRequest,
        handler: &mut dyn HttpEventHandler,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        debug!(url = %request.url, "Opening HTTP transfer");

        // Bounds connecting and each wait for body bytes, not the whole transfer
        let send = tokio::time::timeout(request.timeout, self.http.get(&request.url).send());
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            response = send => match response {
                Ok(response) => response.map_err(|e| TransportError::Connect(e.to_string()))?,
                Err(_) => {
                    return Err(TransportError::Connect(format!(
                        "no response within {} ms",
                        request.timeout.as_millis()
                    )))
                }
            },
        };

        handler.on_event(HttpEvent::Connected).await;

        if response.url().as_str() != request.url {
            handler
                .on_event(HttpEvent::Redirect {
                    location: response.url().as_str(),
                })
                .await;
        }

        let status = response.status();
        if !status.is_success() {
            let message = format!("HTTP {}", status.as_u16());
            warn!(url = %request.url, status = status.as_u16(), "Server refused transfer");
            handler.on_event(HttpEvent::Error(&message)).await;
            handler.on_event(HttpEvent::Disconnected).await;
            return Err(TransportError::Status(status.as_u16()));
        }

        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                handler
                    .on_event(HttpEvent::Header {
                        name: name.as_str(),
                        value,
                    })
                    .await;
            }
        }

        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    handler.on_event(HttpEvent::Disconnected).await;
                    return Err(TransportError::Cancelled);
                }
                next = tokio::time::timeout(request.timeout, stream.next()) => next,
            };

            let Ok(next) = next else {
                let message = format!("no body data for {} ms", request.timeout.as_millis());
                warn!(url = %request.url, "Transfer stalled");
                handler.on_event(HttpEvent::Error(&message)).await;
                handler.on_event(HttpEvent::Disconnected).await;
                return Err(TransportError::Io(message));
            };

            match next {
                Some(Ok(chunk)) => handler.on_event(HttpEvent::Data(&chunk)).await,
                Some(Err(e)) => {
                    let message = e.to_string();
                    handler.on_event(HttpEvent::Error(&message)).await;
                    handler.on_event(HttpEvent::Disconnected).await;
                    return Err(TransportError::Io(message));
                }
                None => break,
            }
        }

        handler.on_event(HttpEvent::Finish).await;
        handler.on_event(HttpEvent::Disconnected).await;
        Ok(())
    }
}
