//! HTTP delivery client backed by `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use courier_core::{Message, MessageId};
use serde::Serialize;

use crate::cluster::traits::{DeliveryClient, StatusEvent};

/// JSON body POSTed to a message's status URL.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusReport {
    message_id: MessageId,
    event: &'static str,
}

/// POSTs message contents to the delivery URL and lifecycle events to the
/// status URL.
#[derive(Debug, Clone)]
pub struct HttpDeliveryClient {
    client: reqwest::Client,
}

impl HttpDeliveryClient {
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DeliveryClient for HttpDeliveryClient {
    async fn deliver(&self, message: &Message) -> anyhow::Result<u16> {
        let response = self
            .client
            .post(&message.delivery_url)
            .header("X-Message-Id", message.id.to_string())
            .body(message.contents.clone())
            .send()
            .await?;
        Ok(response.status().as_u16())
    }

    async fn notify(&self, message: &Message, event: StatusEvent) -> anyhow::Result<u16> {
        let report = StatusReport {
            message_id: message.id,
            event: match event {
                StatusEvent::Created => "created",
                StatusEvent::Delivered => "delivered",
            },
        };
        let response = self
            .client
            .post(&message.status_url)
            .json(&report)
            .send()
            .await?;
        Ok(response.status().as_u16())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    /// Accepts one request, returns its raw text, and answers with `status`.
    async fn one_shot_server(status: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/inbox", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + length || n == 0 {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
            stream.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });
        (url, server)
    }

    #[tokio::test]
    async fn deliver_posts_contents_and_returns_status() {
        let (url, server) = one_shot_server("202 Accepted").await;
        let client = HttpDeliveryClient::new(Duration::from_secs(5)).unwrap();
        let message = Message::new("", url, b"payload".to_vec());

        assert_eq!(client.deliver(&message).await.unwrap(), 202);
        let request = server.await.unwrap();
        assert!(request.starts_with("POST /inbox"));
        assert!(request.ends_with("payload"));
    }

    #[tokio::test]
    async fn notify_posts_json_event() {
        let (url, server) = one_shot_server("200 OK").await;
        let client = HttpDeliveryClient::new(Duration::from_secs(5)).unwrap();
        let message = Message::new(url, "", Vec::new());

        assert_eq!(
            client.notify(&message, StatusEvent::Delivered).await.unwrap(),
            200
        );
        let request = server.await.unwrap();
        assert!(request.contains("\"event\":\"delivered\""));
        assert!(request.contains(&message.id.to_string()));
    }

    #[tokio::test]
    async fn unreachable_target_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/gone", listener.local_addr().unwrap());
        drop(listener);

        let client = HttpDeliveryClient::new(Duration::from_secs(1)).unwrap();
        let message = Message::new("", url, b"x".to_vec());
        assert!(client.deliver(&message).await.is_err());
    }
}
