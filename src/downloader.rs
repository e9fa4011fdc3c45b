use async_trait::async_trait;
use futures::StreamExt;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

use crate::error::DownloadError;

#[async_trait]
pub trait Downloader: Send + Sync {
    /// Stream `url` into `destination`, returning the number of bytes written.
    async fn fetch(&self, url: &str, destination: &Path) -> Result<u64, DownloadError>;
}

#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: reqwest::Client,
    max_bytes: Option<u64>,
}

impl HttpDownloader {
    pub fn new(timeout: Option<Duration>, max_bytes: Option<u64>) -> Result<Self, DownloadError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(HttpDownloader {
            client: builder.build()?,
            max_bytes,
        })
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    #[instrument(name = "download", skip(self, destination), fields(bytes))]
    async fn fetch(&self, url: &str, destination: &Path) -> Result<u64, DownloadError> {
        let response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status { status });
        }

        if let (Some(limit), Some(length)) = (self.max_bytes, response.content_length()) {
            if length > limit {
                return Err(DownloadError::TooLarge { limit });
            }
        }

        let mut file = tokio::fs::File::create(destination).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            if let Some(limit) = self.max_bytes {
                if written > limit {
                    return Err(DownloadError::TooLarge { limit });
                }
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        tracing::Span::current().record("bytes", written);
        debug!(path = %destination.display(), "Download finished");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response and return the base url.
    async fn serve_once(status_line: &'static str, body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 4096];
            let _ = socket.read(&mut request).await;
            let head = format!(
                "HTTP/1.1 {status_line}\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\nConnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn writes_body_to_destination() {
        let base = serve_once("200 OK", b"RIFF-not-really-audio").await;
        let tmp = tempfile::tempdir().unwrap();
        let destination = tmp.path().join("track.wav");

        let downloader = HttpDownloader::new(Some(Duration::from_secs(5)), None).unwrap();
        let written = downloader
            .fetch(&format!("{base}/track.wav"), &destination)
            .await
            .unwrap();

        assert_eq!(written, 21);
        assert_eq!(std::fs::read(&destination).unwrap(), b"RIFF-not-really-audio");
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let base = serve_once("404 Not Found", b"").await;
        let tmp = tempfile::tempdir().unwrap();

        let downloader = HttpDownloader::new(None, None).unwrap();
        let err = downloader
            .fetch(&format!("{base}/missing.wav"), &tmp.path().join("missing.wav"))
            .await
            .unwrap_err();

        assert!(
            matches!(err, DownloadError::Status { status } if status == reqwest::StatusCode::NOT_FOUND)
        );
    }

    #[tokio::test]
    async fn oversized_body_is_refused() {
        let base = serve_once("200 OK", b"0123456789").await;
        let tmp = tempfile::tempdir().unwrap();

        let downloader = HttpDownloader::new(None, Some(4)).unwrap();
        let err = downloader
            .fetch(&base, &tmp.path().join("big.wav"))
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::TooLarge { limit: 4 }));
    }

    #[tokio::test]
    async fn unreachable_host_is_a_request_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let tmp = tempfile::tempdir().unwrap();

        let downloader = HttpDownloader::new(Some(Duration::from_secs(5)), None).unwrap();
        let err = downloader
            .fetch(&format!("http://{addr}/x.wav"), &tmp.path().join("x.wav"))
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::Request(_)));
    }

    #[tokio::test]
    async fn malformed_url_is_a_request_error() {
        let tmp = tempfile::tempdir().unwrap();
        let downloader = HttpDownloader::new(None, None).unwrap();
        let err = downloader
            .fetch("not a url", &tmp.path().join("x.wav"))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Request(_)));
    }
}
