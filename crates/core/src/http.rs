use crate::config::RetryPolicy;
use crate::error::ServiceError;
use reqwest::{RequestBuilder, Response, StatusCode};
use tracing::{debug, warn};

/// Sends the request built by `build`, retrying transient failures.
///
/// Transient means a connection/timeout error or an HTTP 429/5xx status.
/// Any other non-success status is returned as `BackendResponse` with the
/// response body attached.
pub async fn send_with_retry<F>(
    backend: &str,
    policy: RetryPolicy,
    build: F,
) -> Result<Response, ServiceError>
where
    F: Fn() -> RequestBuilder,
{
    let response = send_retrying(backend, policy, build).await?;
    if !response.status().is_success() {
        return Err(rejection(backend, response).await);
    }
    Ok(response)
}

/// Like [`send_with_retry`] but hands back the final response whatever its
/// status, for callers that treat some client errors as answers.
pub async fn send_retrying<F>(
    backend: &str,
    policy: RetryPolicy,
    build: F,
) -> Result<Response, ServiceError>
where
    F: Fn() -> RequestBuilder,
{
    let mut attempt = 0u32;
    loop {
        let outcome = build().send().await;

        let retryable = match &outcome {
            Ok(response) => is_transient_status(response.status()),
            Err(error) => error.is_connect() || error.is_timeout(),
        };

        if retryable && attempt < policy.max_retries {
            attempt += 1;
            let delay = policy.delay_for(attempt);
            match &outcome {
                Ok(response) => warn!(backend, status = %response.status(), attempt, ?delay, "retrying request"),
                Err(error) => warn!(backend, %error, attempt, ?delay, "retrying request"),
            }
            tokio::time::sleep(delay).await;
            continue;
        }

        return Ok(outcome?);
    }
}

/// `BackendResponse` carrying the status line and body of a rejected request.
pub async fn rejection(backend: &str, response: Response) -> ServiceError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    debug!(backend, %status, body = %body, "request rejected");
    ServiceError::backend(backend, format!("{status}: {body}"))
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Loopback HTTP server answering each accepted connection with the next
/// scripted response.
#[cfg(test)]
pub(crate) mod canned {
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// A response written to the socket piece by piece.
    pub(crate) struct Canned {
        pub pieces: Vec<Vec<u8>>,
    }

    impl Canned {
        pub(crate) fn json(status: &str, body: &str) -> Self {
            let head = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                body.len()
            );
            Self {
                pieces: vec![head.into_bytes(), body.as_bytes().to_vec()],
            }
        }

        /// `200 OK` event stream sent with chunked transfer encoding, one HTTP
        /// chunk per entry of `chunks`.
        pub(crate) fn event_stream(chunks: &[&str]) -> Self {
            let mut pieces = vec![b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\nconnection: close\r\n\r\n".to_vec()];
            for chunk in chunks {
                pieces.push(format!("{:x}\r\n{chunk}\r\n", chunk.len()).into_bytes());
            }
            pieces.push(b"0\r\n\r\n".to_vec());
            Self { pieces }
        }
    }

    /// Requests seen by the server, as `"<METHOD> <path>"`.
    pub(crate) type Seen = Arc<Mutex<Vec<String>>>;

    pub(crate) async fn serve(responses: Vec<Canned>) -> std::io::Result<(String, Seen, JoinHandle<()>)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let base = format!("http://{}", listener.local_addr()?);
        let seen: Seen = Arc::default();

        let log = seen.clone();
        let handle = tokio::spawn(async move {
            for response in responses {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let Ok(request_line) = read_request(&mut socket).await else {
                    return;
                };
                if let Ok(mut log) = log.lock() {
                    log.push(request_line);
                }
                for piece in response.pieces {
                    if socket.write_all(&piece).await.is_err() {
                        return;
                    }
                    let _ = socket.flush().await;
                    tokio::task::yield_now().await;
                }
                let _ = socket.shutdown().await;
            }
        });

        Ok((base, seen, handle))
    }

    /// Reads one request (head plus `content-length` body) and returns its
    /// method and path.
    async fn read_request(socket: &mut tokio::net::TcpStream) -> std::io::Result<String> {
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 4096];
        let head_end = loop {
            let read = socket.read(&mut chunk).await?;
            if read == 0 {
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            }
            buffer.extend_from_slice(&chunk[..read]);
            if let Some(position) = buffer.windows(4).position(|window| window == b"\r\n\r\n") {
                break position + 4;
            }
        };

        let head = String::from_utf8_lossy(&buffer[..head_end]).to_string();
        let content_length = head
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);

        let mut body_read = buffer.len() - head_end;
        while body_read < content_length {
            let read = socket.read(&mut chunk).await?;
            if read == 0 {
                break;
            }
            body_read += read;
        }

        let request_line = head.lines().next().unwrap_or_default();
        Ok(request_line.rsplit_once(' ').map(|(line, _)| line).unwrap_or(request_line).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::canned::{serve, Canned};
    use super::*;
    use reqwest::Client;
    use std::time::Duration;

    fn one_quick_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 1,
            base_delay: Duration::ZERO,
        }
    }

    #[test]
    fn rate_limits_and_server_errors_are_transient() {
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient_status(StatusCode::BAD_GATEWAY));
        assert!(!is_transient_status(StatusCode::BAD_REQUEST));
        assert!(!is_transient_status(StatusCode::UNAUTHORIZED));
    }

    #[tokio::test]
    async fn rate_limited_request_succeeds_after_one_retry() -> Result<(), Box<dyn std::error::Error>> {
        let (base, seen, server) = serve(vec![
            Canned::json("429 Too Many Requests", r#"{"error":"slow down"}"#),
            Canned::json("200 OK", r#"{"ok":true}"#),
        ])
        .await?;
        let client = Client::new();
        let url = format!("{base}/v1/embeddings");

        let response = send_with_retry("embeddings", one_quick_retry(), || client.post(&url).body("{}")).await?;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await?, r#"{"ok":true}"#);
        server.await?;
        assert_eq!(seen.lock().map(|seen| seen.len()).unwrap_or_default(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn retries_stop_at_the_policy_limit() -> Result<(), Box<dyn std::error::Error>> {
        let (base, _seen, _server) = serve(vec![
            Canned::json("503 Service Unavailable", "down"),
            Canned::json("503 Service Unavailable", "still down"),
        ])
        .await?;
        let client = Client::new();
        let url = format!("{base}/v1/embeddings");

        let result = send_with_retry("embeddings", one_quick_retry(), || client.get(&url)).await;

        match result {
            Err(ServiceError::BackendResponse { details, .. }) => {
                assert!(details.starts_with("503"));
                assert!(details.contains("still down"));
            }
            other => panic!("expected a backend error, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() -> Result<(), Box<dyn std::error::Error>> {
        let (base, seen, server) = serve(vec![Canned::json(
            "400 Bad Request",
            r#"{"error":{"message":"bad input"}}"#,
        )])
        .await?;
        let client = Client::new();
        let url = format!("{base}/v1/chat/completions");

        let result = send_with_retry("chat", one_quick_retry(), || client.post(&url).body("{}")).await;

        match result {
            Err(ServiceError::BackendResponse { backend, details }) => {
                assert_eq!(backend, "chat");
                assert!(details.starts_with("400 Bad Request"));
                assert!(details.contains("bad input"));
            }
            other => panic!("expected a backend error, got {other:?}"),
        }
        server.await?;
        assert_eq!(seen.lock().map(|seen| seen.len()).unwrap_or_default(), 1);
        Ok(())
    }
}
