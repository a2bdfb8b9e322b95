//! Integration tests for the telemetry query client
//!
//! Each test serves one canned HTTP response from a loopback listener and
//! checks the request the client sent.

#[cfg(test)]
mod history_client_tests {
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use telemetry_stream::history::{
        load_history, FetchError, StaticToken, TelemetryClient, TelemetrySource,
    };
    use telemetry_stream::{Measurements, Scope};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    struct CapturedRequest {
        head: String,
        body: String,
    }

    impl CapturedRequest {
        fn request_line(&self) -> &str {
            self.head.lines().next().unwrap_or_default()
        }

        fn header(&self, name: &str) -> Option<String> {
            self.head.lines().skip(1).find_map(|line| {
                let (key, value) = line.split_once(':')?;
                key.trim()
                    .eq_ignore_ascii_case(name)
                    .then(|| value.trim().to_string())
            })
        }
    }

    /// Serve a single response and hand back the request that was received
    async fn serve_once(status: &str, body: &str) -> (String, oneshot::Receiver<CapturedRequest>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];

            let head_end = loop {
                let n = socket.read(&mut chunk).await.unwrap();
                assert!(n > 0, "client closed before sending headers");
                buf.extend_from_slice(&chunk[..n]);
                if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos;
                }
            };
            let head = String::from_utf8_lossy(&buf[..head_end]).to_string();

            let content_length = head
                .lines()
                .filter_map(|line| line.split_once(':'))
                .find(|(key, _)| key.trim().eq_ignore_ascii_case("content-length"))
                .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            while buf.len() < head_end + 4 + content_length {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            let body = String::from_utf8_lossy(&buf[head_end + 4..]).to_string();

            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            let _ = tx.send(CapturedRequest { head, body });
        });

        (base_url, rx)
    }

    fn client(base_url: &str, token: Option<&str>) -> TelemetryClient {
        TelemetryClient::new(
            base_url,
            Arc::new(StaticToken(token.map(str::to_string))),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_all_devices_query_passes_token_unmodified() {
        let records = json!([
            { "deviceId": "dev-1", "timestamp": "2024-05-01T10:00:00Z", "payload": "{\"temperature\":21.5}" },
            { "deviceId": "dev-2", "timestamp": 1714557660000i64, "payload": "{\"humidity\":\"44\"}" }
        ]);
        let (base_url, request) = serve_once("200 OK", &records.to_string()).await;
        let client = client(&format!("{}/", base_url), Some("eyJ.abc_DEF-9"));

        let fetched = client.fetch_records(&Scope::AllDevices).await.unwrap();
        assert_eq!(fetched.len(), 2);

        let request = request.await.unwrap();
        assert_eq!(request.request_line(), "GET /api/devices/telemetry HTTP/1.1");
        assert_eq!(
            request.header("authorization").as_deref(),
            Some("Bearer eyJ.abc_DEF-9")
        );
    }

    #[tokio::test]
    async fn test_no_token_sends_no_authorization() {
        let (base_url, request) = serve_once("200 OK", "[]").await;
        let client = client(&base_url, None);

        assert!(client.fetch_records(&Scope::AllDevices).await.unwrap().is_empty());
        assert_eq!(request.await.unwrap().header("authorization"), None);
    }

    #[tokio::test]
    async fn test_device_history_load() {
        let records = json!([
            { "timestamp": [2024, 5, 1, 10, 0, 0, 0], "payload": "{\"temperature\":20.0,\"humidity\":41.0}" },
            { "timestamp": "2024-05-01T10:01:00", "payload": "not json" },
            { "timestamp": "yesterday", "payload": "{}" }
        ]);
        let (base_url, request) = serve_once("200 OK", &records.to_string()).await;
        let client = client(&base_url, Some("t"));
        let scope = Scope::Device("dev-42".to_string());

        let readings = load_history(&client, &scope).await.unwrap();

        assert_eq!(
            request.await.unwrap().request_line(),
            "GET /api/telemetry/device/dev-42 HTTP/1.1"
        );
        assert_eq!(readings.len(), 3);
        assert!(readings.iter().all(|r| r.device_id == "dev-42"));
        assert_eq!(readings[0].temperature(), Some(20.0));
        assert!(!readings[1].is_decoded());
        assert_eq!(readings[1].raw_payload, "not json");
        assert_eq!(readings[2].timestamp, None);
    }

    #[tokio::test]
    async fn test_unauthorized_status() {
        let (base_url, _request) = serve_once("401 Unauthorized", "{}").await;
        let client = client(&base_url, Some("expired"));

        assert_eq!(
            client.fetch_records(&Scope::AllDevices).await,
            Err(FetchError::Unauthorized(401))
        );
    }

    #[tokio::test]
    async fn test_server_error_status() {
        let (base_url, _request) = serve_once("503 Service Unavailable", "{}").await;
        let client = client(&base_url, None);

        assert_eq!(
            client.fetch_records(&Scope::AllDevices).await,
            Err(FetchError::Status(503))
        );
    }

    #[tokio::test]
    async fn test_non_array_body_is_invalid() {
        let (base_url, _request) = serve_once("200 OK", "{\"items\":[]}").await;
        let client = client(&base_url, None);

        assert!(matches!(
            client.fetch_records(&Scope::AllDevices).await,
            Err(FetchError::InvalidBody(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let client = client(&base_url, None);
        assert!(matches!(
            client.fetch_records(&Scope::AllDevices).await,
            Err(FetchError::Request(_))
        ));
    }

    #[tokio::test]
    async fn test_send_telemetry_posts_json() {
        let (base_url, request) = serve_once("200 OK", "").await;
        let client = client(&base_url, Some("abc"));

        client
            .send_telemetry(&Measurements {
                temperature: Some(21.5),
                humidity: Some(40.0),
            })
            .await
            .unwrap();

        let request = request.await.unwrap();
        assert_eq!(request.request_line(), "POST /api/devices/telemetry HTTP/1.1");
        assert_eq!(request.header("authorization").as_deref(), Some("Bearer abc"));
        let body: Value = serde_json::from_str(&request.body).unwrap();
        assert_eq!(body, json!({ "temperature": 21.5, "humidity": 40.0 }));
    }

    #[tokio::test]
    async fn test_send_device_telemetry_posts_payload_string() {
        let (base_url, request) = serve_once("200 OK", "").await;
        let client = client(&base_url, Some("device-token"));

        client
            .send_device_telemetry(&Measurements {
                temperature: Some(19.0),
                humidity: Some(35.5),
            })
            .await
            .unwrap();

        let request = request.await.unwrap();
        assert_eq!(request.request_line(), "POST /api/telemetry/send HTTP/1.1");
        assert_eq!(
            request.header("authorization").as_deref(),
            Some("Bearer device-token")
        );

        let body: Value = serde_json::from_str(&request.body).unwrap();
        let payload = body["payload"].as_str().unwrap();
        let values: Value = serde_json::from_str(payload).unwrap();
        assert_eq!(values, json!({ "temperature": 19.0, "humidity": 35.5 }));
    }
}
