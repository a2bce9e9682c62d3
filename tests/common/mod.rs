//! Scripted control endpoint
//!
//! A minimal HTTP server driven by canned steps, used to exercise the
//! control client against success, failure, timeout, and hangup behavior
//! while recording every request it sees.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;

use hookbridge::ControlClient;

/// One scripted exchange
pub enum Script {
    /// Respond with the JSON body
    Respond(Value),
    /// Hold the connection open without responding (client-side timeout)
    Silent,
    /// Drop the connection without responding (hard transport failure)
    Hangup,
}

/// A request observed by the endpoint
#[derive(Debug, Clone)]
pub struct Recorded {
    /// Command code parsed from the `?type=` query
    pub command: u32,
    pub body: String,
}

impl Recorded {
    /// Body parsed as JSON, or null for empty/non-JSON bodies
    pub fn json(&self) -> Value {
        serde_json::from_str(&self.body).unwrap_or(Value::Null)
    }
}

pub struct ScriptedEndpoint {
    pub url: String,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl ScriptedEndpoint {
    /// Serve the given steps in request order; once exhausted, every
    /// further request gets a `{"code": 0}` failure response
    pub async fn sequence(steps: Vec<Script>) -> Self {
        let queue = Arc::new(Mutex::new(VecDeque::from(steps)));
        Self::with_responder(move |_req| {
            queue
                .lock()
                .pop_front()
                .unwrap_or_else(|| Script::Respond(serde_json::json!({ "code": 0 })))
        })
        .await
    }

    /// Serve responses computed per request
    pub async fn with_responder(
        responder: impl Fn(&Recorded) -> Script + Send + Sync + 'static,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind scripted endpoint");
        let url = format!("http://{}/", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&requests);
        let responder = Arc::new(responder);

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let log = Arc::clone(&log);
                let responder = Arc::clone(&responder);
                tokio::spawn(async move {
                    let Some(recorded) = read_http_request(&mut stream).await else {
                        return;
                    };
                    log.lock().push(recorded.clone());
                    match responder(&recorded) {
                        Script::Respond(body) => {
                            let body = body.to_string();
                            let response = format!(
                                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                                body.len(),
                                body
                            );
                            let _ = stream.write_all(response.as_bytes()).await;
                        }
                        Script::Silent => {
                            // Outlive any client timeout used in tests
                            sleep(Duration::from_secs(5)).await;
                        }
                        Script::Hangup => {}
                    }
                });
            }
        });

        Self { url, requests }
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().clone()
    }

    /// Command codes in request order
    pub fn commands(&self) -> Vec<u32> {
        self.requests.lock().iter().map(|r| r.command).collect()
    }
}

async fn read_http_request(stream: &mut TcpStream) -> Option<Recorded> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_subsequence(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > 65536 {
            return None;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let command = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|path| path.split("type=").nth(1))
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);
    let content_length: usize = head
        .lines()
        .find(|line| line.to_ascii_lowercase().starts_with("content-length:"))
        .and_then(|line| line.split(':').nth(1))
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(0);

    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    Some(Recorded {
        command,
        body: String::from_utf8_lossy(&body).to_string(),
    })
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Client wired at the scripted endpoint with a short timeout
pub fn test_client(endpoint: &ScriptedEndpoint, max_retries: u32) -> ControlClient {
    ControlClient::new(endpoint.url.clone(), Duration::from_millis(300), max_retries)
}
