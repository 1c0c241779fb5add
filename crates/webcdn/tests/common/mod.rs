//! Shared test infrastructure for webcdn integration tests
//!
//! Provides:
//! - TestOrigin: axum server standing in for the fallback origin
//! - TestCoordinator: minimal websocket coordinator (lookup, update, relay)

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {}", what);
}

/// Fallback origin serving fixed bodies by path
pub mod test_origin {
    use axum::extract::State;
    use axum::http::{StatusCode, Uri};
    use axum::response::{IntoResponse, Response};
    use axum::Router;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct OriginState {
        files: Arc<HashMap<String, Bytes>>,
        hits: Arc<Mutex<Vec<String>>>,
    }

    pub struct TestOrigin {
        pub addr: SocketAddr,
        state: OriginState,
    }

    impl TestOrigin {
        pub async fn start(files: Vec<(&str, Bytes)>) -> Self {
            let state = OriginState {
                files: Arc::new(
                    files
                        .into_iter()
                        .map(|(path, body)| (path.to_string(), body))
                        .collect(),
                ),
                hits: Arc::default(),
            };
            let app = Router::new().fallback(serve).with_state(state.clone());

            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });
            Self { addr, state }
        }

        pub fn url(&self, path: &str) -> String {
            format!("http://{}{}", self.addr, path)
        }

        /// Paths requested so far
        pub fn hits(&self) -> Vec<String> {
            self.state.hits.lock().unwrap().clone()
        }
    }

    async fn serve(State(state): State<OriginState>, uri: Uri) -> Response {
        state.hits.lock().unwrap().push(uri.path().to_string());
        match state.files.get(uri.path()) {
            Some(body) => (StatusCode::OK, body.clone()).into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        }
    }
}

/// In-memory coordinator speaking the `{type, data, to?}` protocol
pub mod test_coordinator {
    use futures::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::{mpsc, Mutex};
    use tokio_tungstenite::accept_hdr_async;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::tungstenite::Message;

    #[derive(Default)]
    struct CoordinatorState {
        clients: HashMap<String, mpsc::UnboundedSender<Message>>,
        /// hash -> node ids that announced it
        holders: HashMap<String, Vec<String>>,
        /// (sender, envelope) for everything received
        received: Vec<(String, Value)>,
        answer_lookups: bool,
    }

    #[derive(Clone)]
    pub struct TestCoordinator {
        pub url: String,
        state: Arc<Mutex<CoordinatorState>>,
    }

    impl TestCoordinator {
        pub async fn start() -> Self {
            Self::start_with(true).await
        }

        /// Coordinator that never answers lookups
        pub async fn start_silent() -> Self {
            Self::start_with(false).await
        }

        async fn start_with(answer_lookups: bool) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let state = Arc::new(Mutex::new(CoordinatorState {
                answer_lookups,
                ..Default::default()
            }));

            let accept_state = state.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(handle_connection(stream, accept_state.clone()));
                }
            });

            Self {
                url: format!("ws://{}", addr),
                state,
            }
        }

        /// URL pinning the node id
        pub fn url_for(&self, id: &str) -> String {
            format!("{}/?id={}", self.url, id)
        }

        pub async fn received(&self, kind: &str) -> Vec<(String, Value)> {
            self.state
                .lock()
                .await
                .received
                .iter()
                .filter(|(_, msg)| msg["type"] == kind)
                .cloned()
                .collect()
        }

        pub async fn holders(&self, hash: &str) -> Vec<String> {
            self.state
                .lock()
                .await
                .holders
                .get(hash)
                .cloned()
                .unwrap_or_default()
        }

        pub async fn is_connected(&self, id: &str) -> bool {
            self.state.lock().await.clients.contains_key(id)
        }
    }

    fn node_id(path: &str) -> Option<String> {
        let url = url::Url::parse(&format!("ws://localhost{}", path)).ok()?;
        url.query_pairs()
            .find(|(key, _)| key == "id")
            .map(|(_, value)| value.into_owned())
    }

    async fn handle_connection(stream: TcpStream, state: Arc<Mutex<CoordinatorState>>) {
        let mut path = String::new();
        let capture = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            path = req.uri().to_string();
            Ok(resp)
        };
        let ws_stream = match accept_hdr_async(stream, capture).await {
            Ok(s) => s,
            Err(_) => return,
        };
        let Some(id) = node_id(&path) else {
            return;
        };

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });
        state.lock().await.clients.insert(id.clone(), tx.clone());

        while let Some(Ok(msg)) = read.next().await {
            let text = match msg {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };
            let Ok(envelope) = serde_json::from_str::<Value>(&text) else {
                continue;
            };

            let mut state = state.lock().await;
            state.received.push((id.clone(), envelope.clone()));

            match envelope["type"].as_str().unwrap_or("") {
                "lookup" if state.answer_lookups => {
                    let hash = envelope["data"].as_str().unwrap_or("").to_string();
                    let holder = state
                        .holders
                        .get(&hash)
                        .and_then(|ids| ids.iter().find(|h| **h != id).cloned());
                    let data = match holder {
                        Some(peer) => json!({"hash": hash, "peerid": peer}),
                        None => json!({"hash": hash}),
                    };
                    let reply = json!({"type": "lookup-response", "data": data});
                    let _ = tx.send(Message::Text(reply.to_string()));
                }
                "update" => {
                    if let Some(items) = envelope["data"].as_array() {
                        for item in items {
                            if let Some(hash) = item["hash"].as_str() {
                                state
                                    .holders
                                    .entry(hash.to_string())
                                    .or_default()
                                    .push(id.clone());
                            }
                        }
                    }
                }
                "relay" => {
                    let to = envelope["to"].as_str().unwrap_or("").to_string();
                    let forward = json!({"type": "relay", "from": id, "data": envelope["data"]});
                    if let Some(target) = state.clients.get(&to) {
                        let _ = target.send(Message::Text(forward.to_string()));
                    }
                }
                _ => {}
            }
        }

        state.lock().await.clients.remove(&id);
    }
}
