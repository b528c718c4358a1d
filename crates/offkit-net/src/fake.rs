//! Scripted in-process transport for tests.

use std::collections::{HashMap, VecDeque};
use std::future::pending;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, StatusCode};
use parking_lot::Mutex;

use crate::{NetError, NetRequest, NetResponse, Transport};

/// What a route does when called.
#[derive(Debug, Clone)]
pub enum FakeReply {
    /// Respond with a status, headers and body.
    Respond {
        status: StatusCode,
        headers: HashMap<String, String>,
        body: Bytes,
    },
    /// Fail with a connection error.
    Fail,
    /// Respond after a delay.
    Delayed(Duration, Box<FakeReply>),
    /// Never complete.
    Hang,
}

impl FakeReply {
    /// A `200 OK` with the given body.
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::status(StatusCode::OK, body)
    }

    /// Any status with the given body.
    pub fn status(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self::Respond {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }
}

/// A recorded call.
#[derive(Debug, Clone)]
pub struct FakeCall {
    pub method: Method,
    pub url: String,
    pub body: Option<Bytes>,
}

/// Transport whose answers are scripted per URL.
///
/// Unknown URLs answer `404`. While offline every call fails with
/// [`NetError::Offline`].
#[derive(Debug, Default)]
pub struct FakeTransport {
    routes: Mutex<HashMap<String, FakeReply>>,
    queued: Mutex<HashMap<String, VecDeque<FakeReply>>>,
    calls: Mutex<Vec<FakeCall>>,
    offline: AtomicBool,
}

impl FakeTransport {
    /// Create an online transport with no routes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the standing reply for a URL.
    pub fn route(&self, url: &str, reply: FakeReply) {
        self.routes.lock().insert(url.to_string(), reply);
    }

    /// Shorthand for a `200 OK` route.
    pub fn respond(&self, url: &str, body: impl Into<Bytes>) {
        self.route(url, FakeReply::ok(body));
    }

    /// Queue one-shot replies used before the standing route.
    pub fn then(&self, url: &str, reply: FakeReply) {
        self.queued
            .lock()
            .entry(url.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Take the network down or bring it back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// All calls made so far, in order.
    pub fn calls(&self) -> Vec<FakeCall> {
        self.calls.lock().clone()
    }

    /// Number of calls made to a URL.
    pub fn calls_to(&self, url: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.url == url).count()
    }

    fn next_reply(&self, url: &str) -> FakeReply {
        if let Some(reply) = self.queued.lock().get_mut(url).and_then(|q| q.pop_front()) {
            return reply;
        }
        self.routes
            .lock()
            .get(url)
            .cloned()
            .unwrap_or_else(|| FakeReply::status(StatusCode::NOT_FOUND, ""))
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn fetch(&self, request: NetRequest) -> Result<NetResponse, NetError> {
        let url = request.url.to_string();
        self.calls.lock().push(FakeCall {
            method: request.method.clone(),
            url: url.clone(),
            body: request.body.clone(),
        });

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Offline);
        }

        let mut reply = self.next_reply(&url);
        loop {
            match reply {
                FakeReply::Respond {
                    status,
                    headers,
                    body,
                } => {
                    return Ok(NetResponse {
                        url: request.url,
                        status,
                        headers,
                        body,
                    })
                }
                FakeReply::Fail => return Err(NetError::Connect(format!("scripted failure: {url}"))),
                FakeReply::Delayed(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    reply = *inner;
                }
                FakeReply::Hang => return pending().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn get(url: &str) -> NetRequest {
        NetRequest::get(Url::parse(url).unwrap())
    }

    #[tokio::test]
    async fn test_queued_replies_come_first() {
        let transport = FakeTransport::new();
        transport.respond("https://shop.test/a", "standing");
        transport.then("https://shop.test/a", FakeReply::Fail);

        assert!(transport.fetch(get("https://shop.test/a")).await.is_err());
        let second = transport.fetch(get("https://shop.test/a")).await.unwrap();
        assert_eq!(&second.body[..], b"standing");
        assert_eq!(transport.calls_to("https://shop.test/a"), 2);
    }

    #[tokio::test]
    async fn test_offline_fails_everything() {
        let transport = FakeTransport::new();
        transport.respond("https://shop.test/", "home");
        transport.set_offline(true);

        let err = transport.fetch(get("https://shop.test/")).await.unwrap_err();
        assert!(err.is_connectivity());
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let transport = FakeTransport::new();
        let response = transport.fetch(get("https://shop.test/missing")).await.unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }
}
