use crate::transport::{self, Request, Transport};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Transport that replays a fixed list of responses and records every request.
///
/// Clones share state, so a test can hand one clone to the code under test and
/// inspect the other.
#[derive(Clone, Default)]
pub(crate) struct ScriptedTransport {
    responses: Arc<Mutex<VecDeque<Result<Value, transport::Error>>>>,
    requests: Arc<Mutex<Vec<Request>>>,
    cancel_after: Arc<Mutex<Option<(usize, CancellationToken)>>>,
}

impl ScriptedTransport {
    pub(crate) fn new(responses: Vec<Result<Value, transport::Error>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            ..Default::default()
        }
    }

    /// Cancels `token` once `count` requests have been answered.
    pub(crate) fn cancel_after(self, count: usize, token: CancellationToken) -> Self {
        *self.cancel_after.lock().unwrap() = Some((count, token));
        self
    }

    pub(crate) fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: Request) -> Result<Value, transport::Error> {
        let count = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request);
            requests.len()
        };

        let response = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Err(transport::Error::Http {
                    status: 599,
                    message: "no scripted response".to_string(),
                })
            });

        if let Some((after, token)) = self.cancel_after.lock().unwrap().as_ref() {
            if count >= *after {
                token.cancel();
            }
        }

        response
    }
}

/// A page body with `count` entities under `key`, ids starting at `first_id`.
pub(crate) fn page(key: &str, first_id: i64, count: usize, next: Option<&str>) -> Value {
    let items: Vec<Value> = (0..count as i64)
        .map(|offset| serde_json::json!({"id": first_id + offset, "name": format!("Item {}", first_id + offset)}))
        .collect();
    let mut links = serde_json::json!({"self": {"href": "https://example.amocrm.ru/api/v4/self"}});
    if let Some(next) = next {
        links["next"] = serde_json::json!({"href": next});
    }
    serde_json::json!({
        "_page": 1,
        "_links": links,
        "_embedded": { key: items }
    })
}
