//! In-memory transport for testing without network access.
//!
//! Responses are queued per `(method, path)` route. Each call pops the next
//! queued response; the last one is sticky so a route can answer repeated
//! polls. Unrouted requests get a 404. Every request is recorded.
//!
//! ```
//! use apikit::{Method, MockTransport};
//! use serde_json::json;
//!
//! let mock = MockTransport::new();
//! mock.respond(Method::Get, "/files/file-1", 200, json!({"id": "file-1"}));
//! assert!(mock.calls().is_empty());
//! ```

use crate::error::Result;
use crate::transport::{Method, Payload, Request, Response, Transport};
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

type Handler = Box<dyn Fn(&Request) -> Option<Response> + Send + Sync>;

/// A request observed by the mock.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub bearer: String,
    pub payload: Payload,
}

impl RecordedCall {
    /// JSON body of the call, if it had one.
    pub fn json(&self) -> Option<&Value> {
        match &self.payload {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Look up a query parameter.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Default)]
struct MockState {
    routes: HashMap<(Method, String), VecDeque<Response>>,
    calls: Vec<RecordedCall>,
}

/// Mock transport with queued responses and call recording.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    handler: Arc<Mutex<Option<Handler>>>,
}

impl MockTransport {
    /// Create an empty mock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a JSON response for a route.
    pub fn respond(&self, method: Method, path: &str, status: u16, body: Value) {
        self.respond_raw(method, path, Response::json(status, &body));
    }

    /// Queue a raw response for a route.
    pub fn respond_raw(&self, method: Method, path: &str, response: Response) {
        self.lock()
            .routes
            .entry((method, path.to_string()))
            .or_default()
            .push_back(response);
    }

    /// Queue an error response in the platform's error envelope.
    pub fn respond_error(&self, method: Method, path: &str, status: u16, message: &str) {
        self.respond(
            method,
            path,
            status,
            json!({"error": {"message": message, "type": "invalid_request_error"}}),
        );
    }

    /// Install a dynamic handler consulted before the route table.
    ///
    /// Returning `None` falls through to queued routes.
    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&Request) -> Option<Response> + Send + Sync + 'static,
    {
        let mut slot = match self.handler.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(Box::new(handler));
    }

    /// All calls made so far, in order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    /// Calls matching a method, in order.
    pub fn calls_with(&self, method: Method) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.method == method)
            .collect()
    }

    /// Number of calls made to a route.
    pub fn count(&self, method: Method, path: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.method == method && c.path == path)
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Transport for MockTransport {
    fn send(&self, request: &Request) -> Result<Response> {
        self.lock().calls.push(RecordedCall {
            method: request.method,
            path: request.path.clone(),
            query: request.query.clone(),
            bearer: request.bearer.clone(),
            payload: request.payload.clone(),
        });

        let handled = {
            let handler = match self.handler.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            handler.as_ref().and_then(|h| h(request))
        };
        if let Some(response) = handled {
            return Ok(response);
        }

        let mut state = self.lock();
        let queue = state
            .routes
            .get_mut(&(request.method, request.path.clone()));

        let response = match queue {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };

        Ok(response.unwrap_or_else(|| {
            Response::json(
                404,
                &json!({"error": {"message": format!("no mock route for {} {}", request.method, request.path)}}),
            )
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unrouted_is_not_found() {
        let mock = MockTransport::new();
        let response = mock
            .send(&Request::new(Method::Get, "/nothing", "sk"))
            .unwrap();
        assert_eq!(response.status, 404);
        assert_eq!(mock.calls().len(), 1);
    }

    #[test]
    fn test_queue_pops_then_sticks() {
        let mock = MockTransport::new();
        mock.respond(Method::Get, "/runs/1", 200, json!({"status": "queued"}));
        mock.respond(Method::Get, "/runs/1", 200, json!({"status": "completed"}));

        let request = Request::new(Method::Get, "/runs/1", "sk");
        let bodies: Vec<String> = (0..3)
            .map(|_| String::from_utf8(mock.send(&request).unwrap().body).unwrap())
            .collect();

        assert!(bodies[0].contains("queued"));
        assert!(bodies[1].contains("completed"));
        assert!(bodies[2].contains("completed"));
        assert_eq!(mock.count(Method::Get, "/runs/1"), 3);
    }

    #[test]
    fn test_handler_takes_precedence() {
        let mock = MockTransport::new();
        mock.respond(Method::Get, "/x", 200, json!({"from": "route"}));
        mock.set_handler(|req| {
            (req.path == "/x").then(|| Response::json(200, &json!({"from": "handler"})))
        });

        let response = mock.send(&Request::new(Method::Get, "/x", "sk")).unwrap();
        assert!(String::from_utf8(response.body).unwrap().contains("handler"));
    }
}
