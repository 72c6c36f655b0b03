use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::redirect::Policy;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::TransportError;
use crate::suite::Method;

#[derive(Debug, Clone, PartialEq, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(Value),
    Form(Vec<(String, String)>),
    Multipart(Vec<MultipartPart>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MultipartPart {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub source: PartSource,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PartSource {
    Text(String),
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
    pub timeout: Duration,
}

/// Header names are lowercased when the response is captured.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_ascii_lowercase(), value.into()));
        self
    }

    pub fn with_json(mut self, body: &Value) -> Self {
        self.body = body.to_string().into_bytes();
        self.with_header("content-type", "application/json")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn set_cookies(&self) -> impl Iterator<Item = &str> {
        self.headers
            .iter()
            .filter(|(key, _)| key == "set-cookie")
            .map(|(_, value)| value.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parses the body as JSON; `None` when the body is empty or not JSON.
    pub fn json(&self) -> Option<Value> {
        if self.body.is_empty() {
            return None;
        }
        serde_json::from_slice(&self.body).ok()
    }
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Redirects are never followed: the credentials callback signals success
/// with a 302 whose Location must be inspected.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = Client::builder()
            .redirect(Policy::none())
            .build()
            .map_err(|err| TransportError::Network {
                url: String::new(),
                message: err.to_string(),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let url = request.url.to_string();
        let timeout = request.timeout;
        let mut builder = self
            .client
            .request(reqwest_method(request.method), request.url)
            .timeout(timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Form(fields) => builder.form(&fields),
            RequestBody::Multipart(parts) => builder.multipart(multipart_form(parts).await?),
        };

        let response = builder
            .send()
            .await
            .map_err(|err| classify(&url, timeout, err))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_ascii_lowercase(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|err| classify(&url, timeout, err))?
            .to_vec();

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

fn reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
    }
}

fn classify(url: &str, timeout: Duration, err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout {
            url: url.to_string(),
            timeout_ms: timeout.as_millis(),
        }
    } else {
        TransportError::Network {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}

async fn multipart_form(parts: Vec<MultipartPart>) -> Result<Form, TransportError> {
    let mut form = Form::new();
    for part in parts {
        let mut body = match part.source {
            PartSource::Text(text) => match part.filename {
                Some(name) => Part::text(text).file_name(name),
                None => Part::text(text),
            },
            PartSource::File(path) => {
                let bytes = tokio::fs::read(&path).await.map_err(|err| {
                    TransportError::Body(format!("cannot read {}: {err}", path.display()))
                })?;
                let fallback = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned());
                match part.filename.or(fallback) {
                    Some(name) => Part::bytes(bytes).file_name(name),
                    None => Part::bytes(bytes),
                }
            }
        };
        if let Some(content_type) = &part.content_type {
            body = body
                .mime_str(content_type)
                .map_err(|err| TransportError::Body(format!("invalid content type: {err}")))?;
        }
        form = form.part(part.name, body);
    }
    Ok(form)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    type Reply = Result<HttpResponse, TransportError>;

    /// In-memory transport: replies are scripted per method and path, and
    /// every request is recorded. The last scripted reply for a route repeats.
    #[derive(Default)]
    pub struct ScriptedTransport {
        routes: Mutex<HashMap<(Method, String), VecDeque<Reply>>>,
        calls: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn on(&self, method: Method, path: &str, reply: Reply) -> &Self {
            self.routes
                .lock()
                .expect("routes lock")
                .entry((method, path.to_string()))
                .or_default()
                .push_back(reply);
            self
        }

        pub fn respond(&self, method: Method, path: &str, response: HttpResponse) -> &Self {
            self.on(method, path, Ok(response))
        }

        /// Drops any replies scripted so far for the route.
        pub fn replace(&self, method: Method, path: &str, response: HttpResponse) -> &Self {
            self.routes
                .lock()
                .expect("routes lock")
                .insert((method, path.to_string()), VecDeque::from([Ok(response)]));
            self
        }

        pub fn fail_with(&self, method: Method, path: &str, error: TransportError) -> &Self {
            self.routes
                .lock()
                .expect("routes lock")
                .insert((method, path.to_string()), VecDeque::from([Err(error)]));
            self
        }

        pub fn calls(&self) -> Vec<HttpRequest> {
            self.calls.lock().expect("calls lock").clone()
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().expect("calls lock").len()
        }

        pub fn calls_to(&self, method: Method, path: &str) -> usize {
            self.calls
                .lock()
                .expect("calls lock")
                .iter()
                .filter(|call| call.method == method && call.url.path() == path)
                .count()
        }

        /// Registers the csrf, callback and session endpoints for a login
        /// that succeeds with a session cookie.
        pub fn with_login(&self, email: &str) -> &Self {
            self.respond(
                Method::Get,
                "/api/auth/csrf",
                HttpResponse::new(200)
                    .with_header("set-cookie", "next-auth.csrf-token=abc%7Chash; Path=/")
                    .with_json(&serde_json::json!({ "csrfToken": "abc" })),
            );
            self.respond(
                Method::Post,
                "/api/auth/callback/credentials",
                HttpResponse::new(200)
                    .with_header(
                        "set-cookie",
                        "next-auth.session-token=sess-1; Path=/; HttpOnly",
                    )
                    .with_json(&serde_json::json!({ "url": "http://localhost:3000/" })),
            );
            self.respond(
                Method::Get,
                "/api/auth/session",
                HttpResponse::new(200)
                    .with_json(&serde_json::json!({ "user": { "email": email } })),
            )
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
            let key = (request.method, request.url.path().to_string());
            self.calls.lock().expect("calls lock").push(request);
            let mut routes = self.routes.lock().expect("routes lock");
            match routes.get_mut(&key) {
                Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_else(not_found),
                Some(queue) => queue.front().cloned().unwrap_or_else(not_found),
                None => not_found(),
            }
        }
    }

    fn not_found() -> Reply {
        Ok(HttpResponse::new(404).with_json(&serde_json::json!({ "error": "Not found" })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn response_helpers_read_headers_and_json() {
        let response = HttpResponse::new(200)
            .with_header("Set-Cookie", "a=1; Path=/")
            .with_header("set-cookie", "b=2")
            .with_json(&json!({ "ok": true }));
        assert_eq!(response.content_type(), Some("application/json"));
        assert_eq!(response.set_cookies().collect::<Vec<_>>(), vec!["a=1; Path=/", "b=2"]);
        assert_eq!(response.json(), Some(json!({ "ok": true })));
        assert!(response.is_success());
    }

    #[test]
    fn non_json_body_parses_to_none() {
        let mut response = HttpResponse::new(200).with_header("content-type", "audio/mpeg");
        response.body = vec![0xff, 0xfb, 0x90];
        assert_eq!(response.json(), None);
        assert_eq!(HttpResponse::new(204).json(), None);
    }

    #[test]
    fn part_source_uses_tagged_form() {
        let file: PartSource =
            serde_json::from_value(json!({ "file": "fixtures/resume.pdf" })).expect("parses");
        assert_eq!(file, PartSource::File(PathBuf::from("fixtures/resume.pdf")));
        let text: PartSource = serde_json::from_value(json!({ "text": "hello" })).expect("parses");
        assert_eq!(text, PartSource::Text("hello".to_string()));
    }

    #[tokio::test]
    async fn multipart_reports_missing_file_as_body_error() {
        let result = multipart_form(vec![MultipartPart {
            name: "file".to_string(),
            filename: None,
            content_type: Some("application/pdf".to_string()),
            source: PartSource::File(PathBuf::from("/definitely/not/here.pdf")),
        }])
        .await;
        assert!(matches!(result, Err(TransportError::Body(_))));
    }
}
