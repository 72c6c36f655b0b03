use reqwest::Url;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{join_url, AuthConfig};
use crate::error::HarnessError;
use crate::suite::Method;
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, RequestBody};

const MAX_AUTH_RETRIES: u32 = 1;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Cookies by name. Attributes (path, expiry, flags) are not tracked: one
/// session talks to one origin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieJar {
    cookies: BTreeMap<String, String>,
}

impl CookieJar {
    /// Stores one `Set-Cookie` header value. An empty value or `Max-Age=0`
    /// deletes the cookie.
    pub fn store(&mut self, set_cookie: &str) {
        let mut attributes = set_cookie.split(';');
        let Some((name, value)) = attributes.next().and_then(|pair| pair.split_once('=')) else {
            return;
        };
        let name = name.trim();
        if name.is_empty() {
            return;
        }
        let expired = attributes.any(|attr| {
            attr.split_once('=').is_some_and(|(key, value)| {
                key.trim().eq_ignore_ascii_case("max-age") && value.trim() == "0"
            })
        });
        let value = value.trim();
        if expired || value.is_empty() {
            self.cookies.remove(name);
        } else {
            self.cookies.insert(name.to_string(), value.to_string());
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn contains_marker(&self, marker: &str) -> bool {
        self.cookies.keys().any(|name| name.contains(marker))
    }

    pub fn remove_matching(&mut self, marker: &str) {
        self.cookies.retain(|name, _| !name.contains(marker));
    }

    pub fn header_value(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        let pairs: Vec<String> = self
            .cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        Some(pairs.join("; "))
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }
}

/// Cookie and token state for one suite run. Never shared between suites.
#[derive(Debug, Clone)]
pub struct Session {
    pub base_url: Url,
    pub csrf_token: Option<String>,
    pub cookies: CookieJar,
    authenticated: bool,
    identity: Option<Value>,
    last_credentials: Option<Credentials>,
}

impl Session {
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// The `user` object echoed by the session endpoint, when verified.
    pub fn identity(&self) -> Option<&Value> {
        self.identity.as_ref()
    }

    pub fn last_credentials(&self) -> Option<&Credentials> {
        self.last_credentials.as_ref()
    }

    pub fn absorb<'a>(&mut self, set_cookies: impl IntoIterator<Item = &'a str>) {
        for cookie in set_cookies {
            self.cookies.store(cookie);
        }
    }
}

pub struct SessionManager {
    transport: Arc<dyn HttpTransport>,
    base_url: Url,
    auth: AuthConfig,
    timeout: Duration,
}

impl SessionManager {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        base_url: Url,
        auth: AuthConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            base_url,
            auth,
            timeout,
        }
    }

    pub fn acquire_anonymous(&self) -> Session {
        Session {
            base_url: self.base_url.clone(),
            csrf_token: None,
            cookies: CookieJar::default(),
            authenticated: false,
            identity: None,
            last_credentials: None,
        }
    }

    /// Builds a request carrying the session's cookies. Used by the
    /// orchestrator for every step so cookie handling stays in one place.
    pub fn request(
        &self,
        session: &Session,
        method: Method,
        path: &str,
        mut headers: Vec<(String, String)>,
        body: RequestBody,
        timeout: Duration,
    ) -> HttpRequest {
        if let Some(cookie) = session.cookies.header_value() {
            headers.push(("cookie".to_string(), cookie));
        }
        HttpRequest {
            method,
            url: join_url(&session.base_url, path),
            headers,
            body,
            timeout,
        }
    }

    async fn exchange(
        &self,
        session: &mut Session,
        method: Method,
        path: &str,
        body: RequestBody,
    ) -> Result<HttpResponse, HarnessError> {
        let request = self.request(session, method, path, Vec::new(), body, self.timeout);
        let response = self.transport.send(request).await?;
        session.absorb(response.set_cookies());
        Ok(response)
    }

    pub async fn fetch_csrf_token(&self, session: &mut Session) -> Result<String, HarnessError> {
        let csrf_path = self.auth.csrf_path.clone();
        let response = self
            .exchange(session, Method::Get, &csrf_path, RequestBody::Empty)
            .await?;
        if response.status != 200 {
            return Err(HarnessError::Protocol(format!(
                "csrf endpoint returned status {}",
                response.status
            )));
        }
        let token = response
            .json()
            .and_then(|body| body.get("csrfToken").and_then(Value::as_str).map(str::to_string))
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                HarnessError::Protocol("csrf response has no csrfToken field".to_string())
            })?;
        debug!("fetched csrf token");
        session.csrf_token = Some(token.clone());
        Ok(token)
    }

    /// Double-submit login. An `Auth` failure is retried once with a freshly
    /// fetched CSRF token; any other failure is returned immediately. A failed
    /// login leaves the session anonymous, whatever identity it held before.
    pub async fn authenticate(
        &self,
        session: &mut Session,
        credentials: &Credentials,
    ) -> Result<(), HarnessError> {
        let mut attempt = 0;
        loop {
            match self.login(session, credentials).await {
                Ok(()) => {
                    session.last_credentials = Some(credentials.clone());
                    info!(email = %credentials.email, "session authenticated");
                    return Ok(());
                }
                Err(HarnessError::Auth(reason)) if attempt < MAX_AUTH_RETRIES => {
                    attempt += 1;
                    warn!(%reason, "authentication failed, retrying with a fresh csrf token");
                    session.csrf_token = None;
                }
                Err(err) => {
                    self.clear_auth(session);
                    return Err(err);
                }
            }
        }
    }

    async fn login(
        &self,
        session: &mut Session,
        credentials: &Credentials,
    ) -> Result<(), HarnessError> {
        let csrf_token = match session.csrf_token.clone() {
            Some(token) => token,
            None => self.fetch_csrf_token(session).await?,
        };
        let form = vec![
            ("email".to_string(), credentials.email.clone()),
            ("password".to_string(), credentials.password.clone()),
            ("csrfToken".to_string(), csrf_token),
            ("callbackUrl".to_string(), session.base_url.to_string()),
            ("redirect".to_string(), "false".to_string()),
            ("json".to_string(), "true".to_string()),
        ];
        let callback_path = self.auth.callback_path.clone();
        let response = self
            .exchange(session, Method::Post, &callback_path, RequestBody::Form(form))
            .await?;
        self.evaluate_callback(session, &response)?;
        if self.auth.verify_session {
            self.verify(session).await?;
        }
        session.authenticated = true;
        Ok(())
    }

    fn evaluate_callback(
        &self,
        session: &Session,
        response: &HttpResponse,
    ) -> Result<(), HarnessError> {
        let marker = self.auth.session_cookie_marker.as_str();
        let cookie_set = response
            .set_cookies()
            .any(|cookie| cookie.split('=').next().is_some_and(|name| name.contains(marker)));

        match response.status {
            301 | 302 | 303 | 307 | 308 => {
                let location = response.header("location").unwrap_or_default();
                if location.contains("error") {
                    Err(HarnessError::Auth(format!(
                        "callback redirected to an error page ({location})"
                    )))
                } else {
                    Ok(())
                }
            }
            200 => {
                let url = response
                    .json()
                    .and_then(|body| body.get("url").and_then(Value::as_str).map(str::to_string));
                match url {
                    Some(url) if url.contains("error") => Err(HarnessError::Auth(format!(
                        "callback reported an error ({url})"
                    ))),
                    Some(_) => Ok(()),
                    None if cookie_set || session.cookies.contains_marker(marker) => Ok(()),
                    None => Err(HarnessError::Auth(
                        "callback returned neither a session cookie nor a redirect".to_string(),
                    )),
                }
            }
            401 | 403 => Err(HarnessError::Auth(format!(
                "credentials rejected with status {}",
                response.status
            ))),
            _ if cookie_set => Ok(()),
            status => Err(HarnessError::Auth(format!(
                "callback returned status {status} without a session cookie"
            ))),
        }
    }

    async fn verify(&self, session: &mut Session) -> Result<(), HarnessError> {
        let session_path = self.auth.session_path.clone();
        let response = self
            .exchange(session, Method::Get, &session_path, RequestBody::Empty)
            .await?;
        if response.status != 200 {
            return Err(HarnessError::Protocol(format!(
                "session endpoint returned status {}",
                response.status
            )));
        }
        let user = response
            .json()
            .and_then(|body| body.get("user").cloned())
            .filter(|user| user.is_object());
        match user {
            Some(user) => {
                session.identity = Some(user);
                Ok(())
            }
            None => Err(HarnessError::Auth(
                "session endpoint reports no active user".to_string(),
            )),
        }
    }

    /// Drops the authenticated marker and auth cookies. Safe to call on an
    /// already anonymous session.
    pub fn invalidate(&self, session: &mut Session) {
        if session.authenticated {
            warn!("session invalidated");
        }
        self.clear_auth(session);
    }

    fn clear_auth(&self, session: &mut Session) {
        session.authenticated = false;
        session.identity = None;
        session.csrf_token = None;
        session
            .cookies
            .remove_matching(&self.auth.session_cookie_marker);
        session
            .cookies
            .remove_matching(&self.auth.csrf_cookie_marker);
    }
}
