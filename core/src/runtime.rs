use futures::future::join_all;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::assertion;
use crate::config::{join_url, AuthPolicy, ConfigError, RunConfig};
use crate::context::Context;
use crate::error::{HarnessError, TransportError};
use crate::session::{Credentials, Session, SessionManager};
use crate::suite::{
    resolve, ConcreteAction, Expectation, Method, Step, StepAction, Suite, TimeoutClass,
};
use crate::template::{SecretMask, TemplateScope};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, RequestBody};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
    Skip,
    Error,
}

/// One recorded step outcome. `fail` means a response arrived but did not
/// match; `error` means no usable response (network failure, timeout).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    pub suite: String,
    pub step: String,
    pub action: String,
    pub outcome: Outcome,
    pub status: Option<u16>,
    pub latency_ms: u64,
    pub diagnostic: Option<String>,
    pub critical: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuiteRun {
    pub suite: String,
    pub results: Vec<StepResult>,
    pub context: Context,
}

/// Suite-level cancellation. Steps already on the wire finish on their own;
/// everything not yet started is skipped.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Orchestrator {
    config: Arc<RunConfig>,
    transport: Arc<dyn HttpTransport>,
    base_url: Url,
    variables: BTreeMap<String, String>,
    mask: SecretMask,
    cancel: CancelHandle,
}

struct SuiteState {
    session: Session,
    context: Context,
    aborted: bool,
    reauth_pending: bool,
    reauth_used: bool,
}

enum Prepared {
    Done(StepResult),
    Request {
        request: HttpRequest,
        equals: BTreeMap<String, Value>,
    },
    Authenticate(Credentials),
    Invalidate,
}

struct Reply {
    response: Result<HttpResponse, TransportError>,
    latency: Duration,
}

impl Orchestrator {
    pub fn new(config: RunConfig, transport: Arc<dyn HttpTransport>) -> Result<Self, ConfigError> {
        let base_url = config.parsed_base_url()?;
        let mut variables = config.variables.clone();
        variables
            .entry("run_id".to_string())
            .or_insert_with(|| OffsetDateTime::now_utc().unix_timestamp_nanos().to_string());
        let mask = SecretMask::new(config.secrets.values());
        Ok(Self {
            config: Arc::new(config),
            transport,
            base_url,
            variables,
            mask,
            cancel: CancelHandle::default(),
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Runs every suite. Each suite gets its own session and context, so
    /// running them concurrently needs no coordination.
    pub async fn run_all(&self, suites: &[Suite]) -> Vec<SuiteRun> {
        if let Some(path) = &self.config.preflight_path {
            if let Err(err) = self.preflight(path).await {
                warn!(error = %self.mask.mask(&err.to_string()), "target unreachable, skipping all suites");
                return suites
                    .iter()
                    .map(|suite| self.skip_suite(suite, "target unreachable"))
                    .collect();
            }
        }

        if self.config.concurrent_suites {
            join_all(suites.iter().map(|suite| self.run_suite(suite))).await
        } else {
            let mut runs = Vec::with_capacity(suites.len());
            for suite in suites {
                runs.push(self.run_suite(suite).await);
            }
            runs
        }
    }

    async fn preflight(&self, path: &str) -> Result<(), HarnessError> {
        let request = HttpRequest {
            method: Method::Get,
            url: join_url(&self.base_url, path),
            headers: Vec::new(),
            body: RequestBody::Empty,
            timeout: self.config.timeout_for(TimeoutClass::Structural, None),
        };
        let reply = self.dispatch(request).await;
        reply.response.map(|_| ()).map_err(HarnessError::from)
    }

    fn skip_suite(&self, suite: &Suite, reason: &str) -> SuiteRun {
        SuiteRun {
            suite: suite.name().to_string(),
            results: suite
                .steps()
                .iter()
                .map(|step| self.skipped(suite, step, reason))
                .collect(),
            context: Context::default(),
        }
    }

    pub async fn run_suite(&self, suite: &Suite) -> SuiteRun {
        info!(suite = suite.name(), steps = suite.steps().len(), "suite started");
        for warning in suite.warnings() {
            warn!(
                suite = suite.name(),
                location = warning.location.as_deref().unwrap_or_default(),
                "{}",
                warning.message
            );
        }

        let manager = SessionManager::new(
            self.transport.clone(),
            self.base_url.clone(),
            self.config.auth.clone(),
            self.config.timeout_for(TimeoutClass::Structural, None),
        );
        let mut state = SuiteState {
            session: manager.acquire_anonymous(),
            context: Context::default(),
            aborted: false,
            reauth_pending: false,
            reauth_used: false,
        };

        let steps = suite.steps();
        let mut results = Vec::with_capacity(steps.len());
        let mut index = 0;
        while index < steps.len() {
            if state.reauth_pending {
                self.reauthenticate(&manager, &mut state).await;
            }
            let end = if self.config.parallel {
                batch_end(steps, index)
            } else {
                index + 1
            };
            if end - index > 1 {
                let batch = self
                    .run_batch(suite, &steps[index..end], &manager, &mut state)
                    .await;
                results.extend(batch);
            } else {
                let result = self.run_step(suite, &steps[index], &manager, &mut state).await;
                results.push(result);
            }
            index = end;
        }

        let run = SuiteRun {
            suite: suite.name().to_string(),
            results,
            context: state.context,
        };
        info!(
            suite = suite.name(),
            passed = run.count(Outcome::Pass),
            failed = run.count(Outcome::Fail),
            skipped = run.count(Outcome::Skip),
            errored = run.count(Outcome::Error),
            "suite finished"
        );
        run
    }

    async fn run_step(
        &self,
        suite: &Suite,
        step: &Step,
        manager: &SessionManager,
        state: &mut SuiteState,
    ) -> StepResult {
        let prepared = self.prepare(suite, step, manager, state);
        self.perform(suite, step, manager, state, prepared).await
    }

    async fn perform(
        &self,
        suite: &Suite,
        step: &Step,
        manager: &SessionManager,
        state: &mut SuiteState,
        prepared: Prepared,
    ) -> StepResult {
        match prepared {
            Prepared::Done(result) => result,
            Prepared::Request { request, equals } => {
                debug!(suite = suite.name(), step = %step.id, url = %request.url, "dispatching step");
                let reply = self.dispatch(request).await;
                self.apply(suite, step, manager, state, &equals, reply)
            }
            Prepared::Authenticate(credentials) => {
                debug!(suite = suite.name(), step = %step.id, "authenticating");
                let started = Instant::now();
                let result = manager.authenticate(&mut state.session, &credentials).await;
                self.authenticated(suite, step, &state.session, result, started.elapsed())
            }
            Prepared::Invalidate => {
                manager.invalidate(&mut state.session);
                self.finish(suite, step, Outcome::Pass, None, Duration::ZERO, Some("session cleared".to_string()))
            }
        }
    }

    /// Independent steps share one snapshot of session and context; workers
    /// only send, and every write is merged here after the join in declared
    /// order.
    async fn run_batch(
        &self,
        suite: &Suite,
        steps: &[Step],
        manager: &SessionManager,
        state: &mut SuiteState,
    ) -> Vec<StepResult> {
        debug!(suite = suite.name(), size = steps.len(), "dispatching independent batch");
        let mut slots: Vec<Option<StepResult>> = vec![None; steps.len()];
        let mut pending = Vec::new();

        for (slot, step) in steps.iter().enumerate() {
            match self.prepare(suite, step, manager, state) {
                Prepared::Request { request, equals } => pending.push((slot, request, equals)),
                prepared => {
                    slots[slot] = Some(self.perform(suite, step, manager, state, prepared).await)
                }
            }
        }

        let replies = join_all(pending.into_iter().map(|(slot, request, equals)| async move {
            (slot, equals, self.dispatch(request).await)
        }))
        .await;

        for (slot, equals, reply) in replies {
            slots[slot] = Some(self.apply(suite, &steps[slot], manager, state, &equals, reply));
        }

        slots.into_iter().flatten().collect()
    }

    fn prepare(
        &self,
        suite: &Suite,
        step: &Step,
        manager: &SessionManager,
        state: &SuiteState,
    ) -> Prepared {
        if let Some(reason) = self.gate(step, state) {
            debug!(suite = suite.name(), step = %step.id, %reason, "step skipped");
            return Prepared::Done(self.skipped(suite, step, &reason));
        }

        let scope = TemplateScope {
            context: &state.context,
            variables: &self.variables,
            secrets: &self.config.secrets,
        };
        let resolved = match resolve(step, scope) {
            Ok(resolved) => resolved,
            Err(err) => {
                return Prepared::Done(self.finish(
                    suite,
                    step,
                    Outcome::Error,
                    None,
                    Duration::ZERO,
                    Some(err.to_string()),
                ))
            }
        };

        match resolved.action {
            ConcreteAction::Request(request) => Prepared::Request {
                request: manager.request(
                    &state.session,
                    request.method,
                    &request.path,
                    request.headers,
                    request.body,
                    self.config.timeout_for(step.timeout, step.timeout_ms),
                ),
                equals: resolved.equals,
            },
            ConcreteAction::Authenticate(credentials) => Prepared::Authenticate(credentials),
            ConcreteAction::Invalidate => Prepared::Invalidate,
        }
    }

    fn gate(&self, step: &Step, state: &SuiteState) -> Option<String> {
        if self.cancel.is_cancelled() {
            return Some("suite cancelled".to_string());
        }
        if state.aborted {
            return Some("suite aborted: session invalidated".to_string());
        }
        let missing = state.context.missing(&step.reads);
        if !missing.is_empty() {
            let keys: Vec<String> = missing.iter().map(|key| format!("'{key}'")).collect();
            let noun = if keys.len() == 1 { "key" } else { "keys" };
            return Some(format!(
                "prerequisite unmet: missing context {noun} {}",
                keys.join(", ")
            ));
        }
        if step.requires_auth && !step.is_authenticate() && !state.session.is_authenticated() {
            return Some("prerequisite unmet: no authenticated session".to_string());
        }
        None
    }

    async fn dispatch(&self, request: HttpRequest) -> Reply {
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            match self.transport.send(request.clone()).await {
                Ok(response) => {
                    return Reply {
                        response: Ok(response),
                        latency: started.elapsed(),
                    }
                }
                Err(err) if attempt < self.config.retry.max_retries && !self.cancel.is_cancelled() => {
                    attempt += 1;
                    let backoff = self.config.backoff_for(attempt);
                    warn!(url = %request.url, attempt, error = %err, "transport failure, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => {
                    return Reply {
                        response: Err(err),
                        latency: started.elapsed(),
                    }
                }
            }
        }
    }

    fn apply(
        &self,
        suite: &Suite,
        step: &Step,
        manager: &SessionManager,
        state: &mut SuiteState,
        equals: &BTreeMap<String, Value>,
        reply: Reply,
    ) -> StepResult {
        let response = match reply.response {
            Ok(response) => response,
            Err(err) => {
                let err = HarnessError::from(err);
                return self.finish(suite, step, Outcome::Error, None, reply.latency, Some(err.to_string()));
            }
        };
        state.session.absorb(response.set_cookies());
        let status = Some(response.status);

        if let Err(err) = assertion::check(&step.expect, &step.assert, equals, &response) {
            if matches!(response.status, 401 | 403) {
                self.on_unauthorized(suite, step, manager, state);
            }
            return self.finish(suite, step, Outcome::Fail, status, reply.latency, Some(err.to_string()));
        }

        if response.is_success() {
            let writes = match assertion::extract(&step.extract, &response) {
                Ok(writes) => writes,
                Err(err) => {
                    return self.finish(suite, step, Outcome::Fail, status, reply.latency, Some(err.to_string()))
                }
            };
            for (key, value) in writes {
                if let Err(err) = state.context.insert(key, value, step.overwrite) {
                    return self.finish(suite, step, Outcome::Fail, status, reply.latency, Some(err.to_string()));
                }
            }
        }

        self.finish(suite, step, Outcome::Pass, status, reply.latency, None)
    }

    fn on_unauthorized(
        &self,
        suite: &Suite,
        step: &Step,
        manager: &SessionManager,
        state: &mut SuiteState,
    ) {
        if !state.session.is_authenticated() {
            return;
        }
        warn!(suite = suite.name(), step = %step.id, "request rejected on an authenticated session, invalidating it");
        manager.invalidate(&mut state.session);
        match self.config.auth.policy {
            AuthPolicy::Abort => state.aborted = true,
            AuthPolicy::Reauthenticate if !state.reauth_used => state.reauth_pending = true,
            AuthPolicy::Reauthenticate => {}
        }
    }

    async fn reauthenticate(&self, manager: &SessionManager, state: &mut SuiteState) {
        state.reauth_pending = false;
        state.reauth_used = true;
        if self.cancel.is_cancelled() {
            return;
        }
        let Some(credentials) = state.session.last_credentials().cloned() else {
            return;
        };
        match manager.authenticate(&mut state.session, &credentials).await {
            Ok(()) => info!("session re-established"),
            Err(err) => warn!(error = %self.mask.mask(&err.to_string()), "re-authentication failed"),
        }
    }

    fn authenticated(
        &self,
        suite: &Suite,
        step: &Step,
        session: &Session,
        result: Result<(), HarnessError>,
        latency: Duration,
    ) -> StepResult {
        let expects_rejection = matches!(step.expect, Expectation::MustFail(_));
        let tolerant = matches!(step.expect, Expectation::MayFail);
        match result {
            Ok(()) if expects_rejection => self.finish(
                suite,
                step,
                Outcome::Fail,
                None,
                latency,
                Some("authentication succeeded but was expected to be rejected".to_string()),
            ),
            Ok(()) => {
                let echo = session
                    .identity()
                    .and_then(|user| user.get("email").or_else(|| user.get("name")))
                    .and_then(Value::as_str)
                    .map(|who| format!("authenticated as {who}"));
                self.finish(suite, step, Outcome::Pass, None, latency, echo)
            }
            Err(err @ HarnessError::Transport(_)) => {
                self.finish(suite, step, Outcome::Error, None, latency, Some(err.to_string()))
            }
            Err(err) if expects_rejection || tolerant => {
                self.finish(suite, step, Outcome::Pass, None, latency, Some(err.to_string()))
            }
            Err(err) => self.finish(suite, step, Outcome::Fail, None, latency, Some(err.to_string())),
        }
    }

    fn skipped(&self, suite: &Suite, step: &Step, reason: &str) -> StepResult {
        self.finish(suite, step, Outcome::Skip, None, Duration::ZERO, Some(reason.to_string()))
    }

    fn finish(
        &self,
        suite: &Suite,
        step: &Step,
        outcome: Outcome,
        status: Option<u16>,
        latency: Duration,
        diagnostic: Option<String>,
    ) -> StepResult {
        StepResult {
            suite: suite.name().to_string(),
            step: step.id.clone(),
            action: self.mask.mask(&step.action.label()),
            outcome,
            status,
            latency_ms: u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
            diagnostic: diagnostic.map(|message| self.mask.mask(&message)),
            critical: step.critical || self.config.is_critical(suite.name(), &step.id),
        }
    }
}

/// End (exclusive) of the batch starting at `start`: consecutive independent
/// request steps where no step reads or writes a key another one writes.
fn batch_end(steps: &[Step], start: usize) -> usize {
    if !batchable(&steps[start]) {
        return start + 1;
    }
    let mut writes: BTreeSet<&str> = steps[start].writes().collect();
    let mut reads: BTreeSet<&str> = steps[start].reads.iter().map(String::as_str).collect();
    let mut end = start + 1;
    while end < steps.len() && batchable(&steps[end]) {
        let step = &steps[end];
        let step_writes: BTreeSet<&str> = step.writes().collect();
        let overlaps = step.reads.iter().any(|key| writes.contains(key.as_str()))
            || step_writes.iter().any(|key| writes.contains(key) || reads.contains(key));
        if overlaps {
            break;
        }
        writes.extend(step_writes);
        reads.extend(step.reads.iter().map(String::as_str));
        end += 1;
    }
    end
}

fn batchable(step: &Step) -> bool {
    step.independent && matches!(step.action, StepAction::Request(_))
}

impl SuiteRun {
    pub fn count(&self, outcome: Outcome) -> usize {
        self.results
            .iter()
            .filter(|result| result.outcome == outcome)
            .count()
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Outcome::Pass => "pass",
            Outcome::Fail => "fail",
            Outcome::Skip => "skip",
            Outcome::Error => "error",
        };
        write!(f, "{label}")
    }
}

impl fmt::Display for SuiteRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.results.is_empty() {
            writeln!(f, "Suite {}: no steps.", self.suite)?;
            return Ok(());
        }

        writeln!(f, "Suite {}:", self.suite)?;
        for result in &self.results {
            let status = result
                .status
                .map(|status| format!(" {status}"))
                .unwrap_or_default();
            writeln!(
                f,
                "  - [{}] {} {}{} ({}ms)",
                result.outcome, result.step, result.action, status, result.latency_ms
            )?;
            if let Some(message) = &result.diagnostic {
                for line in message.lines() {
                    writeln!(f, "      {}", line)?;
                }
            }
        }
        Ok(())
    }
}
