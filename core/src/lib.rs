pub mod assertion;
pub mod config;
pub mod context;
pub mod error;
pub mod report;
pub mod runtime;
pub mod session;
pub mod suite;
pub mod template;
pub mod transport;
pub mod validation;

pub use assertion::{check, extract, ResponseKind};
pub use config::{AuthConfig, AuthPolicy, ConfigError, RetryConfig, RunConfig, TimeoutConfig};
pub use context::{Context, WriteConflict};
pub use error::{HarnessError, SuiteError, TransportError};
pub use report::{
    Aggregator, ConsoleRenderer, Counts, CriticalIssue, JsonRenderer, MarkdownRenderer,
    RenderError, Renderer, Report, ReportFormat, SuiteReport,
};
pub use runtime::{CancelHandle, Orchestrator, Outcome, StepResult, SuiteRun};
pub use session::{CookieJar, Credentials, Session, SessionManager};
pub use suite::{
    resolve, BodyAssertions, Expectation, Method, ResponseShape, Step,
    StepAction, Suite, SuiteDefinition, SuiteFile, SuiteSummary, TimeoutClass,
};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
pub use validation::{validate_suite, Diagnostic, DiagnosticLevel};
