use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use crate::error::{HarnessError, SuiteError};
use crate::session::Credentials;
use crate::template::{self, TemplateError, TemplateScope};
use crate::transport::{MultipartPart, PartSource, RequestBody};
use crate::validation::{validate_suite, Diagnostic};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SuiteFile {
    pub suites: Vec<SuiteDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub requires_auth: bool,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    pub action: StepAction,
    pub expect: Expectation,
    #[serde(default)]
    pub assert: BodyAssertions,
    #[serde(default)]
    pub reads: Vec<String>,
    #[serde(default)]
    pub extract: BTreeMap<String, String>,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default)]
    pub requires_auth: bool,
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub independent: bool,
    #[serde(default)]
    pub timeout: TimeoutClass,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepAction {
    Request(RequestTemplate),
    Authenticate(CredentialsTemplate),
    Invalidate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestTemplate {
    pub method: Method,
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: BodyTemplate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsTemplate {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BodyTemplate {
    #[default]
    None,
    Json(Value),
    Form(BTreeMap<String, String>),
    Multipart(Vec<PartTemplate>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartTemplate {
    pub name: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    pub source: PartSource,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Expectation {
    MustSucceed,
    MustFail(u16),
    MayFail,
    AnyOf(Vec<u16>),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct BodyAssertions {
    #[serde(default)]
    pub shape: ResponseShape,
    #[serde(default)]
    pub required_keys: Vec<String>,
    #[serde(default)]
    pub equals: BTreeMap<String, Value>,
    #[serde(default)]
    pub error_contains: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResponseShape {
    #[default]
    Any,
    SuccessEnvelope,
    ErrorEnvelope,
    Binary { content_type: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutClass {
    #[default]
    Structural,
    Generative,
}

/// A suite that passed construction-time validation. Only this type can be
/// handed to the orchestrator.
#[derive(Debug, Clone)]
pub struct Suite {
    definition: SuiteDefinition,
    warnings: Vec<Diagnostic>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConcreteRequest {
    pub method: Method,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConcreteAction {
    Request(ConcreteRequest),
    Authenticate(Credentials),
    Invalidate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedStep {
    pub action: ConcreteAction,
    pub equals: BTreeMap<String, Value>,
}

impl Suite {
    pub fn new(definition: SuiteDefinition) -> Result<Self, SuiteError> {
        let diagnostics = validate_suite(&definition);
        if diagnostics.iter().any(Diagnostic::is_error) {
            return Err(SuiteError {
                suite: definition.name.clone(),
                diagnostics,
            });
        }
        Ok(Self {
            definition,
            warnings: diagnostics,
        })
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn requires_auth(&self) -> bool {
        self.definition.requires_auth
    }

    pub fn steps(&self) -> &[Step] {
        &self.definition.steps
    }

    pub fn warnings(&self) -> &[Diagnostic] {
        &self.warnings
    }

    pub fn definition(&self) -> &SuiteDefinition {
        &self.definition
    }

    pub fn summary(&self) -> SuiteSummary {
        self.definition.summary()
    }
}

impl SuiteDefinition {
    /// Resolves relative multipart file paths against the directory the suite
    /// file was loaded from.
    pub fn rebase_files(&mut self, base_dir: &Path) {
        for step in &mut self.steps {
            if let StepAction::Request(request) = &mut step.action {
                if let BodyTemplate::Multipart(parts) = &mut request.body {
                    for part in parts {
                        if let PartSource::File(path) = &mut part.source {
                            if path.is_relative() {
                                *path = base_dir.join(&*path);
                            }
                        }
                    }
                }
            }
        }
    }

    pub fn summary(&self) -> SuiteSummary {
        SuiteSummary {
            name: self.name.clone(),
            description: self.description.clone(),
            requires_auth: self.requires_auth,
            total_steps: self.steps.len(),
            steps: self
                .steps
                .iter()
                .map(|step| StepSummary {
                    id: step.id.clone(),
                    action: step.action.label(),
                    expect: step.expect.to_string(),
                    reads: step.reads.clone(),
                    writes: step.writes().map(str::to_string).collect(),
                    requires_auth: step.requires_auth,
                    critical: step.critical,
                    independent: step.independent,
                })
                .collect(),
        }
    }
}

impl Step {
    pub fn writes(&self) -> impl Iterator<Item = &str> {
        self.extract.keys().map(String::as_str)
    }

    pub fn is_authenticate(&self) -> bool {
        matches!(self.action, StepAction::Authenticate(_))
    }

    /// Every template string the step carries, used to find placeholder
    /// references at construction time.
    pub fn template_strings(&self) -> Vec<&str> {
        let mut strings = Vec::new();
        match &self.action {
            StepAction::Request(request) => {
                strings.push(request.path.as_str());
                strings.extend(request.headers.values().map(String::as_str));
                match &request.body {
                    BodyTemplate::None | BodyTemplate::Json(_) => {}
                    BodyTemplate::Form(fields) => strings.extend(fields.values().map(String::as_str)),
                    BodyTemplate::Multipart(parts) => {
                        for part in parts {
                            if let PartSource::Text(text) = &part.source {
                                strings.push(text.as_str());
                            }
                        }
                    }
                }
            }
            StepAction::Authenticate(credentials) => {
                strings.push(credentials.email.as_str());
                strings.push(credentials.password.as_str());
            }
            StepAction::Invalidate => {}
        }
        strings
    }

    pub fn template_values(&self) -> Vec<&Value> {
        let mut values: Vec<&Value> = self.assert.equals.values().collect();
        if let StepAction::Request(RequestTemplate {
            body: BodyTemplate::Json(body),
            ..
        }) = &self.action
        {
            values.push(body);
        }
        values
    }
}

impl StepAction {
    pub fn label(&self) -> String {
        match self {
            StepAction::Request(request) => format!("{} {}", request.method, request.path),
            StepAction::Authenticate(_) => "authenticate".to_string(),
            StepAction::Invalidate => "invalidate".to_string(),
        }
    }
}

pub fn resolve(step: &Step, scope: TemplateScope<'_>) -> Result<ResolvedStep, HarnessError> {
    let unresolved = |err: TemplateError| reference_error(&step.id, err);

    let action = match &step.action {
        StepAction::Request(request) => {
            let path = template::substitute(&request.path, scope).map_err(unresolved)?;
            let mut headers = Vec::with_capacity(request.headers.len());
            for (name, value) in &request.headers {
                headers.push((
                    name.clone(),
                    template::substitute(value, scope).map_err(unresolved)?,
                ));
            }
            let body = match &request.body {
                BodyTemplate::None => RequestBody::Empty,
                BodyTemplate::Json(value) => {
                    RequestBody::Json(template::substitute_json(value, scope).map_err(unresolved)?)
                }
                BodyTemplate::Form(fields) => {
                    let mut resolved = Vec::with_capacity(fields.len());
                    for (name, value) in fields {
                        resolved.push((
                            name.clone(),
                            template::substitute(value, scope).map_err(unresolved)?,
                        ));
                    }
                    RequestBody::Form(resolved)
                }
                BodyTemplate::Multipart(parts) => {
                    let mut resolved = Vec::with_capacity(parts.len());
                    for part in parts {
                        let source = match &part.source {
                            PartSource::Text(text) => PartSource::Text(
                                template::substitute(text, scope).map_err(unresolved)?,
                            ),
                            PartSource::File(path) => PartSource::File(path.clone()),
                        };
                        resolved.push(MultipartPart {
                            name: part.name.clone(),
                            filename: part.filename.clone(),
                            content_type: part.content_type.clone(),
                            source,
                        });
                    }
                    RequestBody::Multipart(resolved)
                }
            };
            ConcreteAction::Request(ConcreteRequest {
                method: request.method,
                path,
                headers,
                body,
            })
        }
        StepAction::Authenticate(credentials) => ConcreteAction::Authenticate(Credentials {
            email: template::substitute(&credentials.email, scope).map_err(unresolved)?,
            password: template::substitute(&credentials.password, scope).map_err(unresolved)?,
        }),
        StepAction::Invalidate => ConcreteAction::Invalidate,
    };

    let mut equals = BTreeMap::new();
    for (pointer, expected) in &step.assert.equals {
        equals.insert(
            pointer.clone(),
            template::substitute_json(expected, scope).map_err(unresolved)?,
        );
    }

    Ok(ResolvedStep { action, equals })
}

fn reference_error(step: &str, err: TemplateError) -> HarnessError {
    let key = match err {
        TemplateError::MissingContext(key) => key,
        TemplateError::UndefinedVariable(name) => format!("var:{name}"),
        TemplateError::UndefinedSecret(name) => format!("secret:{name}"),
        TemplateError::Unterminated(text) | TemplateError::Empty(text) => text,
    };
    HarnessError::UnresolvedReference {
        step: step.to_string(),
        key,
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        };
        write!(f, "{value}")
    }
}

impl fmt::Display for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expectation::MustSucceed => write!(f, "must_succeed"),
            Expectation::MustFail(status) => write!(f, "must_fail({status})"),
            Expectation::MayFail => write!(f, "may_fail"),
            Expectation::AnyOf(statuses) => {
                let list: Vec<String> = statuses.iter().map(u16::to_string).collect();
                write!(f, "any_of({})", list.join(","))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteSummary {
    pub name: String,
    pub description: Option<String>,
    pub requires_auth: bool,
    pub total_steps: usize,
    pub steps: Vec<StepSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSummary {
    pub id: String,
    pub action: String,
    pub expect: String,
    pub reads: Vec<String>,
    pub writes: Vec<String>,
    pub requires_auth: bool,
    pub critical: bool,
    pub independent: bool,
}

impl fmt::Display for SuiteSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let auth = if self.requires_auth {
            " [requires auth]"
        } else {
            ""
        };
        writeln!(f, "Suite: {}{}", self.name, auth)?;
        if let Some(description) = &self.description {
            writeln!(f, "  {description}")?;
        }
        writeln!(f, "Steps: {}", self.total_steps)?;
        for step in &self.steps {
            let mut flags = Vec::new();
            if step.requires_auth {
                flags.push("auth");
            }
            if step.critical {
                flags.push("critical");
            }
            if step.independent {
                flags.push("independent");
            }
            let flags = if flags.is_empty() {
                String::new()
            } else {
                format!(" [{}]", flags.join(", "))
            };
            writeln!(
                f,
                "  - {} {} -> {}{}",
                step.id, step.action, step.expect, flags
            )?;
            if !step.reads.is_empty() {
                writeln!(f, "      reads: {}", step.reads.join(", "))?;
            }
            if !step.writes.is_empty() {
                writeln!(f, "      writes: {}", step.writes.join(", "))?;
            }
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::context::Context;
    use serde_json::json;
    use std::path::PathBuf;

    fn vars() -> (BTreeMap<String, String>, BTreeMap<String, String>) {
        let mut variables = BTreeMap::new();
        variables.insert("email".to_string(), "qa@example.test".to_string());
        let mut secrets = BTreeMap::new();
        secrets.insert("password".to_string(), "pw".to_string());
        (variables, secrets)
    }

    #[test]
    fn resolve_substitutes_path_body_and_assertions() {
        let suite = Suite::new(resource_workflow()).expect("valid suite");
        let (variables, secrets) = vars();
        let mut context = Context::default();
        context.insert("userId", json!("u1"), false).expect("write");
        context.insert("resourceId", json!("r1"), false).expect("write");
        let scope = TemplateScope {
            context: &context,
            variables: &variables,
            secrets: &secrets,
        };

        let create = resolve(&suite.steps()[2], scope).expect("resolves");
        match create.action {
            ConcreteAction::Request(request) => {
                assert_eq!(request.path, "/api/resources");
                assert_eq!(request.body, RequestBody::Json(json!({ "ownerId": "u1" })));
            }
            other => panic!("unexpected action {other:?}"),
        }

        let get = resolve(&suite.steps()[3], scope).expect("resolves");
        assert_eq!(get.equals.get("/id"), Some(&json!("r1")));
        match get.action {
            ConcreteAction::Request(request) => assert_eq!(request.path, "/api/resources/r1"),
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn resolve_reports_missing_key_as_unresolved_reference() {
        let suite = Suite::new(resource_workflow()).expect("valid suite");
        let (variables, secrets) = vars();
        let context = Context::default();
        let scope = TemplateScope {
            context: &context,
            variables: &variables,
            secrets: &secrets,
        };
        assert_eq!(
            resolve(&suite.steps()[3], scope),
            Err(HarnessError::UnresolvedReference {
                step: "get_resource".to_string(),
                key: "resourceId".to_string(),
            })
        );
    }

    #[test]
    fn resolve_builds_credentials_from_variables_and_secrets() {
        let suite = Suite::new(resource_workflow()).expect("valid suite");
        let (variables, secrets) = vars();
        let context = Context::default();
        let scope = TemplateScope {
            context: &context,
            variables: &variables,
            secrets: &secrets,
        };
        let resolved = resolve(&suite.steps()[1], scope).expect("resolves");
        assert_eq!(
            resolved.action,
            ConcreteAction::Authenticate(Credentials {
                email: "qa@example.test".to_string(),
                password: "pw".to_string(),
            })
        );
    }

    #[test]
    fn parses_suite_file_json() {
        let source = r#"{
          "suites": [{
            "name": "smoke",
            "steps": [
              {
                "id": "root",
                "action": { "kind": "request", "method": "GET", "path": "/api/" },
                "expect": "must_succeed",
                "critical": true
              },
              {
                "id": "missing",
                "action": { "kind": "request", "method": "DELETE", "path": "/api/interview/none" },
                "expect": { "must_fail": 404 },
                "assert": { "shape": "error_envelope" }
              },
              {
                "id": "tts",
                "action": {
                  "kind": "request", "method": "POST", "path": "/api/tts",
                  "body": { "json": { "text": "hello" } }
                },
                "expect": { "any_of": [200, 401] },
                "assert": { "shape": { "binary": { "content_type": "audio" } } },
                "timeout": "generative"
              }
            ]
          }]
        }"#;
        let file: SuiteFile = serde_json::from_str(source).expect("suite file parses");
        let suite = &file.suites[0];
        assert_eq!(suite.steps.len(), 3);
        assert_eq!(suite.steps[1].expect, Expectation::MustFail(404));
        assert_eq!(suite.steps[1].assert.shape, ResponseShape::ErrorEnvelope);
        assert_eq!(suite.steps[2].expect, Expectation::AnyOf(vec![200, 401]));
        assert_eq!(suite.steps[2].timeout, TimeoutClass::Generative);
        assert_eq!(
            suite.steps[2].assert.shape,
            ResponseShape::Binary {
                content_type: "audio".to_string()
            }
        );
    }

    #[test]
    fn rebases_relative_multipart_files() {
        let mut definition = resource_workflow();
        let mut upload = request("upload", Method::Post, "/api/resume/upload");
        if let StepAction::Request(template) = &mut upload.action {
            template.body = BodyTemplate::Multipart(vec![PartTemplate {
                name: "file".to_string(),
                filename: Some("resume.pdf".to_string()),
                content_type: Some("application/pdf".to_string()),
                source: PartSource::File(PathBuf::from("fixtures/resume.pdf")),
            }]);
        }
        definition.steps.push(upload);
        definition.rebase_files(Path::new("/suites"));

        let StepAction::Request(template) = &definition.steps[4].action else {
            panic!("expected request");
        };
        let BodyTemplate::Multipart(parts) = &template.body else {
            panic!("expected multipart");
        };
        assert_eq!(
            parts[0].source,
            PartSource::File(PathBuf::from("/suites/fixtures/resume.pdf"))
        );
    }

    #[test]
    fn summary_lists_reads_and_writes() {
        let summary = resource_workflow().summary();
        let rendered = summary.to_string();
        assert!(rendered.contains("Suite: resources [requires auth]"));
        assert!(rendered.contains("register POST /api/register -> must_succeed"));
        assert!(rendered.contains("writes: userId"));
        assert!(rendered.contains("reads: resourceId"));
    }
}
