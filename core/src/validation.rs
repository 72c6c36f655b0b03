use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::suite::{BodyTemplate, Expectation, PartTemplate, Step, StepAction, SuiteDefinition};
use crate::template::{self, Placeholder};
use crate::transport::PartSource;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub location: Option<String>,
    pub message: String,
}

impl Diagnostic {
    fn error(location: Option<String>, message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Error,
            location,
            message: message.into(),
        }
    }

    fn warning(location: Option<String>, message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Warning,
            location,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.level, DiagnosticLevel::Error)
    }
}

/// Construction-time checks: every authoring defect (dangling reads, write
/// conflicts, malformed templates) is reported here, before any traffic.
pub fn validate_suite(suite: &SuiteDefinition) -> Vec<Diagnostic> {
    let mut ctx = ValidationContext::new();
    ctx.push(format!("suite {}", suite.name));

    if suite.name.trim().is_empty() {
        ctx.error("suite name cannot be empty");
    }
    if suite.steps.is_empty() {
        ctx.warning("suite declares no steps");
    }
    if suite.requires_auth && !suite.steps.iter().any(Step::is_authenticate) {
        ctx.error("suite requires authentication but declares no authenticate step");
    }

    let mut ids = HashSet::new();
    let mut written: BTreeMap<String, String> = BTreeMap::new();
    let mut authenticated = false;

    for step in &suite.steps {
        ctx.push(format!("step {}", step.id));
        if step.id.trim().is_empty() {
            ctx.error("step id cannot be empty");
        } else if !ids.insert(step.id.as_str()) {
            ctx.error(format!("duplicate step id '{}'", step.id));
        }

        validate_action(step, &mut ctx);
        validate_expectation(&step.expect, &mut ctx);
        validate_references(step, &written, &mut ctx);

        if step.requires_auth && !authenticated && !step.is_authenticate() {
            ctx.warning("step requires authentication but no authenticate step precedes it");
        }
        if step.is_authenticate() {
            authenticated = true;
            if step.independent {
                ctx.warning("authenticate steps always run sequentially; 'independent' is ignored");
            }
            if !step.extract.is_empty() {
                ctx.error("authenticate steps cannot extract context values");
            }
        }

        for key in step.writes() {
            let conflict = written.get(key).filter(|_| !step.overwrite).cloned();
            match conflict {
                Some(writer) => ctx.error(format!(
                    "context key '{}' is already written by step '{}'; declare overwrite to replace it",
                    key, writer
                )),
                None => {
                    written.insert(key.to_string(), step.id.clone());
                }
            }
        }
        for (key, pointer) in &step.extract {
            if !pointer.is_empty() && !pointer.starts_with('/') {
                ctx.error(format!(
                    "extraction for '{}' must be a JSON pointer starting with '/', found '{}'",
                    key, pointer
                ));
            }
        }

        ctx.pop();
    }

    ctx.pop();
    ctx.finish()
}

fn validate_action(step: &Step, ctx: &mut ValidationContext) {
    match &step.action {
        StepAction::Request(request) => {
            if request.path.trim().is_empty() {
                ctx.error("request path cannot be empty");
            } else if !request.path.starts_with('/') {
                ctx.error(format!(
                    "request path '{}' must start with '/'",
                    request.path
                ));
            }
            if let BodyTemplate::Multipart(parts) = &request.body {
                validate_parts(parts, ctx);
            }
        }
        StepAction::Authenticate(credentials) => {
            if credentials.email.trim().is_empty() {
                ctx.error("authenticate step requires an email");
            }
            if credentials.password.is_empty() {
                ctx.error("authenticate step requires a password");
            }
        }
        StepAction::Invalidate => {
            if !step.extract.is_empty() {
                ctx.error("invalidate steps cannot extract context values");
            }
        }
    }
}

fn validate_parts(parts: &[PartTemplate], ctx: &mut ValidationContext) {
    if parts.is_empty() {
        ctx.warning("multipart body declares no parts");
    }
    for part in parts {
        if part.name.trim().is_empty() {
            ctx.error("multipart part name cannot be empty");
        }
        if let PartSource::File(path) = &part.source {
            if path.as_os_str().is_empty() {
                ctx.error(format!("multipart part '{}' has an empty file path", part.name));
            }
        }
    }
}

fn validate_expectation(expect: &Expectation, ctx: &mut ValidationContext) {
    match expect {
        Expectation::MustFail(status) if (200..300).contains(status) => ctx.error(format!(
            "must_fail declares success status {}; use must_succeed or any_of",
            status
        )),
        Expectation::MustFail(status) if !(100..600).contains(status) => {
            ctx.error(format!("must_fail declares invalid status {}", status))
        }
        Expectation::AnyOf(statuses) if statuses.is_empty() => {
            ctx.error("any_of requires at least one status")
        }
        Expectation::AnyOf(statuses) => {
            for status in statuses {
                if !(100..600).contains(status) {
                    ctx.error(format!("any_of declares invalid status {}", status));
                }
            }
        }
        _ => {}
    }
}

fn validate_references(
    step: &Step,
    written: &BTreeMap<String, String>,
    ctx: &mut ValidationContext,
) {
    let declared: BTreeSet<&str> = step.reads.iter().map(String::as_str).collect();
    let mut referenced = BTreeSet::new();

    let mut placeholders = Vec::new();
    for text in step.template_strings() {
        match template::placeholders(text) {
            Ok(found) => placeholders.extend(found),
            Err(err) => ctx.error(err.to_string()),
        }
    }
    for value in step.template_values() {
        match template::json_placeholders(value) {
            Ok(found) => placeholders.extend(found),
            Err(err) => ctx.error(err.to_string()),
        }
    }

    for placeholder in placeholders {
        if let Placeholder::Context(key) = placeholder {
            if !declared.contains(key.as_str()) {
                ctx.error(format!(
                    "template references context key '{}' which is not declared in reads",
                    key
                ));
            }
            referenced.insert(key);
        }
    }

    for key in &step.reads {
        if !written.contains_key(key) {
            ctx.error(format!(
                "reads context key '{}' but no earlier step writes it",
                key
            ));
        }
        if !referenced.contains(key) {
            ctx.warning(format!(
                "declares read of '{}' without referencing it; it still gates execution",
                key
            ));
        }
    }
}

struct ValidationContext {
    stack: Vec<String>,
    diagnostics: Vec<Diagnostic>,
}

impl ValidationContext {
    fn new() -> Self {
        Self {
            stack: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    fn push(&mut self, label: String) {
        self.stack.push(label);
    }

    fn pop(&mut self) {
        self.stack.pop();
    }

    fn location(&self) -> Option<String> {
        if self.stack.is_empty() {
            None
        } else {
            Some(self.stack.join(" > "))
        }
    }

    fn error(&mut self, message: impl Into<String>) {
        let diag = Diagnostic::error(self.location(), message);
        self.diagnostics.push(diag);
    }

    fn warning(&mut self, message: impl Into<String>) {
        let diag = Diagnostic::warning(self.location(), message);
        self.diagnostics.push(diag);
    }

    fn finish(self) -> Vec<Diagnostic> {
        self.diagnostics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suite::fixtures::{authenticate, request, resource_workflow};
    use crate::suite::{Method, Suite};

    fn errors(diagnostics: &[Diagnostic]) -> Vec<String> {
        diagnostics
            .iter()
            .filter(|diag| diag.is_error())
            .map(|diag| diag.message.clone())
            .collect()
    }

    #[test]
    fn accepts_well_formed_workflow() {
        let diagnostics = validate_suite(&resource_workflow());
        assert!(errors(&diagnostics).is_empty(), "{diagnostics:?}");
    }

    #[test]
    fn rejects_reads_without_an_earlier_writer() {
        let mut suite = resource_workflow();
        suite.steps.swap(2, 3);
        let found = errors(&validate_suite(&suite));
        assert!(found
            .iter()
            .any(|msg| msg.contains("reads context key 'resourceId' but no earlier step writes it")));
    }

    #[test]
    fn rejects_undeclared_template_reference() {
        let mut suite = resource_workflow();
        suite.steps[3].reads.clear();
        let found = errors(&validate_suite(&suite));
        assert!(found
            .iter()
            .any(|msg| msg.contains("'resourceId' which is not declared in reads")));
    }

    #[test]
    fn write_conflict_is_caught_at_construction() {
        let mut suite = resource_workflow();
        let mut again = request("register_again", Method::Post, "/api/register");
        again.extract.insert("userId".to_string(), "/user/id".to_string());
        suite.steps.push(again);

        let err = Suite::new(suite.clone()).expect_err("conflict must fail construction");
        assert!(err.to_string().contains("already written by step 'register'"));

        suite.steps[4].overwrite = true;
        assert!(Suite::new(suite).is_ok());
    }

    #[test]
    fn flags_duplicate_ids_and_bad_paths() {
        let mut suite = resource_workflow();
        suite.steps.push(request("register", Method::Get, "api/health"));
        let found = errors(&validate_suite(&suite));
        assert!(found.iter().any(|msg| msg.contains("duplicate step id 'register'")));
        assert!(found.iter().any(|msg| msg.contains("must start with '/'")));
    }

    #[test]
    fn requires_auth_suite_needs_authenticate_step() {
        let mut suite = resource_workflow();
        suite.steps.retain(|step| !step.is_authenticate());
        let diagnostics = validate_suite(&suite);
        assert!(errors(&diagnostics)
            .iter()
            .any(|msg| msg.contains("declares no authenticate step")));
        assert!(diagnostics.iter().any(|diag| !diag.is_error()
            && diag.message.contains("no authenticate step precedes it")));
    }

    #[test]
    fn must_fail_with_success_status_is_rejected() {
        let mut suite = resource_workflow();
        suite.steps[0].expect = Expectation::MustFail(200);
        suite.steps[1] = authenticate("authenticate");
        let found = errors(&validate_suite(&suite));
        assert!(found.iter().any(|msg| msg.contains("must_fail declares success status 200")));
    }

    #[test]
    fn locations_name_suite_and_step() {
        let mut suite = resource_workflow();
        suite.steps[3].reads.clear();
        let diagnostics = validate_suite(&suite);
        let located = diagnostics
            .iter()
            .find(|diag| diag.is_error())
            .and_then(|diag| diag.location.clone());
        assert_eq!(
            located.as_deref(),
            Some("suite resources > step get_resource")
        );
    }
}
