//! The template rendering contract.
//!
//! Rendering is an external collaborator: the engine hands a trial and a
//! template to a [`Renderer`] and gets bytes back, never interpreting
//! template syntax itself. [`BasicRenderer`] is the in-tree implementation
//! covering the token vocabulary the controller ships with.

use thiserror::Error;

use tw_collect::ObservationWindow;
use tw_types::{format_float, Metric, PatchTemplate, Trial};

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("unknown template token {token:?}")]
    UnknownToken { token: String },

    #[error("unterminated template expression")]
    Unterminated,

    #[error("token {token:?} needs a trial window")]
    MissingWindow { token: String },
}

/// Produces patch bodies and metric queries from their templates.
pub trait Renderer: Send + Sync {
    /// Render a patch template against a trial.
    fn render_patch(&self, trial: &Trial, template: &PatchTemplate) -> Result<String, RenderError>;

    /// Render a metric's result and error queries against a trial window.
    fn render_metric_query(
        &self,
        trial: &Trial,
        metric: &Metric,
        window: &ObservationWindow,
    ) -> Result<(String, Option<String>), RenderError>;
}

/// Token-substituting renderer.
///
/// Supported expressions, written `{{ ... }}`:
/// - `.Values.<name>`: the trial's assignment for `<name>`
/// - `.Trial.Name` / `.Trial.Namespace`
/// - `.StartTime` / `.CompletionTime`: RFC 3339 timestamps
/// - `duration .StartTime .CompletionTime`: window length in seconds
#[derive(Debug, Default)]
pub struct BasicRenderer;

impl BasicRenderer {
    pub fn new() -> Self {
        Self
    }

    fn substitute(
        input: &str,
        trial: &Trial,
        window: Option<&ObservationWindow>,
    ) -> Result<String, RenderError> {
        let mut output = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(open) = rest.find("{{") {
            output.push_str(&rest[..open]);
            let after = &rest[open + 2..];
            let close = after.find("}}").ok_or(RenderError::Unterminated)?;
            let token = after[..close].trim();
            output.push_str(&Self::resolve(token, trial, window)?);
            rest = &after[close + 2..];
        }
        output.push_str(rest);
        Ok(output)
    }

    fn resolve(
        token: &str,
        trial: &Trial,
        window: Option<&ObservationWindow>,
    ) -> Result<String, RenderError> {
        if let Some(name) = token.strip_prefix(".Values.") {
            return trial
                .assignments
                .iter()
                .find(|a| a.name == name)
                .map(|a| a.value.to_string())
                .ok_or_else(|| RenderError::UnknownToken {
                    token: token.to_string(),
                });
        }
        match token {
            ".Trial.Name" => Ok(trial.metadata.name.clone()),
            ".Trial.Namespace" => Ok(trial.metadata.namespace.clone()),
            ".StartTime" => window
                .map(|w| w.start.to_rfc3339())
                .ok_or_else(|| RenderError::MissingWindow {
                    token: token.to_string(),
                }),
            ".CompletionTime" => window
                .map(|w| w.completion.to_rfc3339())
                .ok_or_else(|| RenderError::MissingWindow {
                    token: token.to_string(),
                }),
            "duration .StartTime .CompletionTime" => window
                .map(|w| format_float(w.duration_seconds()))
                .ok_or_else(|| RenderError::MissingWindow {
                    token: token.to_string(),
                }),
            _ => Err(RenderError::UnknownToken {
                token: token.to_string(),
            }),
        }
    }
}

impl Renderer for BasicRenderer {
    fn render_patch(&self, trial: &Trial, template: &PatchTemplate) -> Result<String, RenderError> {
        Self::substitute(&template.patch, trial, None)
    }

    fn render_metric_query(
        &self,
        trial: &Trial,
        metric: &Metric,
        window: &ObservationWindow,
    ) -> Result<(String, Option<String>), RenderError> {
        let query = Self::substitute(&metric.query, trial, Some(window))?;
        let error_query = metric
            .error_query
            .as_deref()
            .map(|q| Self::substitute(q, trial, Some(window)))
            .transpose()?;
        Ok((query, error_query))
    }
}
