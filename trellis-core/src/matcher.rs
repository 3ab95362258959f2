//! Per-subscription match predicates and field projections.
//!
//! Both are compiled once from the subscribe arguments and applied to every
//! payload harvested during a poll: the filter decides whether a message is
//! delivered at all, the projection trims the surviving document before it is
//! emitted.

use serde_json::{Map, Value};
use thiserror::Error;

/// Error raised while compiling a filter or projection document.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MatchError {
    /// The filter argument was not a document.
    #[error("filter must be a document of field/value pairs")]
    BadFilter,
    /// The projection argument was not a document of field flags.
    #[error("projection must be a document of field/flag pairs")]
    BadProjection,
    /// The projection mixed included and excluded fields.
    #[error("projection cannot mix included and excluded fields")]
    MixedProjection,
}

/// Compiled match predicate: every clause must hold for a message to pass.
///
/// A clause is a dotted field path and the value it must equal, so
/// `{"meta.kind": "alert"}` matches `{"meta": {"kind": "alert"}, ...}`.
#[derive(Debug, Clone)]
pub struct DocumentFilter {
    clauses: Vec<(Vec<String>, Value)>,
}

impl DocumentFilter {
    /// Compile a filter document.
    pub fn compile(filter: &Value) -> Result<Self, MatchError> {
        let fields = filter.as_object().ok_or(MatchError::BadFilter)?;
        let clauses = fields
            .iter()
            .map(|(path, expected)| {
                let path = path.split('.').map(str::to_owned).collect();
                (path, expected.clone())
            })
            .collect();
        Ok(Self { clauses })
    }

    /// Whether `document` satisfies every clause.
    pub fn matches(&self, document: &Value) -> bool {
        self.clauses
            .iter()
            .all(|(path, expected)| lookup(document, path) == Some(expected))
    }
}

fn lookup<'doc>(document: &'doc Value, path: &[String]) -> Option<&'doc Value> {
    let mut current = document;
    for segment in path {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProjectionMode {
    Include,
    Exclude,
}

/// Compiled field projection, applied to top-level fields.
///
/// Flags follow the usual convention: truthy values name the fields to keep,
/// falsy values the fields to drop. Mixing the two is rejected at compile
/// time.
#[derive(Debug, Clone)]
pub struct Projection {
    mode: ProjectionMode,
    fields: Vec<String>,
}

impl Projection {
    /// Compile a projection document.
    pub fn compile(projection: &Value) -> Result<Self, MatchError> {
        let flags = projection.as_object().ok_or(MatchError::BadProjection)?;

        let mut included = Vec::new();
        let mut excluded = Vec::new();
        for (field, flag) in flags {
            if is_truthy(flag).ok_or(MatchError::BadProjection)? {
                included.push(field.clone());
            } else {
                excluded.push(field.clone());
            }
        }
        match (included.is_empty(), excluded.is_empty()) {
            (false, false) => Err(MatchError::MixedProjection),
            (false, true) => Ok(Self {
                mode: ProjectionMode::Include,
                fields: included,
            }),
            // An empty projection document excludes nothing.
            _ => Ok(Self {
                mode: ProjectionMode::Exclude,
                fields: excluded,
            }),
        }
    }

    /// Apply the projection; non-document payloads pass through unchanged.
    pub fn apply(&self, document: &Value) -> Value {
        let Some(fields) = document.as_object() else {
            return document.clone();
        };
        let kept: Map<String, Value> = fields
            .iter()
            .filter(|(name, _)| match self.mode {
                ProjectionMode::Include => self.fields.contains(name),
                ProjectionMode::Exclude => !self.fields.contains(name),
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        Value::Object(kept)
    }
}

fn is_truthy(flag: &Value) -> Option<bool> {
    match flag {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => Some(n.as_f64().is_some_and(|f| f != 0.0)),
        _ => None,
    }
}
