//! Path templates and path parity helpers.
//!
//! Paths alternate collection and document ids: `flights` is a collection,
//! `flights/a` a document, `flights/a/legs` a sub-collection. Templates may
//! contain `:param` segments that are filled from [`Params`].

use std::collections::HashMap;

use crate::BuildError;

/// Values for `:param` segments of a path template.
pub type Params = HashMap<String, String>;

/// Whether `path` names a document (even number of segments).
pub fn is_doc_path(path: &str) -> bool {
    path.split('/').count() % 2 == 0
}

/// Whether `path` looks like a full path rather than a bare id.
pub fn is_path_ref(path: &str) -> bool {
    path.split('/').count() > 1 && !path.contains(':')
}

/// Names of the `:param` segments of a template, in order.
pub fn path_params(template: &str) -> Vec<&str> {
    template
        .split('/')
        .filter_map(|segment| segment.strip_prefix(':'))
        .collect()
}

/// Fill `:param` segments from `params`.
///
/// Segments without a matching parameter are left in place, so the result
/// can still be rejected by [`assert_path`].
///
/// # Example
///
/// ```
/// use hearth_core::path::{Params, path_with_params};
///
/// let params = Params::from([("movieId".to_string(), "m1".to_string())]);
/// assert_eq!(
///     path_with_params("movies/:movieId/stakeholders", &params),
///     "movies/m1/stakeholders"
/// );
/// ```
pub fn path_with_params(template: &str, params: &Params) -> String {
    if !template.contains(':') {
        return template.to_string();
    }
    template
        .split('/')
        .map(|segment| match segment.strip_prefix(':') {
            Some(name) => params
                .get(name)
                .filter(|v| !v.is_empty())
                .map(String::as_str)
                .unwrap_or(segment),
            None => segment,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Reject paths that are empty, have empty segments, contain `|`, or still
/// carry a `:param` segment.
///
/// `|` separates the sections of a query's cache key.
pub fn assert_path(path: &str) -> Result<(), BuildError> {
    if path.is_empty() {
        return Err(BuildError::InvalidPath(path.to_string()));
    }
    for segment in path.split('/') {
        if segment.is_empty() || segment.contains('|') {
            return Err(BuildError::InvalidPath(path.to_string()));
        }
        if let Some(param) = segment.strip_prefix(':') {
            return Err(BuildError::MissingParam {
                param: param.to_string(),
                path: path.to_string(),
            });
        }
    }
    Ok(())
}

/// Reject document paths where a collection path is required.
pub fn assert_collection(path: &str) -> Result<(), BuildError> {
    if is_doc_path(path) {
        return Err(BuildError::ExpectedCollection(path.to_string()));
    }
    Ok(())
}

/// Reject collection paths where a document path is required.
pub fn assert_document(path: &str) -> Result<(), BuildError> {
    if !is_doc_path(path) {
        return Err(BuildError::ExpectedDocument(path.to_string()));
    }
    Ok(())
}

/// Full document path for `id` inside `collection`.
///
/// When `id` is itself deeper than the collection path it is taken as the
/// full document path.
pub fn doc_path(collection: &str, id: &str) -> String {
    if collection.split('/').count() < id.split('/').count() {
        id.to_string()
    } else {
        format!("{collection}/{id}")
    }
}

/// Last segment of a path.
pub fn doc_id(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Everything before the last segment, or `""` for a top-level path.
pub fn parent(path: &str) -> &str {
    path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}
