//! Resolving a collection template plus a selector into handles.

use serde::{Deserialize, Serialize};

use crate::path::{assert_collection, assert_path, doc_path, path_with_params};
use crate::{BuildError, Constraint, Handle, Params};

/// What to read from a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "by", content = "value", rename_all = "camelCase")]
pub enum Selector {
    /// The whole collection.
    Collection,
    /// One document by id, or by full path when the id is deeper than the
    /// collection.
    ById(String),
    ByIds(Vec<String>),
    ByQuery(Vec<Constraint>),
    /// The whole collection with its template filled from these params.
    ByParams(Params),
    /// A full document or collection path, independent of the template.
    ByPath(String),
    ByPaths(Vec<String>),
}

/// Result of resolving a [`Selector`].
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    One(Handle),
    Many(Vec<Handle>),
}

impl Target {
    pub fn is_many(&self) -> bool {
        matches!(self, Target::Many(_))
    }

    pub fn into_handles(self) -> Vec<Handle> {
        match self {
            Target::One(handle) => vec![handle],
            Target::Many(handles) => handles,
        }
    }
}

/// A collection addressed by a path template such as
/// `movies/:movieId/stakeholders`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRef {
    template: String,
}

impl CollectionRef {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// The concrete collection path for `params`.
    pub fn path(&self, params: Option<&Params>) -> Result<String, BuildError> {
        let path = match params {
            Some(params) => path_with_params(&self.template, params),
            None => self.template.clone(),
        };
        assert_path(&path)?;
        assert_collection(&path)?;
        Ok(path)
    }

    /// Resolve `selector` into handles.
    ///
    /// All validation happens here; the returned handles are ready to
    /// observe.
    pub fn resolve(&self, selector: Selector, params: Option<&Params>) -> Result<Target, BuildError> {
        match selector {
            Selector::Collection => Ok(Target::One(Handle::collection(self.path(params)?)?)),
            Selector::ById(id) => {
                let collection = self.path(params)?;
                Ok(Target::One(self.document(&collection, &id)?))
            }
            Selector::ByIds(ids) => {
                if ids.is_empty() {
                    return Ok(Target::Many(Vec::new()));
                }
                let collection = self.path(params)?;
                let handles = ids
                    .iter()
                    .map(|id| self.document(&collection, id))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Target::Many(handles))
            }
            Selector::ByQuery(constraints) => {
                Ok(Target::One(Handle::query(self.path(params)?, constraints)?))
            }
            Selector::ByParams(own) => Ok(Target::One(Handle::collection(self.path(Some(&own))?)?)),
            Selector::ByPath(path) => Ok(Target::One(Handle::reference(path)?)),
            Selector::ByPaths(paths) => {
                let handles = paths
                    .into_iter()
                    .map(Handle::reference)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Target::Many(handles))
            }
        }
    }

    fn document(&self, collection: &str, id: &str) -> Result<Handle, BuildError> {
        if id.is_empty() {
            return Err(BuildError::InvalidPath(format!("{collection}/")));
        }
        Handle::document(doc_path(collection, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FilterOp, limit, where_};
    use pretty_assertions::assert_eq;

    fn stakeholders() -> CollectionRef {
        CollectionRef::new("movies/:movieId/stakeholders")
    }

    fn params() -> Params {
        Params::from([("movieId".to_string(), "m1".to_string())])
    }

    #[test]
    fn test_by_id_fills_template() {
        let target = stakeholders()
            .resolve(Selector::ById("s1".into()), Some(&params()))
            .unwrap();
        assert_eq!(
            target,
            Target::One(Handle::document("movies/m1/stakeholders/s1").unwrap())
        );
    }

    #[test]
    fn test_missing_param_fails_synchronously() {
        let err = stakeholders()
            .resolve(Selector::ById("s1".into()), None)
            .unwrap_err();
        assert_eq!(
            err,
            BuildError::MissingParam {
                param: "movieId".into(),
                path: "movies/:movieId/stakeholders".into(),
            }
        );
    }

    #[test]
    fn test_by_ids_empty_resolves_to_empty_many() {
        let target = stakeholders().resolve(Selector::ByIds(vec![]), None).unwrap();
        assert_eq!(target, Target::Many(vec![]));
    }

    #[test]
    fn test_by_ids_accepts_full_paths() {
        let flights = CollectionRef::new("flights");
        let target = flights
            .resolve(
                Selector::ByIds(vec!["a".into(), "archive/b".into()]),
                None,
            )
            .unwrap();
        assert_eq!(
            target.into_handles(),
            vec![
                Handle::document("flights/a").unwrap(),
                Handle::document("archive/b").unwrap(),
            ]
        );
    }

    #[test]
    fn test_by_query_builds_query_handle() {
        let target = CollectionRef::new("flights")
            .resolve(
                Selector::ByQuery(vec![where_("number", FilterOp::LessThan, 10), limit(3)]),
                None,
            )
            .unwrap();
        let Target::One(handle) = target else {
            panic!("expected one handle");
        };
        assert_eq!(handle.key().as_str(), "flights|f:[number < i:10]|l:3");
    }

    #[test]
    fn test_by_params_uses_selector_params() {
        let target = stakeholders()
            .resolve(Selector::ByParams(params()), None)
            .unwrap();
        assert_eq!(
            target,
            Target::One(Handle::collection("movies/m1/stakeholders").unwrap())
        );
    }

    #[test]
    fn test_by_path_ignores_template() {
        let target = stakeholders()
            .resolve(Selector::ByPath("users/u1".into()), None)
            .unwrap();
        assert_eq!(target, Target::One(Handle::document("users/u1").unwrap()));
    }

    #[test]
    fn test_document_template_is_rejected() {
        let err = CollectionRef::new("flights/a")
            .resolve(Selector::Collection, None)
            .unwrap_err();
        assert_eq!(err, BuildError::ExpectedCollection("flights/a".into()));
    }
}
