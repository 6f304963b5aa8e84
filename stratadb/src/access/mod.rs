use crate::error::{Result, StrataError};
use serde_json::Value;

/// Operations subject to access control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
    Create,
    Unlink,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Create => "create",
            Operation::Unlink => "unlink",
        }
    }
}

/// Model-level permission collaborator, consulted before every operation.
pub trait AccessControl {
    fn check(&self, model: &str, operation: Operation, uid: i64) -> Result<()>;
}

/// Default collaborator: everything is permitted.
pub struct AllowAll;

impl AccessControl for AllowAll {
    fn check(&self, _model: &str, _operation: Operation, _uid: i64) -> Result<()> {
        Ok(())
    }
}

/// An extra SQL predicate ANDed into a row selection, with its bound
/// parameters.
#[derive(Debug, Clone)]
pub struct RowFilter {
    pub clause: String,
    pub params: Vec<Value>,
}

/// Row-level security collaborator. When a filter is returned, the store
/// verifies that every selected row satisfies it; a shortfall is a
/// RowSecurityViolation, never a silent skip.
pub trait RowSecurity {
    fn domain(&self, model: &str, operation: Operation, uid: i64) -> Option<RowFilter>;
}

/// Default collaborator: no row restrictions.
pub struct Unrestricted;

impl RowSecurity for Unrestricted {
    fn domain(&self, _model: &str, _operation: Operation, _uid: i64) -> Option<RowFilter> {
        None
    }
}

/// What kind of source text a translation is requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationKind {
    /// A field label. The lookup name is "model,field".
    Field,
    /// A selection option label.
    Selection,
    /// A constraint message.
    Constraint,
}

/// Translation collaborator, consulted for labels and messages only,
/// never for control flow.
pub trait Translations {
    fn source(&self, name: &str, kind: TranslationKind, lang: &str, original: &str)
        -> Option<String>;
}

/// Default collaborator: every label stays in its declared form.
pub struct NoTranslations;

impl Translations for NoTranslations {
    fn source(
        &self,
        _name: &str,
        _kind: TranslationKind,
        _lang: &str,
        _original: &str,
    ) -> Option<String> {
        None
    }
}

/// User/org-level default overrides, merged under declared model defaults
/// and below context-supplied defaults. Also the keeper of "default value
/// records": rows referenced by such a record cannot be unlinked.
pub trait DefaultOverrides {
    fn defaults(&self, _model: &str, _uid: i64) -> Vec<(String, Value)> {
        Vec::new()
    }

    /// Ids in `ids` that are pinned by a default-value record with no
    /// resolution fallback. Unlink refuses to delete them.
    fn blocks_unlink(&self, _model: &str, _ids: &[i64]) -> Vec<i64> {
        Vec::new()
    }
}

/// Default collaborator: no overrides, nothing pinned.
pub struct NoOverrides;

impl DefaultOverrides for NoOverrides {}

/// Convenience constructor for deny verdicts from `AccessControl`
/// implementations.
pub fn denied(model: &str, operation: Operation) -> StrataError {
    StrataError::AccessDenied {
        model: model.to_string(),
        operation: operation.as_str().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_all_permits_everything() {
        let ac = AllowAll;
        for op in [
            Operation::Read,
            Operation::Write,
            Operation::Create,
            Operation::Unlink,
        ] {
            assert!(ac.check("res.partner", op, 1).is_ok());
        }
    }

    #[test]
    fn test_defaults_are_empty() {
        let overrides = NoOverrides;
        assert!(overrides.defaults("res.partner", 1).is_empty());
        assert!(overrides.blocks_unlink("res.partner", &[1, 2]).is_empty());
        assert!(Unrestricted.domain("res.partner", Operation::Read, 1).is_none());
    }
}
