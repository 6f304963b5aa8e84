use serde_json::Value;
use std::collections::HashMap;

/// Per-operation options threaded through every store call.
/// A context never outlives the unit of work it was built for.
#[derive(Debug, Clone)]
pub struct Context {
    /// Locale used when translating labels and constraint messages.
    pub lang: Option<String>,
    /// When true (the default), search filters out rows whose `active`
    /// field is false, unless the domain mentions `active` itself.
    pub active_test: bool,
    /// Suppress dependent stored-field recomputation after a mutation.
    pub no_recompute: bool,
    /// Skip nested-set index maintenance; the caller is expected to run
    /// `tree::rebuild` once the bulk operation is done.
    pub defer_tree_index: bool,
    /// Field defaults supplied by the caller. These win over model defaults
    /// and over the default-override collaborator.
    pub defaults: HashMap<String, Value>,
    /// Last-observed modification timestamps, keyed by (model, id), in the
    /// store's `%Y-%m-%d %H:%M:%S` text form. A write or unlink of a keyed
    /// row fails with ConcurrencyConflict if the stored timestamp is newer.
    pub timestamps: HashMap<(String, i64), String>,
}

impl Default for Context {
    fn default() -> Self {
        Context {
            lang: None,
            active_test: true,
            no_recompute: false,
            defer_tree_index: false,
            defaults: HashMap::new(),
            timestamps: HashMap::new(),
        }
    }
}

impl Context {
    pub fn new() -> Self {
        Context::default()
    }

    pub fn with_lang(mut self, lang: &str) -> Self {
        self.lang = Some(lang.to_string());
        self
    }

    pub fn with_default(mut self, field: &str, value: Value) -> Self {
        self.defaults.insert(field.to_string(), value);
        self
    }

    pub fn with_timestamp(mut self, model: &str, id: i64, stamp: &str) -> Self {
        self.timestamps
            .insert((model.to_string(), id), stamp.to_string());
        self
    }

    pub fn without_active_test(mut self) -> Self {
        self.active_test = false;
        self
    }

    pub fn without_recompute(mut self) -> Self {
        self.no_recompute = true;
        self
    }

    pub fn deferring_tree_index(mut self) -> Self {
        self.defer_tree_index = true;
        self
    }
}
