use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Declarative definition of one entity type. Immutable once registered;
/// everything derived from it (inheritance catalogue, dependency registry,
/// physical schema) is rebuilt by the registry, never patched in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub name: String,
    /// Physical table name; defaults to the model name with '.' → '_'.
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Field used by name_get/name_search.
    #[serde(default = "default_rec_name")]
    pub rec_name: String,
    /// Default ORDER BY clause for search.
    #[serde(default = "default_order")]
    pub order: String,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldDefinition>,
    #[serde(default)]
    pub defaults: BTreeMap<String, DefaultSpec>,
    #[serde(default)]
    pub constraints: Vec<ConstraintSpec>,
    /// Delegation targets: target model name → many2one link field on this
    /// model. Every field of the target becomes readable/writable here.
    #[serde(default)]
    pub inherits: BTreeMap<String, String>,
    /// Many2one field naming each row's parent; declaring it turns on
    /// nested-set index maintenance for this model.
    #[serde(default)]
    pub parent_field: Option<String>,
    /// Sibling ordering used when (re)computing the nested-set bounds.
    #[serde(default)]
    pub parent_order: Option<String>,
    /// Maintain create_uid/create_date/write_uid/write_date columns.
    #[serde(default = "default_true")]
    pub log_access: bool,
}

fn default_rec_name() -> String {
    "name".to_string()
}

fn default_order() -> String {
    "id".to_string()
}

fn default_true() -> bool {
    true
}

impl ModelDefinition {
    pub fn new(name: &str) -> Self {
        ModelDefinition {
            name: name.to_string(),
            table: None,
            description: None,
            rec_name: default_rec_name(),
            order: default_order(),
            fields: BTreeMap::new(),
            defaults: BTreeMap::new(),
            constraints: Vec::new(),
            inherits: BTreeMap::new(),
            parent_field: None,
            parent_order: None,
            log_access: true,
        }
    }

    pub fn table_name(&self) -> String {
        self.table
            .clone()
            .unwrap_or_else(|| self.name.replace('.', "_"))
    }

    pub fn field(mut self, name: &str, def: FieldDefinition) -> Self {
        self.fields.insert(name.to_string(), def);
        self
    }

    pub fn default_value(mut self, field: &str, value: Value) -> Self {
        self.defaults
            .insert(field.to_string(), DefaultSpec::Value(value));
        self
    }

    pub fn default_function(mut self, field: &str, function: &str) -> Self {
        self.defaults
            .insert(field.to_string(), DefaultSpec::Function(function.to_string()));
        self
    }

    pub fn constraint(mut self, function: &str, message: &str, fields: &[&str]) -> Self {
        self.constraints.push(ConstraintSpec {
            function: function.to_string(),
            message: message.to_string(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        });
        self
    }

    pub fn delegate(mut self, target: &str, link_field: &str) -> Self {
        self.inherits
            .insert(target.to_string(), link_field.to_string());
        self
    }

    pub fn tree(mut self, parent_field: &str) -> Self {
        self.parent_field = Some(parent_field.to_string());
        self
    }
}

/// Definition of a single field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDefinition {
    #[serde(rename = "type")]
    pub kind: FieldType,
    /// Human label; falls back to the field name.
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub readonly: bool,
    /// Create an index on the physical column.
    #[serde(default)]
    pub select: bool,
    #[serde(default)]
    pub translate: bool,
    /// Bound for Char columns.
    #[serde(default)]
    pub size: Option<u32>,
    /// (precision, scale) for Float columns.
    #[serde(default)]
    pub digits: Option<(u8, u8)>,
    /// (value, label) pairs for Selection fields.
    #[serde(default)]
    pub selection: Option<Vec<(String, String)>>,
    /// Target model for many2one / one2many / many2many.
    #[serde(default)]
    pub relation: Option<String>,
    /// Inverse many2one column on the target, for one2many.
    #[serde(default)]
    pub relation_field: Option<String>,
    /// Relation table for many2many; derived from the two tables if absent.
    #[serde(default)]
    pub rel_table: Option<String>,
    /// Candidate models for Reference fields.
    #[serde(default)]
    pub models: Option<Vec<String>>,
    #[serde(default)]
    pub ondelete: Option<OnDelete>,
    #[serde(default)]
    pub compute: Option<ComputeSpec>,
    /// Registered setter invoked with the value after the row exists
    /// (custom write-through for computed fields).
    #[serde(default)]
    pub setter: Option<String>,
    /// Exclude from the cache's batched classic prefetch.
    #[serde(default)]
    pub no_prefetch: bool,
    /// Application order for non-column writes; lower runs first.
    #[serde(default)]
    pub priority: i32,
}

impl FieldDefinition {
    pub fn new(kind: FieldType) -> Self {
        FieldDefinition {
            kind,
            label: None,
            required: false,
            readonly: false,
            select: false,
            translate: false,
            size: None,
            digits: None,
            selection: None,
            relation: None,
            relation_field: None,
            rel_table: None,
            models: None,
            ondelete: None,
            compute: None,
            setter: None,
            no_prefetch: false,
            priority: 0,
        }
    }

    pub fn char(size: u32) -> Self {
        let mut f = FieldDefinition::new(FieldType::Char);
        f.size = Some(size);
        f
    }

    pub fn many2one(target: &str) -> Self {
        let mut f = FieldDefinition::new(FieldType::Many2one);
        f.relation = Some(target.to_string());
        f
    }

    pub fn one2many(target: &str, inverse: &str) -> Self {
        let mut f = FieldDefinition::new(FieldType::One2many);
        f.relation = Some(target.to_string());
        f.relation_field = Some(inverse.to_string());
        f
    }

    pub fn many2many(target: &str) -> Self {
        let mut f = FieldDefinition::new(FieldType::Many2many);
        f.relation = Some(target.to_string());
        f
    }

    pub fn selection_of(options: &[(&str, &str)]) -> Self {
        let mut f = FieldDefinition::new(FieldType::Selection);
        f.selection = Some(
            options
                .iter()
                .map(|(v, l)| (v.to_string(), l.to_string()))
                .collect(),
        );
        f
    }

    pub fn labelled(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.select = true;
        self
    }

    pub fn on_delete(mut self, behaviour: OnDelete) -> Self {
        self.ondelete = Some(behaviour);
        self
    }

    pub fn computed(mut self, spec: ComputeSpec) -> Self {
        self.compute = Some(spec);
        self
    }

    pub fn label_or(&self, name: &str) -> String {
        self.label.clone().unwrap_or_else(|| name.to_string())
    }

    /// Whether the field owns a physical column on the model's table.
    pub fn is_stored(&self) -> bool {
        match self.kind {
            FieldType::One2many | FieldType::Many2many => false,
            _ => match &self.compute {
                Some(spec) => spec.stored.is_some(),
                None => true,
            },
        }
    }

    /// Classic fields are written as plain column values in INSERT/UPDATE.
    /// Stored computed columns exist too, but only the dependency engine
    /// ever writes them.
    pub fn classic_write(&self) -> bool {
        self.is_stored() && self.compute.is_none()
    }

    /// Whether the cache may pull this field in with the batched classic
    /// group. Binary payloads are fetched individually.
    pub fn prefetch(&self) -> bool {
        self.is_stored() && !self.no_prefetch && self.kind != FieldType::Binary
    }

    pub fn is_relational(&self) -> bool {
        matches!(
            self.kind,
            FieldType::Many2one | FieldType::One2many | FieldType::Many2many | FieldType::Reference
        )
    }
}

/// Field type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Boolean,
    Integer,
    Float,
    Char,
    Text,
    Date,
    Datetime,
    Binary,
    Selection,
    Many2one,
    One2many,
    Many2many,
    Reference,
}

impl FieldType {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::Boolean => "boolean",
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::Char => "char",
            FieldType::Text => "text",
            FieldType::Date => "date",
            FieldType::Datetime => "datetime",
            FieldType::Binary => "binary",
            FieldType::Selection => "selection",
            FieldType::Many2one => "many2one",
            FieldType::One2many => "one2many",
            FieldType::Many2many => "many2many",
            FieldType::Reference => "reference",
        }
    }
}

/// On-delete behaviour declared on many2one columns, emitted into the
/// foreign-key DDL at table-creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnDelete {
    SetNull,
    Restrict,
    Cascade,
}

impl OnDelete {
    pub fn sql(self) -> &'static str {
        match self {
            OnDelete::SetNull => "SET NULL",
            OnDelete::Restrict => "RESTRICT",
            OnDelete::Cascade => "CASCADE",
        }
    }
}

/// How a computed field gets its value. The function is a name resolved
/// against the registry's callable table; `stored: None` means the field
/// is evaluated on every read and has no column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeSpec {
    pub function: String,
    /// Co-computation group: fields sharing a `multi` key and function are
    /// computed in one call returning all of them per id.
    #[serde(default)]
    pub multi: Option<String>,
    #[serde(default)]
    pub stored: Option<StoredSpec>,
}

impl ComputeSpec {
    pub fn readonly(function: &str) -> Self {
        ComputeSpec {
            function: function.to_string(),
            multi: None,
            stored: None,
        }
    }

    pub fn stored(function: &str, triggers: Vec<StoreTrigger>) -> Self {
        ComputeSpec {
            function: function.to_string(),
            multi: None,
            stored: Some(StoredSpec { triggers }),
        }
    }

    pub fn grouped(mut self, multi: &str) -> Self {
        self.multi = Some(multi.to_string());
        self
    }
}

/// Persistence spec for a computed field. An empty trigger list is sugar
/// for "recompute when my own model's rows change" (identity mapping,
/// priority 10).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoredSpec {
    #[serde(default)]
    pub triggers: Vec<StoreTrigger>,
}

/// One entry of a stored field's trigger set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreTrigger {
    /// Model whose mutations invalidate the stored value.
    pub model: String,
    /// Registered function mapping changed trigger ids to the owner ids to
    /// recompute; None is the identity (trigger model == owner model).
    #[serde(default)]
    pub map_ids: Option<String>,
    /// Trigger fields; empty means any change triggers.
    #[serde(default)]
    pub fields: Vec<String>,
    /// Lower priorities are recomputed first, so columns other stored
    /// fields read are fresh by the time their dependents run.
    #[serde(default = "default_store_priority")]
    pub priority: i32,
}

fn default_store_priority() -> i32 {
    10
}

impl StoreTrigger {
    pub fn new(model: &str, map_ids: Option<&str>, fields: &[&str], priority: i32) -> Self {
        StoreTrigger {
            model: model.to_string(),
            map_ids: map_ids.map(|m| m.to_string()),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            priority,
        }
    }
}

/// Default value for a field: a literal, or a registered function name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultSpec {
    Value(Value),
    Function(String),
}

/// A record-level validation constraint. The function name resolves to a
/// registered predicate; `fields` name the columns reported on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintSpec {
    pub function: String,
    pub message: String,
    #[serde(default)]
    pub fields: Vec<String>,
}

/// Top-level shape of a YAML model catalogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCatalogue {
    #[serde(default)]
    pub models: Vec<ModelDefinition>,
}
