mod parser;
mod types;

pub use parser::{parse_models, parse_models_str};
pub use types::{
    ComputeSpec, ConstraintSpec, DefaultSpec, FieldDefinition, FieldType, ModelCatalogue,
    ModelDefinition, OnDelete, StoreTrigger, StoredSpec,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_models_yaml() {
        let models = parse_models_str(
            r#"
models:
  - name: res.partner
    fields:
      name: { type: char, size: 128, required: true }
      active: { type: boolean }
      kind:
        type: selection
        selection: [[person, Person], [company, Company]]
    defaults:
      active: { value: true }
      kind: { value: person }

  - name: account.invoice
    inherits:
      res.partner: partner_id
    fields:
      partner_id: { type: many2one, relation: res.partner, required: true, ondelete: restrict }
      amount:
        type: float
        compute:
          function: compute_amount
          stored:
            triggers:
              - { model: account.invoice.line, map_ids: line_invoices, fields: [price], priority: 10 }
"#,
        )
        .unwrap();

        assert_eq!(models.len(), 2);
        let partner = &models[0];
        assert_eq!(partner.table_name(), "res_partner");
        assert_eq!(partner.fields["name"].kind, FieldType::Char);
        assert_eq!(partner.fields["name"].size, Some(128));
        assert!(partner.fields["name"].required);
        assert!(matches!(
            &partner.defaults["active"],
            DefaultSpec::Value(serde_json::Value::Bool(true))
        ));

        let invoice = &models[1];
        assert_eq!(invoice.inherits["res.partner"], "partner_id");
        assert_eq!(
            invoice.fields["partner_id"].ondelete,
            Some(OnDelete::Restrict)
        );
        let compute = invoice.fields["amount"].compute.as_ref().unwrap();
        assert_eq!(compute.function, "compute_amount");
        let triggers = &compute.stored.as_ref().unwrap().triggers;
        assert_eq!(triggers[0].model, "account.invoice.line");
        assert_eq!(triggers[0].priority, 10);
    }

    #[test]
    fn test_stored_flags() {
        let plain = FieldDefinition::char(64);
        assert!(plain.is_stored());
        assert!(plain.classic_write());
        assert!(plain.prefetch());

        let pure = FieldDefinition::new(FieldType::Float).computed(ComputeSpec::readonly("f"));
        assert!(!pure.is_stored());
        assert!(!pure.classic_write());

        let stored = FieldDefinition::new(FieldType::Float)
            .computed(ComputeSpec::stored("f", vec![StoreTrigger::new("m", None, &[], 10)]));
        assert!(stored.is_stored());
        assert!(!stored.classic_write());

        let o2m = FieldDefinition::one2many("child", "parent_id");
        assert!(!o2m.is_stored());

        let binary = FieldDefinition::new(FieldType::Binary);
        assert!(binary.is_stored());
        assert!(!binary.prefetch());
    }
}
