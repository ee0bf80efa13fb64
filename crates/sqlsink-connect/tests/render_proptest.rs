//! Property tests for template compilation, rendering and aggregation

use proptest::prelude::*;
use sqlsink_connect::prelude::*;

fn field_names() -> impl Strategy<Value = Vec<String>> {
    prop::collection::btree_set("f_[a-z0-9_]{0,8}", 1..6)
        .prop_map(|names| names.into_iter().collect())
}

fn insert_sql(table: &str, fields: &[String]) -> String {
    let placeholders: Vec<String> = fields.iter().map(|f| format!("${{{f}}}")).collect();
    format!(
        "INSERT INTO {table} ({}) VALUES ({})",
        fields.join(", "),
        placeholders.join(", ")
    )
}

fn tuple(values: &[i64]) -> String {
    let values: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    format!("({})", values.join(", "))
}

proptest! {
    #[test]
    fn literal_text_renders_verbatim(text in "[a-zA-Z0-9 (),'{}]{0,64}") {
        let template = Template::parse(&text);
        prop_assert!(template.is_constant());
        prop_assert_eq!(render(&template, &Record::new()), text.into_bytes());
    }

    #[test]
    fn single_record_substitutes_every_field(
        (fields, values) in field_names().prop_flat_map(|fields| {
            let n = fields.len();
            (Just(fields), prop::collection::vec(any::<i64>(), n))
        })
    ) {
        let compiled = compile(&insert_sql("t", &fields)).unwrap();
        let record: Record = fields.iter().cloned().zip(values.iter().copied()).collect();

        let sql = String::from_utf8(render(&compiled.insert_template, &record)).unwrap();
        let expected = format!("INSERT INTO t ({}) VALUES {}", fields.join(", "), tuple(&values));
        prop_assert_eq!(sql, expected);
    }

    #[test]
    fn batch_is_prefix_plus_space_separated_tuples(
        (fields, rows) in field_names().prop_flat_map(|fields| {
            let n = fields.len();
            (
                Just(fields),
                prop::collection::vec(prop::collection::vec(any::<i64>(), n), 1..8),
            )
        })
    ) {
        let compiled = compile(&insert_sql("metrics", &fields)).unwrap();
        let records: Vec<Record> = rows
            .iter()
            .map(|row| fields.iter().cloned().zip(row.iter().copied()).collect())
            .collect();

        let sql = String::from_utf8(aggregate(
            &compiled.batch_template,
            &records,
            &compiled.batch_prefix,
        ))
        .unwrap();

        let tuples: Vec<String> = rows.iter().map(|row| tuple(row)).collect();
        let expected = format!(
            "INSERT INTO metrics ({}) VALUES {}",
            fields.join(", "),
            tuples.join(" ")
        );
        prop_assert_eq!(sql, expected);
    }

    #[test]
    fn empty_records_render_null_everywhere(fields in field_names()) {
        let compiled = compile(&insert_sql("t", &fields)).unwrap();
        let sql = String::from_utf8(render(&compiled.insert_template, &Record::new())).unwrap();

        prop_assert_eq!(sql.matches("NULL").count(), fields.len());
        prop_assert!(!sql.contains("${"), "rendered SQL still contains a placeholder: {}", sql);
    }
}
