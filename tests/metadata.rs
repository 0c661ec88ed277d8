use assert_matches::assert_matches;
use serde_json::json;

use catalog_tms::error::CatalogError;
use catalog_tms::metadata::{
    parse_key_expression, to_html, to_indented_text, to_key_value_lines, value_at_path,
    value_from_metadata,
};

#[test]
fn indented_text_sorts_keys_and_nests() {
    let value = json!({"b": 1, "a": {"c": "x"}});
    assert_eq!(to_indented_text(&value), "a\n- c: x\nb: 1");
}

#[test]
fn indented_text_inlines_array_scalars_before_composites() {
    let value = json!({"l": [1, 2, {"k": true}]});
    assert_eq!(to_indented_text(&value), "l: 1, 2\n- [dict]\n- - k: true");
}

#[test]
fn html_follows_text_order() {
    let value = json!({"b": 1, "a": {"c": "x"}});
    assert_eq!(
        to_html(&value),
        "<ul><li>a</li><ul><li>c: x</li></ul><li>b: 1</li></ul>"
    );
}

#[test]
fn key_value_lines_list_every_leaf() {
    let value = json!({"a": {"c": "x"}, "b": [1, 2]});
    assert_eq!(
        to_key_value_lines(&value),
        "'\"a\", \"c\"' = x\n'\"b\"' = 1\n'\"b\"' = 2"
    );
}

#[test]
fn value_at_path_resolves_leaf() {
    let value = json!({"a": {"b": 5}});
    assert_eq!(value_at_path(&value, &["a", "b"]).unwrap(), &json!(5));
}

#[test]
fn value_at_path_reports_unknown_key() {
    let value = json!({"a": {"b": 5}});
    let err = value_at_path(&value, &["a", "c"]).unwrap_err();
    assert_matches!(&err, CatalogError::InvalidKey(path) if path == "'a' -> 'c'");
}

#[test]
fn value_at_path_requires_a_leaf() {
    let value = json!({"a": {"b": 5}});
    assert_matches!(
        value_at_path(&value, &["a"]),
        Err(CatalogError::MissingPath(_))
    );
}

#[test]
fn value_at_path_rejects_key_past_a_scalar() {
    let value = json!({"a": 5});
    assert_matches!(
        value_at_path(&value, &["a", "b"]),
        Err(CatalogError::InvalidTerminalKey(_))
    );
}

#[test]
fn key_expression_parses_quoted_keys() {
    assert_eq!(
        parse_key_expression(r#""TMS","minimum_tile""#).unwrap(),
        ["TMS", "minimum_tile"]
    );
    assert_matches!(
        parse_key_expression(r#""TMS"#),
        Err(CatalogError::InvalidKeyExpression(_))
    );
    assert_matches!(
        parse_key_expression("  "),
        Err(CatalogError::InvalidKeyExpression(_))
    );
}

#[test]
fn value_from_metadata_reads_serialized_document() {
    let meta = json!({"TMS": {"minimum_tile": {"x": 135, "y": 91, "z": 8}}, "cloud_coverage": 12.5});
    let value = value_from_metadata(&meta.to_string(), r#""TMS","minimum_tile","z""#).unwrap();
    assert_eq!(value, json!(8));
    let cloud = value_from_metadata(&meta.to_string(), r#""cloud_coverage""#).unwrap();
    assert_eq!(cloud, json!(12.5));
}
