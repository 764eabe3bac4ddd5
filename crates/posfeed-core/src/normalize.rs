//! Row normalization and dedup fingerprints.

use unicode_normalization::UnicodeNormalization;

use crate::{FieldMap, FieldValue};

/// Header aliases for the receipt (OR) number, first match wins.
pub const RECEIPT_ALIASES: &[&str] = &["OR", "Or", "or", "OR_NO", "OR#"];
/// Header aliases for the item code.
pub const ITEM_CODE_ALIASES: &[&str] = &["ITEM_CODE", "ITEM CODE", "ITEM", "ITEMCODE"];
/// Header aliases for the transaction timestamp.
pub const TIME_ALIASES: &[&str] = &["TIME", "Time", "TIME_IN", "TIMEOUT"];

/// Trim and convert to canonical decomposition (NFD).
pub fn normalize_value(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    trimmed.nfd().collect()
}

pub fn normalize_field(value: FieldValue) -> FieldValue {
    match value {
        FieldValue::Text(s) => FieldValue::Text(normalize_value(&s)),
        other => other,
    }
}

pub fn normalize_row<I>(fields: I) -> FieldMap
where
    I: IntoIterator<Item = (String, FieldValue)>,
{
    fields
        .into_iter()
        .map(|(key, value)| (key.trim().to_string(), normalize_field(value)))
        .collect()
}

fn pick_field<'a>(data: &'a FieldMap, aliases: &[&str]) -> Option<String> {
    aliases.iter().find_map(|alias| {
        data.get(*alias)
            .filter(|v| !v.is_blank())
            .map(|v| v.render().trim().to_string())
    })
}

/// `branch|pos|receipt|time|item`, or `None` when any part is missing.
///
/// Rows without a fingerprint are still stored; they are just not protected
/// by the unique-key constraint.
pub fn fingerprint(data: &FieldMap, branch: Option<&str>, pos: Option<u32>) -> Option<String> {
    let branch = branch.filter(|b| !b.trim().is_empty())?;
    let pos = pos?;
    let receipt = pick_field(data, RECEIPT_ALIASES)?;
    let item_code = pick_field(data, ITEM_CODE_ALIASES)?;
    let time = pick_field(data, TIME_ALIASES)?;
    Some(format!("{branch}|{pos}|{receipt}|{time}|{item_code}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, &str)]) -> FieldMap {
        normalize_row(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), FieldValue::Text(v.to_string()))),
        )
    }

    #[test]
    fn values_are_trimmed_and_decomposed() {
        assert_eq!(normalize_value("  Jalapeño \t"), "Jalapen\u{303}o");
        assert_eq!(normalize_value("   "), "");
        assert_eq!(
            normalize_field(FieldValue::Number(1.5)),
            FieldValue::Number(1.5)
        );
        assert_eq!(normalize_field(FieldValue::Null), FieldValue::Null);
    }

    #[test]
    fn header_keys_are_trimmed() {
        let data = row(&[(" ITEM CODE ", " X1 ")]);
        assert_eq!(data.get("ITEM CODE"), Some(&FieldValue::Text("X1".into())));
    }

    #[test]
    fn rows_keep_source_column_order() {
        let data = row(&[("TIME", "09:00"), ("OR", "1"), ("ITEM CODE", "X1"), ("AMOUNT", "5")]);
        let keys: Vec<&str> = data.keys().map(String::as_str).collect();
        assert_eq!(keys, ["TIME", "OR", "ITEM CODE", "AMOUNT"]);

        let json = serde_json::to_string(&data).unwrap();
        assert_eq!(
            json,
            r#"{"TIME":"09:00","OR":"1","ITEM CODE":"X1","AMOUNT":"5"}"#
        );
    }

    #[test]
    fn fingerprint_uses_first_present_alias() {
        let data = row(&[
            ("OR", ""),
            ("OR_NO", "000123"),
            ("ITEM CODE", "X1"),
            ("TIME_IN", "12:30"),
        ]);
        assert_eq!(
            fingerprint(&data, Some("AYALA"), Some(2)).as_deref(),
            Some("AYALA|2|000123|12:30|X1")
        );
    }

    #[test]
    fn fingerprint_requires_every_part() {
        let data = row(&[("OR", "1"), ("ITEM", "X1")]);
        assert_eq!(fingerprint(&data, Some("B"), Some(1)), None);

        let full = row(&[("OR", "1"), ("ITEM", "X1"), ("TIME", "09:00")]);
        assert_eq!(fingerprint(&full, None, Some(1)), None);
        assert_eq!(fingerprint(&full, Some("  "), Some(1)), None);
        assert_eq!(fingerprint(&full, Some("B"), None), None);
        assert!(fingerprint(&full, Some("B"), Some(1)).is_some());
    }
}
