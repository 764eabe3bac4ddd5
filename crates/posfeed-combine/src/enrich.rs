//! Positional extraction and enrichment of transaction rows.

use posfeed_core::{normalize_value, FieldMap, FieldValue};

use crate::lookup::{strip_excel_wrapper, LookupSet};

/// Header of the flat output, also the field names of the stored document.
pub const RECORD_HEADERS: [&str; 27] = [
    "POS",
    "OR",
    "ITEM CODE",
    "QUANTITY",
    "UNIT PRICE",
    "AMOUNT",
    "DISCOUNT",
    "DEPARTMENT CODE",
    "DATE",
    "TIME",
    "DISCOUNT CODE",
    "TYPE CODE",
    "VAT DIV",
    "VAT AMOUNT",
    "VAT_DISCOUNT",
    "VAT PRICE",
    "VAT FLAG",
    "TRANSACTION NUMBER",
    "PRODUCT NAME",
    "DEPARTMENT NAME",
    "DISCOUNT NAME",
    "TRANSACTION TYPE",
    "DAYPART",
    "PAYMENT CODE",
    "PAYMENT NAME",
    "PHONE NUMBER",
    "BRANCH",
];

/// Source columns copied, in order, into the first 18 output fields.
pub const TRANSACTION_COLUMNS: [usize; 18] = [
    0, 2, 4, 5, 6, 7, 8, 11, 12, 13, 18, 21, 31, 32, 34, 35, 36, 37,
];

const DATE_COLUMN: usize = 12;

const POS: usize = 0;
const ITEM_CODE: usize = 2;
const DEPARTMENT_CODE: usize = 7;
const TIME: usize = 9;
const DISCOUNT_CODE: usize = 10;
const TYPE_CODE: usize = 11;
const TRANSACTION_NUMBER: usize = 17;

pub const NO_TIME_RECORD: &str = "No Time Record";

const DAYPARTS: [&str; 25] = [
    "GY", "GY", "GY", "GY", "GY", "GY", // 00-05
    "Breakfast", "Breakfast", "Breakfast", "Breakfast", "Breakfast", // 06-10
    "Lunch", "Lunch", "Lunch", "Lunch", // 11-14
    "PM Snack", "PM Snack", "PM Snack", "PM Snack", // 15-18
    "Dinner", "Dinner", "Dinner", "Dinner", // 19-22
    "GY", "GY", // 23-24
];

/// Meal period for a `HH:MM...` time. Unparseable hours read as midnight.
pub fn daypart(time: &str) -> &'static str {
    let time = time.trim();
    if time.chars().count() < 2 {
        return NO_TIME_RECORD;
    }
    let digits: String = time
        .chars()
        .take(2)
        .take_while(|c| c.is_ascii_digit())
        .collect();
    let hour: usize = digits.parse().unwrap_or(0);
    DAYPARTS.get(hour).copied().unwrap_or(NO_TIME_RECORD)
}

pub fn transaction_type(code: &str) -> &'static str {
    match code.trim() {
        "D" => "Dine-In",
        "T" => "Take-Out",
        "C" => "Delivery",
        _ => "",
    }
}

/// One transaction row after the lookup join, in [`RECORD_HEADERS`] order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichedRow {
    values: Vec<String>,
}

impl EnrichedRow {
    /// Project and enrich a raw transaction record. Returns `None` for blank rows.
    pub fn from_record<S: AsRef<str>>(
        record: &[S],
        pos: &str,
        branch: &str,
        lookups: &LookupSet,
    ) -> Option<Self> {
        if record.iter().all(|field| field.as_ref().trim().is_empty()) {
            return None;
        }

        let mut values: Vec<String> = TRANSACTION_COLUMNS
            .iter()
            .map(|&index| {
                let raw: &str = record.get(index).map(|field| field.as_ref()).unwrap_or("");
                let value = normalize_value(raw);
                if index == DATE_COLUMN {
                    value.split(' ').next().unwrap_or_default().to_string()
                } else {
                    value
                }
            })
            .collect();
        values[POS] = pos.to_string();

        let (product_name, override_code) = match lookups.item(&values[ITEM_CODE]) {
            Some(item) => (item.name.clone(), item.department_code.clone()),
            None => (String::new(), None),
        };
        if let Some(code) = override_code {
            values[DEPARTMENT_CODE] = code;
        }
        let department_code = strip_excel_wrapper(&values[DEPARTMENT_CODE]);
        let department_name = lookups.department_name(&department_code).to_string();
        let discount_name = lookups.discount_name(&values[DISCOUNT_CODE]).to_string();
        let kind = transaction_type(&values[TYPE_CODE]).to_string();
        let period = daypart(&values[TIME]).to_string();

        let transaction = values[TRANSACTION_NUMBER].clone();
        let payment_code = lookups.payment_code(&transaction).to_string();
        let payment_name = lookups.payment_name(&payment_code).to_string();
        let phone = lookups.phone(&transaction).to_string();

        values.extend([
            product_name,
            department_name,
            discount_name,
            kind,
            period,
            payment_code,
            payment_name,
            phone,
            branch.to_string(),
        ]);
        debug_assert_eq!(values.len(), RECORD_HEADERS.len());
        Some(Self { values })
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn get(&self, header: &str) -> Option<&str> {
        RECORD_HEADERS
            .iter()
            .position(|h| *h == header)
            .and_then(|i| self.values.get(i))
            .map(String::as_str)
    }

    /// The same values keyed by header, for the stored document.
    pub fn fields(&self) -> FieldMap {
        RECORD_HEADERS
            .iter()
            .zip(&self.values)
            .map(|(header, value)| (header.to_string(), FieldValue::Text(value.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::ItemEntry;

    fn record(pairs: &[(usize, &str)]) -> Vec<String> {
        let mut row = vec![String::new(); 38];
        for (i, v) in pairs {
            row[*i] = v.to_string();
        }
        row
    }

    fn scenario_lookups() -> LookupSet {
        let mut set = LookupSet::default();
        set.items.insert(
            "X1".into(),
            ItemEntry {
                name: "Widget".into(),
                department_code: Some("10".into()),
            },
        );
        set.departments.insert("10".into(), "Beverages".into());
        set.departments.insert("99".into(), "Other".into());
        set.discounts.insert("SC".into(), "Senior".into());
        set.payment_codes.insert("T1".into(), "CASH".into());
        set.payment_names.insert("CASH".into(), "Cash".into());
        set.phones.insert("T1".into(), "09171234567".into());
        set
    }

    #[test]
    fn daypart_table_covers_the_day() {
        assert_eq!(daypart("05:59"), "GY");
        assert_eq!(daypart("06:00"), "Breakfast");
        assert_eq!(daypart("11:30"), "Lunch");
        assert_eq!(daypart("15:00"), "PM Snack");
        assert_eq!(daypart("22:59"), "Dinner");
        assert_eq!(daypart("23:10"), "GY");
        assert_eq!(daypart("24:00"), "GY");
        assert_eq!(daypart("9:15"), "Breakfast");
        assert_eq!(daypart("ab:cd"), "GY");
        assert_eq!(daypart("7"), NO_TIME_RECORD);
        assert_eq!(daypart("31:00"), NO_TIME_RECORD);
    }

    #[test]
    fn type_codes_map_to_labels() {
        assert_eq!(transaction_type("D"), "Dine-In");
        assert_eq!(transaction_type("T"), "Take-Out");
        assert_eq!(transaction_type("C"), "Delivery");
        assert_eq!(transaction_type("Z"), "");
    }

    #[test]
    fn item_department_override_feeds_department_name() {
        let row = record(&[
            (0, "9"),
            (2, "00042"),
            (4, "X1"),
            (11, "99"),
            (12, "07/01/2025 00:00:00"),
            (13, "12:05"),
            (18, "SC"),
            (21, "D"),
            (37, "T1"),
        ]);
        let enriched = EnrichedRow::from_record(&row, "2", "AYALA", &scenario_lookups()).unwrap();
        assert_eq!(enriched.get("POS"), Some("2"));
        assert_eq!(enriched.get("DATE"), Some("07/01/2025"));
        assert_eq!(enriched.get("PRODUCT NAME"), Some("Widget"));
        assert_eq!(enriched.get("DEPARTMENT CODE"), Some("10"));
        assert_eq!(enriched.get("DEPARTMENT NAME"), Some("Beverages"));
        assert_eq!(enriched.get("DISCOUNT NAME"), Some("Senior"));
        assert_eq!(enriched.get("TRANSACTION TYPE"), Some("Dine-In"));
        assert_eq!(enriched.get("DAYPART"), Some("Lunch"));
        assert_eq!(enriched.get("PAYMENT CODE"), Some("CASH"));
        assert_eq!(enriched.get("PAYMENT NAME"), Some("Cash"));
        assert_eq!(enriched.get("PHONE NUMBER"), Some("09171234567"));
        assert_eq!(enriched.get("BRANCH"), Some("AYALA"));
    }

    #[test]
    fn unmapped_codes_enrich_to_empty_strings() {
        let row = record(&[(4, "NOPE"), (11, "=\"77\""), (37, "T9")]);
        let enriched = EnrichedRow::from_record(&row, "1", "B", &scenario_lookups()).unwrap();
        assert_eq!(enriched.get("PRODUCT NAME"), Some(""));
        assert_eq!(enriched.get("DEPARTMENT NAME"), Some(""));
        assert_eq!(enriched.get("PAYMENT NAME"), Some(""));
        assert_eq!(enriched.get("PHONE NUMBER"), Some(""));
        assert_eq!(enriched.get("DAYPART"), Some(NO_TIME_RECORD));
    }

    #[test]
    fn short_rows_pad_and_blank_rows_are_dropped() {
        let short = vec!["1".to_string(), "x".to_string(), "55".to_string()];
        let enriched = EnrichedRow::from_record(&short, "1", "B", &LookupSet::default()).unwrap();
        assert_eq!(enriched.values().len(), RECORD_HEADERS.len());
        assert_eq!(enriched.get("OR"), Some("55"));

        let blank = vec![" ".to_string(), String::new()];
        assert!(EnrichedRow::from_record(&blank, "1", "B", &LookupSet::default()).is_none());
    }

    #[test]
    fn document_fields_mirror_flat_values() {
        let row = record(&[(2, "1"), (4, "X1"), (13, "08:00")]);
        let enriched = EnrichedRow::from_record(&row, "1", "B", &scenario_lookups()).unwrap();
        let fields = enriched.fields();
        for (header, value) in RECORD_HEADERS.iter().zip(enriched.values()) {
            assert_eq!(fields.get(*header).and_then(FieldValue::as_text), Some(value.as_str()));
        }
    }
}
