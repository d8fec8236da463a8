//! Spreadsheet (CSV) parsing for bulk inventory uploads.
//!
//! File-level problems (wrong type, too big, too many rows, missing
//! columns) reject the whole upload. Row-level problems become [`RowError`]s
//! and never stop the remaining rows from being parsed.

use crate::error::MarketError;
use crate::models::{Condition, ParsedRow, RawRow, RowError, RowErrorCode};
use csv::{ReaderBuilder, StringRecord};
use once_cell::sync::Lazy;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;

const OP: &str = "parse";

/// Column order of the upload template and of generated corrections files.
pub const TEMPLATE_COLUMNS: [&str; 9] = [
    "name",
    "brand",
    "sku",
    "price",
    "stock",
    "condition",
    "category",
    "specs",
    "images",
];

pub const ACCEPTED_CONTENT_TYPES: &[&str] = &[
    "text/csv",
    "application/csv",
    "text/plain",
    "application/vnd.ms-excel",
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ParserLimits {
    pub max_rows: usize,
    pub max_bytes: usize,
    pub max_images: usize,
}

impl Default for ParserLimits {
    fn default() -> Self {
        Self {
            max_rows: 200,
            max_bytes: 10 * 1024 * 1024,
            max_images: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Column {
    Name,
    Brand,
    Sku,
    Price,
    Stock,
    Condition,
    Category,
    Specs,
    Images,
}

static HEADER_ALIASES: Lazy<HashMap<&'static str, Column>> = Lazy::new(|| {
    let table: &[(&[&str], Column)] = &[
        (&["name", "product", "product_name", "title"], Column::Name),
        (&["brand", "manufacturer", "make"], Column::Brand),
        (&["sku", "seller_sku", "item_code"], Column::Sku),
        (&["price", "unit_price", "selling_price"], Column::Price),
        (
            &["stock", "quantity", "qty", "stock_quantity", "stock_qty"],
            Column::Stock,
        ),
        (&["condition", "item_condition"], Column::Condition),
        (&["category", "category_hint", "category_name"], Column::Category),
        (&["specs", "specifications", "attributes"], Column::Specs),
        (&["images", "image_urls", "image_url", "image"], Column::Images),
    ];
    table
        .iter()
        .flat_map(|(aliases, column)| aliases.iter().map(move |alias| (*alias, *column)))
        .collect()
});

/// One non-blank data record, keyed by its 1-based position below the
/// header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetRow {
    pub row_index: usize,
    pub raw: RawRow,
}

#[derive(Debug, Clone, Default)]
pub struct ParseOutcome {
    pub rows: Vec<ParsedRow>,
    pub errors: Vec<RowError>,
    /// Every non-blank record, parsed or not, in file order.
    pub records: Vec<SheetRow>,
}

impl ParseOutcome {
    pub fn errors_for(&self, row_index: usize) -> Vec<RowError> {
        self.errors
            .iter()
            .filter(|err| err.row_index == row_index)
            .cloned()
            .collect()
    }

    pub fn parsed(&self, row_index: usize) -> Option<&ParsedRow> {
        self.rows.iter().find(|row| row.row_index == row_index)
    }
}

pub fn check_content_type(content_type: &str) -> Result<(), MarketError> {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if ACCEPTED_CONTENT_TYPES.contains(&essence.as_str()) {
        Ok(())
    } else {
        Err(MarketError::invalid_input(
            OP,
            format!("unsupported_content_type: `{essence}`; upload a CSV export of the template"),
        ))
    }
}

pub fn parse_sheet(
    bytes: &[u8],
    content_type: &str,
    limits: &ParserLimits,
) -> Result<ParseOutcome, MarketError> {
    check_content_type(content_type)?;
    if bytes.is_empty() {
        return Err(MarketError::invalid_input(OP, "empty_file"));
    }
    if bytes.len() > limits.max_bytes {
        return Err(MarketError::invalid_input(
            OP,
            format!("file_too_large: limit is {} bytes", limits.max_bytes),
        ));
    }

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::None)
        .from_reader(bytes);

    let headers = reader
        .headers()
        .map_err(|err| MarketError::invalid_input(OP, format!("unreadable_header: {err}")))?
        .clone();
    let columns = map_headers(&headers)?;

    let mut records = Vec::new();
    for (idx, result) in reader.records().enumerate() {
        let record = result.map_err(|err| {
            MarketError::invalid_input(OP, format!("unreadable_row {}: {err}", idx + 1))
        })?;
        let raw = raw_row(&record, &columns);
        if raw.is_blank() {
            continue;
        }
        records.push(SheetRow {
            row_index: idx + 1,
            raw,
        });
    }

    // Ceiling is enforced before any row is interpreted.
    if records.len() > limits.max_rows {
        return Err(MarketError::invalid_input(
            OP,
            format!(
                "too_many_rows: {} rows found, at most {} per upload",
                records.len(),
                limits.max_rows
            ),
        ));
    }
    if records.is_empty() {
        return Err(MarketError::invalid_input(OP, "no_data_rows"));
    }

    let mut outcome = ParseOutcome::default();
    for record in &records {
        match parse_row(record.row_index, &record.raw, limits) {
            Ok(row) => outcome.rows.push(row),
            Err(mut errors) => outcome.errors.append(&mut errors),
        }
    }
    outcome.records = records;
    Ok(outcome)
}

fn map_headers(headers: &StringRecord) -> Result<HashMap<Column, usize>, MarketError> {
    let mut columns = HashMap::new();
    for (idx, header) in headers.iter().enumerate() {
        let normalized = header
            .trim_start_matches('\u{feff}')
            .trim()
            .to_ascii_lowercase()
            .replace([' ', '-'], "_");
        if let Some(column) = HEADER_ALIASES.get(normalized.as_str()) {
            columns.entry(*column).or_insert(idx);
        }
    }

    let missing: Vec<&str> = [
        (Column::Name, "name"),
        (Column::Price, "price"),
        (Column::Stock, "stock"),
    ]
    .iter()
    .filter(|(column, _)| !columns.contains_key(column))
    .map(|(_, label)| *label)
    .collect();
    if !missing.is_empty() {
        return Err(MarketError::invalid_input(
            OP,
            format!("missing_columns: {}", missing.join(", ")),
        ));
    }
    Ok(columns)
}

fn raw_row(record: &StringRecord, columns: &HashMap<Column, usize>) -> RawRow {
    let cell = |column: Column| -> String {
        columns
            .get(&column)
            .and_then(|idx| record.get(*idx))
            .unwrap_or_default()
            .to_string()
    };
    RawRow {
        name: cell(Column::Name),
        brand: cell(Column::Brand),
        sku: cell(Column::Sku),
        price: cell(Column::Price),
        stock: cell(Column::Stock),
        condition: cell(Column::Condition),
        category: cell(Column::Category),
        specs: cell(Column::Specs),
        images: cell(Column::Images),
    }
}

/// Parses one record; all problems in the row are reported together.
pub fn parse_row(
    row_index: usize,
    raw: &RawRow,
    limits: &ParserLimits,
) -> Result<ParsedRow, Vec<RowError>> {
    let mut errors = Vec::new();

    let name = raw.name.trim();
    if name.is_empty() {
        errors.push(RowError::new(
            row_index,
            "name",
            RowErrorCode::MissingName,
            "Product name is required",
        ));
    }

    let price = parse_price(&raw.price).map_err(|message| {
        errors.push(RowError::new(
            row_index,
            "price",
            RowErrorCode::InvalidPrice,
            message,
        ))
    });

    let stock = parse_stock(&raw.stock).map_err(|message| {
        errors.push(RowError::new(
            row_index,
            "stock",
            RowErrorCode::InvalidStock,
            message,
        ))
    });

    let condition = match optional(&raw.condition) {
        None => Ok(Condition::New),
        Some(text) => Condition::parse(text).ok_or_else(|| {
            errors.push(RowError::new(
                row_index,
                "condition",
                RowErrorCode::InvalidCondition,
                format!(
                    "Condition `{text}` is not one of NEW, REFURBISHED, USED_LIKE_NEW, USED_GOOD, USED_FAIR"
                ),
            ))
        }),
    };

    let specs = match optional(&raw.specs) {
        None => Ok(None),
        Some(text) => parse_specs(text).map(Some).map_err(|message| {
            errors.push(RowError::new(
                row_index,
                "specs",
                RowErrorCode::InvalidSpecs,
                message,
            ))
        }),
    };

    let images = match optional(&raw.images) {
        None => Ok(None),
        Some(text) => parse_images(text, limits.max_images)
            .map(Some)
            .map_err(|(code, message)| {
                errors.push(RowError::new(row_index, "images", code, message))
            }),
    };

    match (price, stock, condition, specs, images) {
        (Ok(price), Ok(stock), Ok(condition), Ok(specs), Ok(images)) if errors.is_empty() => {
            Ok(ParsedRow {
                row_index,
                name: name.to_string(),
                brand: optional(&raw.brand).map(str::to_string),
                sku: optional(&raw.sku).map(str::to_string),
                price,
                stock,
                condition,
                category: optional(&raw.category).map(str::to_string),
                specs,
                images,
            })
        }
        _ => Err(errors),
    }
}

fn optional(cell: &str) -> Option<&str> {
    let trimmed = cell.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

fn parse_price(cell: &str) -> Result<Decimal, String> {
    let text = cell.trim();
    if text.is_empty() {
        return Err("Price is required".into());
    }
    let value =
        Decimal::from_str(text).map_err(|_| format!("Price must be a number, got `{text}`"))?;
    if value <= Decimal::ZERO {
        return Err(format!("Price must be greater than zero, got `{text}`"));
    }
    Ok(value.normalize())
}

fn parse_stock(cell: &str) -> Result<u32, String> {
    let text = cell.trim();
    if text.is_empty() {
        return Err("Stock quantity is required".into());
    }
    let value: i64 = text
        .parse()
        .map_err(|_| format!("Stock quantity must be a whole number, got `{text}`"))?;
    if value < 0 {
        return Err(format!("Stock quantity cannot be negative, got `{text}`"));
    }
    u32::try_from(value).map_err(|_| format!("Stock quantity `{text}` is too large"))
}

/// `Key: Value; Key: Value` (`=` also accepted as the separator).
pub fn parse_specs(text: &str) -> Result<BTreeMap<String, String>, String> {
    let mut specs = BTreeMap::new();
    for pair in text.split([';', '\n']).map(str::trim).filter(|p| !p.is_empty()) {
        let Some((key, value)) = pair.split_once([':', '=']) else {
            return Err(format!("Spec `{pair}` must look like `Key: Value`"));
        };
        let (key, value) = (key.trim(), value.trim());
        if key.is_empty() || value.is_empty() {
            return Err(format!("Spec `{pair}` needs both a key and a value"));
        }
        specs.insert(key.to_string(), value.to_string());
    }
    if specs.is_empty() {
        return Err("Specs column has no `Key: Value` pairs".into());
    }
    Ok(specs)
}

pub fn parse_images(text: &str, max_images: usize) -> Result<Vec<String>, (RowErrorCode, String)> {
    let mut seen = HashSet::new();
    let mut urls = Vec::new();
    for entry in text
        .split(['|', ',', ';', '\n', ' '])
        .map(str::trim)
        .filter(|e| !e.is_empty())
    {
        let parsed = reqwest::Url::parse(entry).map_err(|_| {
            (
                RowErrorCode::InvalidImages,
                format!("Image `{entry}` is not a valid URL"),
            )
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err((
                RowErrorCode::InvalidImages,
                format!("Image `{entry}` must be an http or https link"),
            ));
        }
        if seen.insert(entry.to_string()) {
            urls.push(entry.to_string());
        }
    }
    if urls.len() > max_images {
        return Err((
            RowErrorCode::TooManyImages,
            format!("At most {max_images} images per product, got {}", urls.len()),
        ));
    }
    Ok(urls)
}
