//! Turns parsed rows into staged rows: category lookup, catalog match and
//! the duplicate checks that need the whole file or the shop's inventory.

use super::matcher::{MatchDecision, ProductMatcher, match_key};
use super::parser::ParseOutcome;
use crate::error::MarketError;
use crate::models::{Category, MatchKind, RowError, RowErrorCode, StagedRow};
use crate::store::ShopListingKeys;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub struct StagingContext<'a> {
    pub categories: &'a [Category],
    pub matcher: &'a ProductMatcher,
    pub listing: &'a ShopListingKeys,
}

/// How a seller settles an ambiguous catalog match.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Resolution {
    Product { product_id: Uuid },
    CreateNew,
}

#[derive(Default)]
struct SeenInFile {
    keys: HashMap<String, usize>,
    products: HashMap<Uuid, usize>,
    skus: HashMap<String, usize>,
}

pub fn stage_rows(batch_id: Uuid, outcome: &ParseOutcome, ctx: &StagingContext<'_>) -> Vec<StagedRow> {
    let mut seen = SeenInFile::default();
    outcome
        .records
        .iter()
        .map(|record| {
            let mut row = StagedRow {
                batch_id,
                row_index: record.row_index,
                raw: record.raw.clone(),
                parsed: outcome.parsed(record.row_index).cloned(),
                resolved_product_id: None,
                category_id: None,
                is_valid: false,
                errors: outcome.errors_for(record.row_index),
                match_kind: None,
                confidence: None,
                candidates: Vec::new(),
            };
            if row.parsed.is_some() {
                classify(&mut row, ctx, &mut seen);
            }
            row.is_valid = row.parsed.is_some() && row.errors.is_empty() && !row.is_ambiguous();
            row
        })
        .collect()
}

fn classify(row: &mut StagedRow, ctx: &StagingContext<'_>, seen: &mut SeenInFile) {
    let Some(parsed) = row.parsed.clone() else {
        return;
    };
    let index = row.row_index;

    if let Some(hint) = parsed.category.as_deref() {
        match find_category(ctx.categories, hint) {
            Some(category) => row.category_id = Some(category.id),
            None => row.errors.push(RowError::new(
                index,
                "category",
                RowErrorCode::UnknownCategory,
                format!("Category `{hint}` does not exist"),
            )),
        }
    }

    match ctx.matcher.decide(&parsed.name, parsed.brand.as_deref()) {
        MatchDecision::Match {
            product_id,
            confidence,
            exact,
        } => {
            row.match_kind = Some(if exact { MatchKind::Exact } else { MatchKind::Fuzzy });
            row.resolved_product_id = Some(product_id);
            row.confidence = Some(confidence);
        }
        MatchDecision::Ambiguous { candidates } => {
            row.match_kind = Some(MatchKind::Ambiguous);
            row.confidence = candidates.first().map(|c| (c.score * 1000.0).round() / 1000.0);
            row.candidates = candidates.iter().map(|c| c.product_id).collect();
        }
        MatchDecision::New => {
            row.match_kind = Some(MatchKind::New);
        }
    }

    if let Some(product_id) = row.resolved_product_id
        && ctx.listing.product_ids.contains(&product_id)
    {
        row.errors.push(already_in_shop(index));
    }

    let key = match_key(&parsed.name, parsed.brand.as_deref());
    let earlier = seen.keys.get(&key).copied().or_else(|| {
        row.resolved_product_id
            .and_then(|id| seen.products.get(&id).copied())
    });
    match earlier {
        Some(first) => row.errors.push(duplicate_in_file(index, first)),
        None => {
            seen.keys.insert(key, index);
            if let Some(id) = row.resolved_product_id {
                seen.products.insert(id, index);
            }
        }
    }

    if let Some(sku) = parsed.sku.as_deref() {
        let folded = sku.to_lowercase();
        if ctx.listing.skus.contains(&folded) {
            row.errors.push(RowError::new(
                index,
                "sku",
                RowErrorCode::DuplicateSku,
                format!("SKU `{sku}` already exists in this shop"),
            ));
        } else if let Some(first) = seen.skus.get(&folded) {
            row.errors.push(RowError::new(
                index,
                "sku",
                RowErrorCode::DuplicateSku,
                format!("SKU `{sku}` is also used on row {first}"),
            ));
        } else {
            seen.skus.insert(folded, index);
        }
    }
}

/// Case-insensitive name lookup; a category id is accepted too.
pub fn find_category<'a>(categories: &'a [Category], hint: &str) -> Option<&'a Category> {
    let hint = hint.trim();
    let by_id = Uuid::parse_str(hint).ok();
    categories
        .iter()
        .find(|c| Some(c.id) == by_id || c.name.eq_ignore_ascii_case(hint))
}

/// Applies a seller's choice to an ambiguous row. `others` are the batch's
/// remaining staged rows, used to keep products unique within the file.
pub fn resolve_row(
    row: &mut StagedRow,
    resolution: Resolution,
    listing: &ShopListingKeys,
    others: &[StagedRow],
) -> Result<(), MarketError> {
    const OP: &str = "resolve_row";
    if row.match_kind != Some(MatchKind::Ambiguous) {
        return Err(MarketError::conflict(
            OP,
            format!("row {} has no ambiguous match to resolve", row.row_index),
        ));
    }

    match resolution {
        Resolution::Product { product_id } => {
            if !row.candidates.contains(&product_id) {
                return Err(MarketError::invalid_input(
                    OP,
                    format!("product {product_id} is not a candidate for row {}", row.row_index),
                ));
            }
            if listing.product_ids.contains(&product_id) {
                row.errors.push(already_in_shop(row.row_index));
            }
            let clash = others
                .iter()
                .filter(|other| other.row_index != row.row_index && other.errors.is_empty())
                .find(|other| other.resolved_product_id == Some(product_id));
            if let Some(first) = clash {
                row.errors.push(duplicate_in_file(row.row_index, first.row_index));
            }
            row.match_kind = Some(MatchKind::Fuzzy);
            row.resolved_product_id = Some(product_id);
        }
        Resolution::CreateNew => {
            row.match_kind = Some(MatchKind::New);
            row.resolved_product_id = None;
            row.confidence = None;
        }
    }
    row.candidates.clear();
    row.is_valid = row.parsed.is_some() && row.errors.is_empty();
    Ok(())
}

fn already_in_shop(index: usize) -> RowError {
    RowError::new(
        index,
        "name",
        RowErrorCode::AlreadyInShop,
        "This product is already listed in your shop; update the existing listing instead",
    )
}

fn duplicate_in_file(index: usize, first: usize) -> RowError {
    RowError::new(
        index,
        "name",
        RowErrorCode::DuplicateInFile,
        format!("Duplicate of row {first}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::matcher::MatcherConfig;
    use crate::bulk::parser::{ParserLimits, parse_sheet};
    use crate::models::{CatalogProduct, CatalogStatus};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn product(id: u128, name: &str, brand: &str) -> CatalogProduct {
        CatalogProduct {
            id: Uuid::from_u128(id),
            name: name.to_string(),
            brand: Some(brand.to_string()),
            category_id: None,
            attributes: BTreeMap::new(),
            match_key: match_key(name, Some(brand)),
            status: CatalogStatus::Approved,
            created_by_batch: None,
            created_at: Utc::now(),
        }
    }

    fn phones() -> Category {
        Category {
            id: Uuid::from_u128(100),
            name: "Phones".into(),
            required_specs: vec!["Storage".into()],
        }
    }

    fn stage(body: &str, listing: &ShopListingKeys) -> Vec<StagedRow> {
        let catalog = vec![
            product(1, "Galaxy A54 128GB", "Samsung"),
            product(2, "iPhone 13 128GB", "Apple"),
            product(3, "iPhone 13 256GB", "Apple"),
        ];
        let matcher = ProductMatcher::new(MatcherConfig::default(), &catalog);
        let categories = vec![phones()];
        let outcome = parse_sheet(body.as_bytes(), "text/csv", &ParserLimits::default())
            .expect("parse");
        let ctx = StagingContext {
            categories: &categories,
            matcher: &matcher,
            listing,
        };
        stage_rows(Uuid::from_u128(7), &outcome, &ctx)
    }

    fn codes(row: &StagedRow) -> Vec<RowErrorCode> {
        row.errors.iter().map(|e| e.code).collect()
    }

    #[test]
    fn rows_are_classified_by_match_outcome() {
        let rows = stage(
            "name,brand,price,stock,category\n\
             Galaxy A54 128GB,Samsung,450,3,phones\n\
             iPhone 13,Apple,600,1,\n\
             Jiko cast iron pot,,30,2,\n\
             ,,abc,1,\n",
            &ShopListingKeys::default(),
        );
        assert_eq!(rows.len(), 4);

        assert!(rows[0].is_valid);
        assert_eq!(rows[0].match_kind, Some(MatchKind::Exact));
        assert_eq!(rows[0].resolved_product_id, Some(Uuid::from_u128(1)));
        assert_eq!(rows[0].category_id, Some(Uuid::from_u128(100)));

        assert!(!rows[1].is_valid);
        assert!(rows[1].is_ambiguous());
        assert_eq!(rows[1].candidates.len(), 2);

        assert!(rows[2].is_valid);
        assert_eq!(rows[2].match_kind, Some(MatchKind::New));
        assert_eq!(rows[2].resolved_product_id, None);

        assert!(!rows[3].is_valid);
        assert!(rows[3].parsed.is_none());
        assert_eq!(rows[3].match_kind, None);
    }

    #[test]
    fn duplicates_in_file_and_shop_are_rejected() {
        let mut listing = ShopListingKeys::default();
        listing.product_ids.insert(Uuid::from_u128(1));
        listing.skus.insert("taken-1".into());
        let rows = stage(
            "name,brand,sku,price,stock\n\
             Galaxy A54 128GB,Samsung,,450,3\n\
             Clay pot,,P-1,10,1\n\
             clay  POT!,,P-2,10,1\n\
             Wooden spoon,,p-1,2,5\n\
             Steel ladle,,TAKEN-1,4,5\n",
            &listing,
        );
        assert_eq!(codes(&rows[0]), vec![RowErrorCode::AlreadyInShop]);
        assert!(rows[1].is_valid);
        assert_eq!(codes(&rows[2]), vec![RowErrorCode::DuplicateInFile]);
        assert_eq!(rows[2].errors[0].message, "Duplicate of row 2");
        assert_eq!(codes(&rows[3]), vec![RowErrorCode::DuplicateSku]);
        assert_eq!(codes(&rows[4]), vec![RowErrorCode::DuplicateSku]);
    }

    #[test]
    fn unknown_category_is_a_row_error() {
        let rows = stage(
            "name,price,stock,category\nClay pot,10,1,Garden\n",
            &ShopListingKeys::default(),
        );
        assert_eq!(codes(&rows[0]), vec![RowErrorCode::UnknownCategory]);
    }

    #[test]
    fn resolving_an_ambiguous_row_makes_it_valid() {
        let rows = stage(
            "name,brand,price,stock\niPhone 13,Apple,600,1\n",
            &ShopListingKeys::default(),
        );
        let mut row = rows[0].clone();
        let err = resolve_row(
            &mut row.clone(),
            Resolution::Product {
                product_id: Uuid::from_u128(1),
            },
            &ShopListingKeys::default(),
            &[],
        )
        .expect_err("not a candidate");
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidInput);

        resolve_row(
            &mut row,
            Resolution::Product {
                product_id: Uuid::from_u128(3),
            },
            &ShopListingKeys::default(),
            &[],
        )
        .expect("resolve");
        assert!(row.is_valid);
        assert_eq!(row.resolved_product_id, Some(Uuid::from_u128(3)));
        assert!(row.candidates.is_empty());

        let again = resolve_row(&mut row, Resolution::CreateNew, &ShopListingKeys::default(), &[]);
        assert!(again.is_err());
    }

    #[test]
    fn create_new_resolution_clears_the_match() {
        let rows = stage(
            "name,brand,price,stock\niPhone 13,Apple,600,1\n",
            &ShopListingKeys::default(),
        );
        let mut row = rows[0].clone();
        resolve_row(&mut row, Resolution::CreateNew, &ShopListingKeys::default(), &[])
            .expect("resolve");
        assert!(row.is_valid);
        assert_eq!(row.match_kind, Some(MatchKind::New));
        assert_eq!(row.resolved_product_id, None);
    }
}
