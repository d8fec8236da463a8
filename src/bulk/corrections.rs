//! Corrections file: the rejected rows of a batch written back in the
//! template layout, with the reasons appended, so the seller can fix them
//! in place and upload the file again.

use super::parser::TEMPLATE_COLUMNS;
use crate::error::MarketError;
use crate::models::{RowErrorCode, StagedRow};
use serde::Deserialize;

const OP: &str = "corrections";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    Fr,
}

impl Locale {
    pub fn parse(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "fr" | "fr-fr" | "fr_fr" => Some(Locale::Fr),
            _ => None,
        }
    }
}

const AMBIGUOUS_MESSAGE: &str =
    "Several catalog products match this row; pick one or ask for a new product";

pub fn build_corrections(rows: &[StagedRow], locale: Option<Locale>) -> Result<Vec<u8>, MarketError> {
    let mut rejected: Vec<&StagedRow> = rows.iter().filter(|row| row.needs_correction()).collect();
    rejected.sort_by_key(|row| row.row_index);

    let mut writer = csv::Writer::from_writer(Vec::new());
    let mut header: Vec<&str> = TEMPLATE_COLUMNS.to_vec();
    header.push("error");
    if locale.is_some() {
        header.push("error_translated");
    }
    writer.write_record(&header).map_err(write_error)?;

    for row in rejected {
        let mut record: Vec<String> = row.raw.cells().iter().map(|c| c.to_string()).collect();
        record.push(describe(row));
        if let Some(locale) = locale {
            record.push(translate(row, locale));
        }
        writer.write_record(&record).map_err(write_error)?;
    }

    writer
        .into_inner()
        .map_err(|err| MarketError::internal(OP, err.to_string()))
}

fn write_error(err: csv::Error) -> MarketError {
    MarketError::internal(OP, err.to_string())
}

fn describe(row: &StagedRow) -> String {
    if row.errors.is_empty() {
        return AMBIGUOUS_MESSAGE.to_string();
    }
    row.errors
        .iter()
        .map(|err| format!("{}: {}", err.field, err.message))
        .collect::<Vec<_>>()
        .join("; ")
}

fn translate(row: &StagedRow, locale: Locale) -> String {
    if row.errors.is_empty() {
        return match locale {
            Locale::Fr => "Plusieurs produits du catalogue correspondent ; choisissez-en un".into(),
        };
    }
    row.errors
        .iter()
        .map(|err| match locale {
            Locale::Fr => french(err.code),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

fn french(code: RowErrorCode) -> &'static str {
    match code {
        RowErrorCode::MissingName => "Le nom du produit est obligatoire",
        RowErrorCode::InvalidPrice => "Prix invalide",
        RowErrorCode::InvalidStock => "Quantité en stock invalide",
        RowErrorCode::InvalidCondition => "État du produit invalide",
        RowErrorCode::InvalidSpecs => "Caractéristiques invalides (format Clé: Valeur)",
        RowErrorCode::InvalidImages => "Lien d'image invalide",
        RowErrorCode::TooManyImages => "Trop d'images",
        RowErrorCode::UnknownCategory => "Catégorie inconnue",
        RowErrorCode::DuplicateInFile => "Ligne en double dans le fichier",
        RowErrorCode::DuplicateSku => "SKU déjà utilisé",
        RowErrorCode::AlreadyInShop => "Produit déjà présent dans la boutique",
    }
}
