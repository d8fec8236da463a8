//! Promotes a staged batch into live shop inventory inside one store
//! transaction.

use super::matcher::match_key;
use crate::error::MarketError;
use crate::models::{
    BatchStatus, CatalogProduct, CatalogStatus, Category, CommitSummary, ListingStatus,
    ShopProduct, StagedRow, StockAuditEntry, UploadBatch,
};
use crate::store::{CommitTransaction, MarketStore, StoreError};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{error, warn};
use uuid::Uuid;

const OP: &str = "commit";

pub const STOCK_AUDIT_REASON: &str = "bulk_upload";

pub struct CommitRequest<'a> {
    pub batch_id: Uuid,
    pub actor_id: Uuid,
    pub categories: &'a [Category],
    pub now: DateTime<Utc>,
}

enum Abort {
    /// The batch was not committable; nothing changes.
    Refused(MarketError),
    /// Something broke mid-commit; the batch is marked FAILED.
    Failed(String),
}

impl From<StoreError> for Abort {
    fn from(err: StoreError) -> Self {
        Abort::Failed(err.to_string())
    }
}

pub async fn commit_batch(
    store: &dyn MarketStore,
    request: CommitRequest<'_>,
) -> Result<(UploadBatch, CommitSummary), MarketError> {
    let mut tx = store
        .begin()
        .await
        .map_err(|err| MarketError::from_store(OP, err))?;

    let outcome = apply(tx.as_mut(), &request).await;
    let failure = match outcome {
        Ok(done) => match tx.commit().await {
            Ok(()) => return Ok(done),
            Err(err) => err.to_string(),
        },
        Err(Abort::Refused(err)) => {
            tx.rollback().await;
            return Err(err);
        }
        Err(Abort::Failed(reason)) => {
            tx.rollback().await;
            reason
        }
    };

    error!(
        target = "sokoni.upload",
        batch_id = %request.batch_id,
        reason = %failure,
        "commit_rolled_back"
    );
    if let Err(err) = store
        .transition_batch(
            request.batch_id,
            BatchStatus::Staging,
            BatchStatus::Failed,
            Some(failure),
            request.now,
        )
        .await
    {
        warn!(target = "sokoni.upload", batch_id = %request.batch_id, error = %err, "mark_failed_error");
    }
    Err(MarketError::internal(
        OP,
        "commit failed and was rolled back; no rows were committed",
    ))
}

async fn apply(
    tx: &mut dyn CommitTransaction,
    request: &CommitRequest<'_>,
) -> Result<(UploadBatch, CommitSummary), Abort> {
    let mut batch = match tx.lock_batch(request.batch_id).await {
        Ok(batch) => batch,
        Err(StoreError::NotFound(_)) => {
            return Err(Abort::Refused(MarketError::not_found(OP, "batch not found")));
        }
        Err(err) => return Err(err.into()),
    };
    if batch.status != BatchStatus::Staging {
        return Err(Abort::Refused(MarketError::conflict(
            OP,
            format!("batch is {}; only STAGING batches can be committed", batch.status),
        )));
    }

    let rows = tx.staged_rows(batch.id).await?;
    let mut summary = CommitSummary {
        batch_id: batch.id,
        skipped_invalid: rows.iter().filter(|row| !row.is_valid).count(),
        ..CommitSummary::default()
    };

    for row in rows.iter().filter(|row| row.is_valid) {
        let product = catalog_product_for(tx, row, &batch, request, &mut summary).await?;
        let listing = build_listing(row, &product, &batch, request)?;
        match listing.listing_status {
            ListingStatus::NeedsSpecs => summary.needs_specs += 1,
            ListingStatus::NeedsImages => summary.needs_images += 1,
            ListingStatus::PendingReview | ListingStatus::Active => summary.pending_review += 1,
        }
        let audit = StockAuditEntry {
            shop_product_id: listing.id,
            delta: i64::from(listing.stock),
            reason: STOCK_AUDIT_REASON.to_string(),
            actor_id: request.actor_id,
            batch_id: Some(batch.id),
            at: request.now,
        };
        tx.insert_shop_product(listing).await?;
        tx.append_stock_audit(audit).await?;
        summary.committed += 1;
    }

    batch.status = BatchStatus::Committed;
    batch.committed_rows = summary.committed;
    batch.completed_at = Some(request.now);
    tx.finish_batch(batch.clone()).await?;
    Ok((batch, summary))
}

/// Resolves the row's catalog product, creating it when the row is NEW and
/// nobody added an identical product since staging.
async fn catalog_product_for(
    tx: &mut dyn CommitTransaction,
    row: &StagedRow,
    batch: &UploadBatch,
    request: &CommitRequest<'_>,
    summary: &mut CommitSummary,
) -> Result<CatalogProduct, Abort> {
    let parsed = row
        .parsed
        .as_ref()
        .ok_or_else(|| Abort::Failed(format!("row {} is valid but unparsed", row.row_index)))?;

    if let Some(product_id) = row.resolved_product_id {
        return tx.catalog_product(product_id).await?.ok_or_else(|| {
            Abort::Failed(format!(
                "catalog product {product_id} for row {} no longer exists",
                row.row_index
            ))
        });
    }

    let key = match_key(&parsed.name, parsed.brand.as_deref());
    if let Some(existing) = tx.find_catalog_by_key(&key).await? {
        summary.catalog_rematched += 1;
        return Ok(existing);
    }

    let product = CatalogProduct {
        id: Uuid::new_v4(),
        name: parsed.name.clone(),
        brand: parsed.brand.clone(),
        category_id: row.category_id,
        attributes: parsed.specs.clone().unwrap_or_default(),
        match_key: key,
        status: CatalogStatus::PendingReview,
        created_by_batch: Some(batch.id),
        created_at: request.now,
    };
    tx.insert_catalog_product(product.clone()).await?;
    summary.catalog_created += 1;
    Ok(product)
}

fn build_listing(
    row: &StagedRow,
    product: &CatalogProduct,
    batch: &UploadBatch,
    request: &CommitRequest<'_>,
) -> Result<ShopProduct, Abort> {
    let parsed = row
        .parsed
        .as_ref()
        .ok_or_else(|| Abort::Failed(format!("row {} is valid but unparsed", row.row_index)))?;

    let mut specs = product.attributes.clone();
    specs.extend(parsed.specs.clone().unwrap_or_default());
    let images = parsed.images.clone().unwrap_or_default();

    let required: &[String] = row
        .category_id
        .or(product.category_id)
        .and_then(|id| request.categories.iter().find(|c| c.id == id))
        .map(|c| c.required_specs.as_slice())
        .unwrap_or_default();

    let id = Uuid::new_v4();
    let sku = parsed.sku.clone().unwrap_or_else(|| generated_sku(id));
    Ok(ShopProduct {
        id,
        shop_id: batch.shop_id,
        product_id: product.id,
        sku,
        price: parsed.price,
        stock: parsed.stock,
        condition: parsed.condition,
        listing_status: listing_status(required, &specs, &images),
        images,
        specs,
        is_available: parsed.stock > 0,
        batch_id: Some(batch.id),
        created_at: request.now,
    })
}

fn generated_sku(listing_id: Uuid) -> String {
    let simple = listing_id.simple().to_string().to_uppercase();
    format!("BLK-{}", &simple[..12])
}

/// Completeness ladder: required specs first, then images.
pub fn listing_status(
    required_specs: &[String],
    specs: &BTreeMap<String, String>,
    images: &[String],
) -> ListingStatus {
    let has_spec = |key: &String| {
        specs
            .iter()
            .any(|(k, v)| k.eq_ignore_ascii_case(key) && !v.trim().is_empty())
    };
    if !required_specs.iter().all(has_spec) {
        ListingStatus::NeedsSpecs
    } else if images.is_empty() {
        ListingStatus::NeedsImages
    } else {
        ListingStatus::PendingReview
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn missing_required_specs_win_over_missing_images() {
        let required = vec!["Storage".to_string(), "RAM".to_string()];
        assert_eq!(
            listing_status(&required, &specs(&[("storage", "128GB")]), &[]),
            ListingStatus::NeedsSpecs
        );
        assert_eq!(
            listing_status(&required, &specs(&[("Storage", "128GB"), ("ram", "8GB")]), &[]),
            ListingStatus::NeedsImages
        );
        assert_eq!(
            listing_status(
                &required,
                &specs(&[("Storage", "128GB"), ("RAM", "8GB")]),
                &["https://cdn.example.com/a.jpg".to_string()]
            ),
            ListingStatus::PendingReview
        );
    }

    #[test]
    fn blank_spec_values_do_not_count() {
        let required = vec!["Color".to_string()];
        assert_eq!(
            listing_status(&required, &specs(&[("Color", " ")]), &["x".to_string()]),
            ListingStatus::NeedsSpecs
        );
        assert_eq!(
            listing_status(&[], &BTreeMap::new(), &["x".to_string()]),
            ListingStatus::PendingReview
        );
    }

    #[test]
    fn generated_skus_are_prefixed_and_short() {
        let sku = generated_sku(Uuid::from_u128(0xabc));
        assert!(sku.starts_with("BLK-"));
        assert_eq!(sku.len(), 16);
    }
}
