//! Persistence seam for the upload pipeline.
//!
//! The relational store is an external collaborator. The core only needs
//! the typed reads/writes below plus an all-or-nothing transaction for the
//! commit step; [`memory::MemoryStore`] is the in-process implementation.

pub mod memory;

use crate::models::{
    BatchStatus, CatalogProduct, Category, RowFilter, Shop, ShopProduct, StagedRow,
    StockAuditEntry, UploadBatch,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    Conflict(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("write failed: {0}")]
    Fault(String),
}

/// Product ids and SKUs a shop already lists.
#[derive(Debug, Clone, Default)]
pub struct ShopListingKeys {
    pub product_ids: HashSet<Uuid>,
    /// Lower-cased.
    pub skus: HashSet<String>,
}

#[derive(Debug, Clone)]
pub struct RowPage {
    pub rows: Vec<StagedRow>,
    /// Rows matching the filter across all pages.
    pub total: usize,
}

#[async_trait]
pub trait MarketStore: Send + Sync {
    async fn shop(&self, id: Uuid) -> Result<Option<Shop>, StoreError>;
    async fn categories(&self) -> Result<Vec<Category>, StoreError>;
    async fn catalog_snapshot(&self) -> Result<Vec<CatalogProduct>, StoreError>;
    async fn shop_listing_keys(&self, shop_id: Uuid) -> Result<ShopListingKeys, StoreError>;

    async fn insert_batch(&self, batch: UploadBatch, rows: Vec<StagedRow>)
    -> Result<(), StoreError>;
    async fn batch(&self, id: Uuid) -> Result<Option<UploadBatch>, StoreError>;
    async fn batches_for_shop(&self, shop_id: Uuid) -> Result<Vec<UploadBatch>, StoreError>;
    async fn staged_rows(
        &self,
        batch_id: Uuid,
        filter: RowFilter,
        offset: usize,
        limit: usize,
    ) -> Result<RowPage, StoreError>;

    /// Replaces one staged row and recomputes the batch's row counts. Fails
    /// with a conflict unless the batch is still STAGING.
    async fn replace_staged_row(&self, row: StagedRow) -> Result<UploadBatch, StoreError>;

    /// Compare-and-set on the batch status. Moving into a terminal status
    /// purges the batch's staged rows.
    async fn transition_batch(
        &self,
        id: Uuid,
        from: BatchStatus,
        to: BatchStatus,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<UploadBatch, StoreError>;

    async fn mark_corrections_downloaded(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<UploadBatch, StoreError>;

    async fn shop_products_for_batch(&self, batch_id: Uuid)
    -> Result<Vec<ShopProduct>, StoreError>;

    async fn begin(&self) -> Result<Box<dyn CommitTransaction>, StoreError>;
}

/// One all-or-nothing unit of work. Nothing written through it is visible
/// to other readers until [`CommitTransaction::commit`] succeeds; dropping or
/// rolling back discards every write.
#[async_trait]
pub trait CommitTransaction: Send {
    /// Reads the batch and holds it for the rest of the transaction.
    async fn lock_batch(&mut self, id: Uuid) -> Result<UploadBatch, StoreError>;
    async fn staged_rows(&mut self, batch_id: Uuid) -> Result<Vec<StagedRow>, StoreError>;
    async fn catalog_product(&mut self, id: Uuid) -> Result<Option<CatalogProduct>, StoreError>;
    async fn find_catalog_by_key(
        &mut self,
        match_key: &str,
    ) -> Result<Option<CatalogProduct>, StoreError>;
    async fn insert_catalog_product(&mut self, product: CatalogProduct) -> Result<(), StoreError>;
    /// Conflict when the shop already lists the product or the SKU.
    async fn insert_shop_product(&mut self, product: ShopProduct) -> Result<(), StoreError>;
    async fn append_stock_audit(&mut self, entry: StockAuditEntry) -> Result<(), StoreError>;
    /// Writes the final batch record and purges its staged rows.
    async fn finish_batch(&mut self, batch: UploadBatch) -> Result<(), StoreError>;
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
    async fn rollback(self: Box<Self>);
}
