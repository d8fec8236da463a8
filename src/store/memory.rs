use super::{CommitTransaction, MarketStore, RowPage, ShopListingKeys, StoreError};
use crate::bulk::matcher::match_key;
use crate::models::{
    BatchStatus, CatalogProduct, CatalogStatus, Category, RowFilter, Shop, ShopProduct, StagedRow,
    StockAuditEntry, UploadBatch,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct State {
    shops: HashMap<Uuid, Shop>,
    categories: Vec<Category>,
    catalog: Vec<CatalogProduct>,
    shop_products: Vec<ShopProduct>,
    batches: HashMap<Uuid, UploadBatch>,
    staged: HashMap<Uuid, Vec<StagedRow>>,
    audit: Vec<StockAuditEntry>,
}

impl State {
    fn shop_lists_product(&self, shop_id: Uuid, product_id: Uuid) -> bool {
        self.shop_products
            .iter()
            .any(|p| p.shop_id == shop_id && p.product_id == product_id)
    }

    fn shop_lists_sku(&self, shop_id: Uuid, sku: &str) -> bool {
        self.shop_products
            .iter()
            .any(|p| p.shop_id == shop_id && p.sku.eq_ignore_ascii_case(sku))
    }
}

/// Test hooks for failure paths.
struct Faults {
    /// Fail the shop-product insert that would exceed this many inserts in
    /// one transaction. `usize::MAX` disables the fault.
    shop_inserts_before_failure: AtomicUsize,
    unavailable: AtomicBool,
}

impl Default for Faults {
    fn default() -> Self {
        Self {
            shop_inserts_before_failure: AtomicUsize::new(usize::MAX),
            unavailable: AtomicBool::new(false),
        }
    }
}

/// In-process [`MarketStore`]. Transactions hold the store lock for their
/// whole lifetime, so commits are serialized and readers never observe a
/// half-applied commit.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    faults: Arc<Faults>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_shop(&self, shop: Shop) {
        self.state.lock().await.shops.insert(shop.id, shop);
    }

    pub async fn add_category(&self, category: Category) {
        self.state.lock().await.categories.push(category);
    }

    pub async fn add_catalog_product(&self, product: CatalogProduct) {
        self.state.lock().await.catalog.push(product);
    }

    pub async fn add_shop_product(&self, product: ShopProduct) {
        self.state.lock().await.shop_products.push(product);
    }

    pub async fn shop_products(&self) -> Vec<ShopProduct> {
        self.state.lock().await.shop_products.clone()
    }

    pub async fn catalog(&self) -> Vec<CatalogProduct> {
        self.state.lock().await.catalog.clone()
    }

    pub async fn audit_entries(&self) -> Vec<StockAuditEntry> {
        self.state.lock().await.audit.clone()
    }

    /// The insert after `count` successful shop-product inserts in a
    /// transaction fails with [`StoreError::Fault`].
    pub fn fail_shop_inserts_after(&self, count: usize) {
        self.faults
            .shop_inserts_before_failure
            .store(count, Ordering::SeqCst);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.faults.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store switched off".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MarketStore for MemoryStore {
    async fn shop(&self, id: Uuid) -> Result<Option<Shop>, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().await.shops.get(&id).cloned())
    }

    async fn categories(&self) -> Result<Vec<Category>, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().await.categories.clone())
    }

    async fn catalog_snapshot(&self) -> Result<Vec<CatalogProduct>, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().await.catalog.clone())
    }

    async fn shop_listing_keys(&self, shop_id: Uuid) -> Result<ShopListingKeys, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut keys = ShopListingKeys::default();
        for product in state.shop_products.iter().filter(|p| p.shop_id == shop_id) {
            keys.product_ids.insert(product.product_id);
            keys.skus.insert(product.sku.to_lowercase());
        }
        Ok(keys)
    }

    async fn insert_batch(
        &self,
        batch: UploadBatch,
        rows: Vec<StagedRow>,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if state.batches.contains_key(&batch.id) {
            return Err(StoreError::Conflict(format!(
                "batch {} already exists",
                batch.id
            )));
        }
        state.staged.insert(batch.id, rows);
        state.batches.insert(batch.id, batch);
        Ok(())
    }

    async fn batch(&self, id: Uuid) -> Result<Option<UploadBatch>, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().await.batches.get(&id).cloned())
    }

    async fn batches_for_shop(&self, shop_id: Uuid) -> Result<Vec<UploadBatch>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut batches: Vec<UploadBatch> = state
            .batches
            .values()
            .filter(|b| b.shop_id == shop_id)
            .cloned()
            .collect();
        batches.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(batches)
    }

    async fn staged_rows(
        &self,
        batch_id: Uuid,
        filter: RowFilter,
        offset: usize,
        limit: usize,
    ) -> Result<RowPage, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let matching: Vec<&StagedRow> = state
            .staged
            .get(&batch_id)
            .map(|rows| rows.iter().filter(|row| filter.accepts(row)).collect())
            .unwrap_or_default();
        let total = matching.len();
        let rows = matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        Ok(RowPage { rows, total })
    }

    async fn replace_staged_row(&self, row: StagedRow) -> Result<UploadBatch, StoreError> {
        self.check_available()?;
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let batch = state
            .batches
            .get_mut(&row.batch_id)
            .ok_or_else(|| StoreError::NotFound(format!("batch {}", row.batch_id)))?;
        if batch.status != BatchStatus::Staging {
            return Err(StoreError::Conflict(format!(
                "batch is {}; rows can only change while STAGING",
                batch.status
            )));
        }
        let rows = state.staged.entry(row.batch_id).or_default();
        let slot = rows
            .iter_mut()
            .find(|existing| existing.row_index == row.row_index)
            .ok_or_else(|| StoreError::NotFound(format!("row {}", row.row_index)))?;
        *slot = row;
        batch.apply_tally(rows);
        Ok(batch.clone())
    }

    async fn transition_batch(
        &self,
        id: Uuid,
        from: BatchStatus,
        to: BatchStatus,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<UploadBatch, StoreError> {
        self.check_available()?;
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let batch = state
            .batches
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("batch {id}")))?;
        if batch.status != from {
            return Err(StoreError::Conflict(format!(
                "batch is {}; expected {from}",
                batch.status
            )));
        }
        batch.status = to;
        if to.is_terminal() {
            batch.completed_at = Some(at);
            state.staged.remove(&id);
        }
        if reason.is_some() {
            batch.failure_reason = reason;
        }
        Ok(batch.clone())
    }

    async fn mark_corrections_downloaded(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<UploadBatch, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let batch = state
            .batches
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("batch {id}")))?;
        batch.corrections_downloaded_at = Some(at);
        Ok(batch.clone())
    }

    async fn shop_products_for_batch(
        &self,
        batch_id: Uuid,
    ) -> Result<Vec<ShopProduct>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .shop_products
            .iter()
            .filter(|p| p.batch_id == Some(batch_id))
            .cloned()
            .collect())
    }

    async fn begin(&self) -> Result<Box<dyn CommitTransaction>, StoreError> {
        self.check_available()?;
        let guard = self.state.clone().lock_owned().await;
        Ok(Box::new(MemoryTransaction {
            guard,
            faults: self.faults.clone(),
            pending: Pending::default(),
        }))
    }
}

#[derive(Default)]
struct Pending {
    catalog: Vec<CatalogProduct>,
    shop_products: Vec<ShopProduct>,
    audit: Vec<StockAuditEntry>,
    batch: Option<UploadBatch>,
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<State>,
    faults: Arc<Faults>,
    pending: Pending,
}

#[async_trait]
impl CommitTransaction for MemoryTransaction {
    async fn lock_batch(&mut self, id: Uuid) -> Result<UploadBatch, StoreError> {
        self.guard
            .batches
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("batch {id}")))
    }

    async fn staged_rows(&mut self, batch_id: Uuid) -> Result<Vec<StagedRow>, StoreError> {
        Ok(self.guard.staged.get(&batch_id).cloned().unwrap_or_default())
    }

    async fn catalog_product(&mut self, id: Uuid) -> Result<Option<CatalogProduct>, StoreError> {
        Ok(self
            .pending
            .catalog
            .iter()
            .chain(self.guard.catalog.iter())
            .find(|p| p.id == id)
            .cloned())
    }

    async fn find_catalog_by_key(
        &mut self,
        match_key: &str,
    ) -> Result<Option<CatalogProduct>, StoreError> {
        Ok(self
            .pending
            .catalog
            .iter()
            .chain(self.guard.catalog.iter())
            .find(|p| p.match_key == match_key)
            .cloned())
    }

    async fn insert_catalog_product(&mut self, product: CatalogProduct) -> Result<(), StoreError> {
        let duplicate = self
            .pending
            .catalog
            .iter()
            .chain(self.guard.catalog.iter())
            .any(|p| p.id == product.id || p.match_key == product.match_key);
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "catalog product `{}` already exists",
                product.name
            )));
        }
        self.pending.catalog.push(product);
        Ok(())
    }

    async fn insert_shop_product(&mut self, product: ShopProduct) -> Result<(), StoreError> {
        let limit = self
            .faults
            .shop_inserts_before_failure
            .load(Ordering::SeqCst);
        if self.pending.shop_products.len() >= limit {
            return Err(StoreError::Fault(format!(
                "injected failure inserting sku `{}`",
                product.sku
            )));
        }
        let pending_product = self
            .pending
            .shop_products
            .iter()
            .any(|p| p.shop_id == product.shop_id && p.product_id == product.product_id);
        if pending_product || self.guard.shop_lists_product(product.shop_id, product.product_id) {
            return Err(StoreError::Conflict(format!(
                "shop already lists product {}",
                product.product_id
            )));
        }
        let pending_sku = self
            .pending
            .shop_products
            .iter()
            .any(|p| p.shop_id == product.shop_id && p.sku.eq_ignore_ascii_case(&product.sku));
        if pending_sku || self.guard.shop_lists_sku(product.shop_id, &product.sku) {
            return Err(StoreError::Conflict(format!(
                "sku `{}` already exists in shop",
                product.sku
            )));
        }
        self.pending.shop_products.push(product);
        Ok(())
    }

    async fn append_stock_audit(&mut self, entry: StockAuditEntry) -> Result<(), StoreError> {
        self.pending.audit.push(entry);
        Ok(())
    }

    async fn finish_batch(&mut self, batch: UploadBatch) -> Result<(), StoreError> {
        self.pending.batch = Some(batch);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction {
            mut guard, pending, ..
        } = *self;
        guard.catalog.extend(pending.catalog);
        guard.shop_products.extend(pending.shop_products);
        guard.audit.extend(pending.audit);
        if let Some(batch) = pending.batch {
            if batch.status.is_terminal() {
                guard.staged.remove(&batch.id);
            }
            guard.batches.insert(batch.id, batch);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) {}
}

/// Seed data for running the service without a database.
pub const DEMO_SHOP_ID: Uuid = Uuid::from_u128(0x5b0);

struct DemoCategory {
    id: u128,
    name: &'static str,
    required_specs: &'static [&'static str],
}

struct DemoProduct {
    name: &'static str,
    brand: &'static str,
    category: u128,
    attributes: &'static [(&'static str, &'static str)],
}

const DEMO_CATEGORIES: [DemoCategory; 4] = [
    DemoCategory {
        id: 0xc1,
        name: "Phones",
        required_specs: &["storage", "color"],
    },
    DemoCategory {
        id: 0xc2,
        name: "Laptops",
        required_specs: &["ram", "storage"],
    },
    DemoCategory {
        id: 0xc3,
        name: "Audio",
        required_specs: &[],
    },
    DemoCategory {
        id: 0xc4,
        name: "Home Appliances",
        required_specs: &["power"],
    },
];

const DEMO_CATALOG: [DemoProduct; 5] = [
    DemoProduct {
        name: "Galaxy A54",
        brand: "Samsung",
        category: 0xc1,
        attributes: &[("storage", "128GB")],
    },
    DemoProduct {
        name: "Redmi Note 12",
        brand: "Xiaomi",
        category: 0xc1,
        attributes: &[],
    },
    DemoProduct {
        name: "IdeaPad 3",
        brand: "Lenovo",
        category: 0xc2,
        attributes: &[("ram", "8GB")],
    },
    DemoProduct {
        name: "Tune 510BT",
        brand: "JBL",
        category: 0xc3,
        attributes: &[],
    },
    DemoProduct {
        name: "Blender BL-200",
        brand: "Ramtons",
        category: 0xc4,
        attributes: &[("power", "400W")],
    },
];

impl MemoryStore {
    /// A store holding one shop owned by `owner_id` plus a small approved
    /// catalog to match uploads against.
    pub async fn demo(owner_id: Uuid) -> Self {
        let store = Self::new();
        store
            .add_shop(Shop {
                id: DEMO_SHOP_ID,
                owner_id,
                name: "Demo Electronics".to_string(),
            })
            .await;
        for category in &DEMO_CATEGORIES {
            store
                .add_category(Category {
                    id: Uuid::from_u128(category.id),
                    name: category.name.to_string(),
                    required_specs: category
                        .required_specs
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                })
                .await;
        }
        let now = Utc::now();
        for product in &DEMO_CATALOG {
            store
                .add_catalog_product(CatalogProduct {
                    id: Uuid::new_v4(),
                    name: product.name.to_string(),
                    brand: Some(product.brand.to_string()),
                    category_id: Some(Uuid::from_u128(product.category)),
                    attributes: product
                        .attributes
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                    match_key: match_key(product.name, Some(product.brand)),
                    status: CatalogStatus::Approved,
                    created_by_batch: None,
                    created_at: now,
                })
                .await;
        }
        store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Condition, ListingStatus};
    use rust_decimal::Decimal;
    use std::collections::BTreeMap;

    fn catalog_product(name: &str) -> CatalogProduct {
        CatalogProduct {
            id: Uuid::new_v4(),
            name: name.to_string(),
            brand: None,
            category_id: None,
            attributes: BTreeMap::new(),
            match_key: name.to_lowercase(),
            status: CatalogStatus::Approved,
            created_by_batch: None,
            created_at: Utc::now(),
        }
    }

    fn listing(shop_id: Uuid, product_id: Uuid, sku: &str) -> ShopProduct {
        ShopProduct {
            id: Uuid::new_v4(),
            shop_id,
            product_id,
            sku: sku.to_string(),
            price: Decimal::new(1000, 2),
            stock: 1,
            condition: Condition::New,
            images: Vec::new(),
            specs: BTreeMap::new(),
            listing_status: ListingStatus::NeedsImages,
            is_available: true,
            batch_id: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn rolled_back_writes_are_never_visible() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let product = catalog_product("Widget");
        tx.insert_catalog_product(product.clone()).await.unwrap();
        tx.insert_shop_product(listing(Uuid::new_v4(), product.id, "W-1"))
            .await
            .unwrap();
        tx.rollback().await;
        assert!(store.catalog().await.is_empty());
        assert!(store.shop_products().await.is_empty());
    }

    #[tokio::test]
    async fn committed_writes_land_together() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let product = catalog_product("Widget");
        tx.insert_catalog_product(product.clone()).await.unwrap();
        tx.insert_shop_product(listing(Uuid::new_v4(), product.id, "W-1"))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.catalog().await.len(), 1);
        assert_eq!(store.shop_products().await.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_listing_and_sku_conflict() {
        let store = MemoryStore::new();
        let shop_id = Uuid::new_v4();
        let product_id = Uuid::new_v4();
        store.add_shop_product(listing(shop_id, product_id, "SKU-1")).await;

        let mut tx = store.begin().await.unwrap();
        let same_product = tx
            .insert_shop_product(listing(shop_id, product_id, "SKU-2"))
            .await;
        assert!(matches!(same_product, Err(StoreError::Conflict(_))));
        let same_sku = tx
            .insert_shop_product(listing(shop_id, Uuid::new_v4(), "sku-1"))
            .await;
        assert!(matches!(same_sku, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn injected_fault_trips_after_count() {
        let store = MemoryStore::new();
        store.fail_shop_inserts_after(1);
        let shop_id = Uuid::new_v4();
        let mut tx = store.begin().await.unwrap();
        tx.insert_shop_product(listing(shop_id, Uuid::new_v4(), "A"))
            .await
            .unwrap();
        let second = tx
            .insert_shop_product(listing(shop_id, Uuid::new_v4(), "B"))
            .await;
        assert!(matches!(second, Err(StoreError::Fault(_))));
    }

    #[tokio::test]
    async fn demo_seed_is_matchable() {
        let owner = Uuid::from_u128(7);
        let store = MemoryStore::demo(owner).await;
        let shop = store.shop(DEMO_SHOP_ID).await.unwrap().expect("demo shop");
        assert_eq!(shop.owner_id, owner);
        assert!(store.categories().await.unwrap().iter().any(|c| c.name == "Phones"));
        let catalog = store.catalog_snapshot().await.unwrap();
        assert!(catalog.iter().any(|p| p.match_key == "samsung galaxy a54"));
    }

    #[tokio::test]
    async fn switched_off_store_reports_unavailable() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(store.categories().await, Err(StoreError::Unavailable(_))));
        store.set_unavailable(false);
        assert!(store.categories().await.is_ok());
    }
}
