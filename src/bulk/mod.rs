//! Bulk inventory uploads: parse a seller's spreadsheet, stage and match
//! every row, then commit the valid rows into the shop or cancel the batch.

pub mod commit;
pub mod corrections;
pub mod matcher;
pub mod parser;
pub mod staging;

use crate::clock::Clock;
use crate::error::MarketError;
use crate::models::{
    BatchStatus, CommitSummary, RowError, RowFilter, Shop, ShopProduct, StageReport, StagedRow,
    UploadBatch,
};
use crate::notify::{UploadNotifier, UploadSummary, dispatch};
use crate::security::Principal;
use crate::store::MarketStore;
use commit::{CommitRequest, commit_batch};
use corrections::{Locale, build_corrections};
use matcher::{MatcherConfig, ProductMatcher};
use parser::{ParserLimits, parse_sheet};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use staging::{Resolution, StagingContext, resolve_row, stage_rows};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

pub const MAX_PER_PAGE: usize = 100;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BulkConfig {
    pub limits: ParserLimits,
    pub matcher: MatcherConfig,
}

#[derive(Debug, Serialize)]
pub struct UploadReport {
    pub batch: UploadBatch,
    pub errors: Vec<RowError>,
    pub stages: Vec<StageReport>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct PreviewQuery {
    pub page: usize,
    pub per_page: usize,
    pub filter: RowFilter,
}

impl Default for PreviewQuery {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 20,
            filter: RowFilter::All,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PreviewPage {
    pub batch: UploadBatch,
    pub rows: Vec<StagedRow>,
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
    pub total_pages: usize,
}

#[derive(Debug, Serialize)]
pub struct CommitReport {
    pub batch: UploadBatch,
    pub summary: CommitSummary,
}

#[derive(Debug, Serialize)]
pub struct ResolvedRow {
    pub batch: UploadBatch,
    pub row: StagedRow,
}

#[derive(Debug)]
pub struct CorrectionsFile {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}

#[derive(Clone)]
pub struct BulkUploads {
    store: Arc<dyn MarketStore>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn UploadNotifier>,
    config: BulkConfig,
    /// Held from the clash check to the row write, so each resolution sees
    /// every earlier one.
    resolving: Arc<Mutex<()>>,
}

impl BulkUploads {
    pub fn new(
        store: Arc<dyn MarketStore>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn UploadNotifier>,
        config: BulkConfig,
    ) -> Self {
        Self {
            store,
            clock,
            notifier,
            config,
            resolving: Arc::new(Mutex::new(())),
        }
    }

    pub fn config(&self) -> &BulkConfig {
        &self.config
    }

    pub async fn upload(
        &self,
        principal: &Principal,
        shop_id: Uuid,
        file_name: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<UploadReport, MarketError> {
        const OP: &str = "upload";
        let shop = self.authorize_shop(principal, shop_id).await?;
        let mut stages = Vec::new();

        let outcome = capture_stage("parse", &mut stages, async {
            let outcome = parse_sheet(bytes, content_type, &self.config.limits)?;
            let output = json!({
                "records": outcome.records.len(),
                "parsed": outcome.rows.len(),
                "errors": outcome.errors.len(),
            });
            Ok(StageOutcome::new(outcome, output))
        })
        .await?;

        let matcher = capture_stage("match", &mut stages, async {
            let catalog = self
                .store
                .catalog_snapshot()
                .await
                .map_err(|err| MarketError::from_store(OP, err))?;
            let output = json!({ "catalog_size": catalog.len() });
            Ok(StageOutcome::new(
                ProductMatcher::new(self.config.matcher, &catalog),
                output,
            ))
        })
        .await?;

        let batch_id = Uuid::new_v4();
        let rows = capture_stage("stage", &mut stages, async {
            let categories = self
                .store
                .categories()
                .await
                .map_err(|err| MarketError::from_store(OP, err))?;
            let listing = self
                .store
                .shop_listing_keys(shop.id)
                .await
                .map_err(|err| MarketError::from_store(OP, err))?;
            let ctx = StagingContext {
                categories: &categories,
                matcher: &matcher,
                listing: &listing,
            };
            let rows = stage_rows(batch_id, &outcome, &ctx);
            let output = json!({
                "valid": rows.iter().filter(|r| r.is_valid).count(),
                "invalid": rows.iter().filter(|r| !r.errors.is_empty()).count(),
                "ambiguous": rows.iter().filter(|r| r.is_ambiguous()).count(),
            });
            Ok(StageOutcome::new(rows, output))
        })
        .await?;

        let mut batch = UploadBatch {
            id: batch_id,
            shop_id: shop.id,
            file_name: file_name.to_string(),
            total_rows: 0,
            valid_rows: 0,
            invalid_rows: 0,
            skipped_rows: 0,
            committed_rows: 0,
            status: BatchStatus::Staging,
            created_at: self.clock.now(),
            completed_at: None,
            corrections_downloaded_at: None,
            failure_reason: None,
        };
        batch.apply_tally(&rows);
        let errors: Vec<RowError> = rows.iter().flat_map(|r| r.errors.iter().cloned()).collect();

        capture_stage("persist", &mut stages, async {
            self.store
                .insert_batch(batch.clone(), rows)
                .await
                .map_err(|err| MarketError::from_store(OP, err))?;
            Ok(StageOutcome::new((), json!({ "batch_id": batch.id })))
        })
        .await?;

        info!(
            target = "sokoni.upload",
            batch_id = %batch.id,
            shop_id = %shop.id,
            total = batch.total_rows,
            valid = batch.valid_rows,
            invalid = batch.invalid_rows,
            skipped = batch.skipped_rows,
            "batch_staged"
        );
        dispatch(
            self.notifier.clone(),
            UploadSummary {
                batch_id: batch.id,
                shop_id: shop.id,
                total_rows: batch.total_rows,
                successful: batch.valid_rows,
                skipped: batch.skipped_rows,
                failed: batch.invalid_rows,
            },
        );

        Ok(UploadReport {
            batch,
            errors,
            stages,
        })
    }

    pub async fn preview(
        &self,
        principal: &Principal,
        batch_id: Uuid,
        query: PreviewQuery,
    ) -> Result<PreviewPage, MarketError> {
        const OP: &str = "preview";
        if query.page == 0 {
            return Err(MarketError::invalid_input(OP, "page starts at 1"));
        }
        if !(1..=MAX_PER_PAGE).contains(&query.per_page) {
            return Err(MarketError::invalid_input(
                OP,
                format!("per_page must be between 1 and {MAX_PER_PAGE}"),
            ));
        }
        let batch = self.authorize_batch(principal, batch_id).await?;
        let page = self
            .store
            .staged_rows(
                batch.id,
                query.filter,
                (query.page - 1).saturating_mul(query.per_page),
                query.per_page,
            )
            .await
            .map_err(|err| MarketError::from_store(OP, err))?;
        Ok(PreviewPage {
            batch,
            rows: page.rows,
            page: query.page,
            per_page: query.per_page,
            total: page.total,
            total_pages: page.total.div_ceil(query.per_page),
        })
    }

    pub async fn resolve(
        &self,
        principal: &Principal,
        batch_id: Uuid,
        row_index: usize,
        resolution: Resolution,
    ) -> Result<ResolvedRow, MarketError> {
        const OP: &str = "resolve_row";
        let batch = self.authorize_batch(principal, batch_id).await?;
        let _resolving = self.resolving.lock().await;
        if batch.status != BatchStatus::Staging {
            return Err(MarketError::conflict(
                OP,
                format!("batch is {}; rows can only change while STAGING", batch.status),
            ));
        }
        let rows = self
            .store
            .staged_rows(batch.id, RowFilter::All, 0, usize::MAX)
            .await
            .map_err(|err| MarketError::from_store(OP, err))?
            .rows;
        let mut row = rows
            .iter()
            .find(|r| r.row_index == row_index)
            .cloned()
            .ok_or_else(|| MarketError::not_found(OP, format!("row {row_index} not found")))?;
        let listing = self
            .store
            .shop_listing_keys(batch.shop_id)
            .await
            .map_err(|err| MarketError::from_store(OP, err))?;
        resolve_row(&mut row, resolution, &listing, &rows)?;
        let batch = self
            .store
            .replace_staged_row(row.clone())
            .await
            .map_err(|err| MarketError::from_store(OP, err))?;
        info!(
            target = "sokoni.upload",
            batch_id = %batch.id,
            row_index,
            valid = row.is_valid,
            "row_resolved"
        );
        Ok(ResolvedRow { batch, row })
    }

    pub async fn commit(
        &self,
        principal: &Principal,
        batch_id: Uuid,
    ) -> Result<CommitReport, MarketError> {
        let batch = self.authorize_batch(principal, batch_id).await?;
        let categories = self
            .store
            .categories()
            .await
            .map_err(|err| MarketError::from_store("commit", err))?;
        let started = Instant::now();
        let (batch, summary) = commit_batch(
            self.store.as_ref(),
            CommitRequest {
                batch_id: batch.id,
                actor_id: principal.user_id,
                categories: &categories,
                now: self.clock.now(),
            },
        )
        .await?;
        crate::metrics::stage_elapsed("commit", started.elapsed().as_millis());
        info!(
            target = "sokoni.upload",
            batch_id = %batch.id,
            committed = summary.committed,
            skipped_invalid = summary.skipped_invalid,
            catalog_created = summary.catalog_created,
            catalog_rematched = summary.catalog_rematched,
            "batch_committed"
        );
        Ok(CommitReport { batch, summary })
    }

    /// Shop listings a committed batch created.
    pub async fn listings(
        &self,
        principal: &Principal,
        batch_id: Uuid,
    ) -> Result<Vec<ShopProduct>, MarketError> {
        let batch = self.authorize_batch(principal, batch_id).await?;
        self.store
            .shop_products_for_batch(batch.id)
            .await
            .map_err(|err| MarketError::from_store("listings", err))
    }

    pub async fn cancel(
        &self,
        principal: &Principal,
        batch_id: Uuid,
    ) -> Result<UploadBatch, MarketError> {
        let batch = self.authorize_batch(principal, batch_id).await?;
        let batch = self
            .store
            .transition_batch(
                batch.id,
                BatchStatus::Staging,
                BatchStatus::Cancelled,
                None,
                self.clock.now(),
            )
            .await
            .map_err(|err| MarketError::from_store("cancel", err))?;
        info!(target = "sokoni.upload", batch_id = %batch.id, "batch_cancelled");
        Ok(batch)
    }

    pub async fn corrections(
        &self,
        principal: &Principal,
        batch_id: Uuid,
        locale: Option<Locale>,
    ) -> Result<CorrectionsFile, MarketError> {
        const OP: &str = "corrections";
        let batch = self.authorize_batch(principal, batch_id).await?;
        if batch.status.is_terminal() {
            return Err(MarketError::conflict(
                OP,
                format!("batch is {}; its rows are no longer kept", batch.status),
            ));
        }
        let rows = self
            .store
            .staged_rows(batch.id, RowFilter::Invalid, 0, usize::MAX)
            .await
            .map_err(|err| MarketError::from_store(OP, err))?
            .rows;
        let bytes = build_corrections(&rows, locale)?;
        self.store
            .mark_corrections_downloaded(batch.id, self.clock.now())
            .await
            .map_err(|err| MarketError::from_store(OP, err))?;
        Ok(CorrectionsFile {
            file_name: corrections_file_name(&batch.file_name),
            bytes,
        })
    }

    pub async fn batch(
        &self,
        principal: &Principal,
        batch_id: Uuid,
    ) -> Result<UploadBatch, MarketError> {
        self.authorize_batch(principal, batch_id).await
    }

    pub async fn list_batches(
        &self,
        principal: &Principal,
        shop_id: Uuid,
    ) -> Result<Vec<UploadBatch>, MarketError> {
        let shop = self.authorize_shop(principal, shop_id).await?;
        self.store
            .batches_for_shop(shop.id)
            .await
            .map_err(|err| MarketError::from_store("list_batches", err))
    }

    async fn authorize_shop(
        &self,
        principal: &Principal,
        shop_id: Uuid,
    ) -> Result<Shop, MarketError> {
        const OP: &str = "authorize";
        if !principal.role.can_sell() {
            return Err(MarketError::forbidden(OP, "seller role required"));
        }
        let shop = self
            .store
            .shop(shop_id)
            .await
            .map_err(|err| MarketError::from_store(OP, err))?
            .ok_or_else(|| MarketError::not_found(OP, "shop not found"))?;
        if !principal.role.is_admin() && shop.owner_id != principal.user_id {
            return Err(MarketError::forbidden(OP, "you do not own this shop"));
        }
        Ok(shop)
    }

    /// Another seller's batch is reported exactly like a missing one.
    async fn authorize_batch(
        &self,
        principal: &Principal,
        batch_id: Uuid,
    ) -> Result<UploadBatch, MarketError> {
        const OP: &str = "authorize";
        if !principal.role.can_sell() {
            return Err(MarketError::forbidden(OP, "seller role required"));
        }
        let batch = self
            .store
            .batch(batch_id)
            .await
            .map_err(|err| MarketError::from_store(OP, err))?
            .ok_or_else(|| MarketError::not_found(OP, "batch not found"))?;
        if principal.role.is_admin() {
            return Ok(batch);
        }
        let owned = self
            .store
            .shop(batch.shop_id)
            .await
            .map_err(|err| MarketError::from_store(OP, err))?
            .is_some_and(|shop| shop.owner_id == principal.user_id);
        if owned {
            Ok(batch)
        } else {
            Err(MarketError::not_found(OP, "batch not found"))
        }
    }
}

async fn capture_stage<T, Fut>(
    name: &'static str,
    stages: &mut Vec<StageReport>,
    fut: Fut,
) -> Result<T, MarketError>
where
    Fut: Future<Output = Result<StageOutcome<T>, MarketError>>,
{
    let started = Instant::now();
    let outcome = fut.await?;
    let elapsed_ms = started.elapsed().as_millis();
    crate::metrics::stage_elapsed(name, elapsed_ms);
    stages.push(StageReport::new(name, elapsed_ms, outcome.output));
    Ok(outcome.value)
}

fn corrections_file_name(original: &str) -> String {
    let stem = original
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .filter(|stem| !stem.is_empty())
        .unwrap_or(original);
    let stem = if stem.trim().is_empty() { "upload" } else { stem };
    format!("{stem}-corrections.csv")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ErrorKind;
    use crate::models::{
        CatalogProduct, CatalogStatus, Category, Condition, ListingStatus, MatchKind,
        ShopProduct,
    };
    use crate::notify::NotifyError;
    use crate::security::Role;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const OWNER: u128 = 0x01;
    const SHOP: u128 = 0x10;
    const PHONES: u128 = 0x20;

    struct Recording(mpsc::UnboundedSender<UploadSummary>);

    #[async_trait]
    impl UploadNotifier for Recording {
        async fn upload_processed(&self, summary: &UploadSummary) -> Result<(), NotifyError> {
            let _ = self.0.send(summary.clone());
            Ok(())
        }
    }

    struct Fixture {
        store: MemoryStore,
        service: BulkUploads,
        notices: mpsc::UnboundedReceiver<UploadSummary>,
    }

    fn seller() -> Principal {
        Principal {
            user_id: Uuid::from_u128(OWNER),
            role: Role::Seller,
        }
    }

    fn catalog_product(id: u128, name: &str, brand: &str) -> CatalogProduct {
        CatalogProduct {
            id: Uuid::from_u128(id),
            name: name.into(),
            brand: Some(brand.into()),
            category_id: Some(Uuid::from_u128(PHONES)),
            attributes: BTreeMap::from([("Storage".to_string(), "128GB".to_string())]),
            match_key: matcher::match_key(name, Some(brand)),
            status: CatalogStatus::Approved,
            created_by_batch: None,
            created_at: chrono::Utc::now(),
        }
    }

    async fn fixture() -> Fixture {
        let store = MemoryStore::new();
        store
            .add_shop(Shop {
                id: Uuid::from_u128(SHOP),
                owner_id: Uuid::from_u128(OWNER),
                name: "Duka".into(),
            })
            .await;
        store
            .add_category(Category {
                id: Uuid::from_u128(PHONES),
                name: "Phones".into(),
                required_specs: vec!["Storage".into()],
            })
            .await;
        store
            .add_catalog_product(catalog_product(1, "Galaxy A54 128GB", "Samsung"))
            .await;
        store
            .add_catalog_product(catalog_product(2, "iPhone 13 128GB", "Apple"))
            .await;
        store
            .add_catalog_product(catalog_product(3, "iPhone 13 256GB", "Apple"))
            .await;

        let (tx, notices) = mpsc::unbounded_channel();
        let service = BulkUploads::new(
            Arc::new(store.clone()),
            Arc::new(ManualClock::default()),
            Arc::new(Recording(tx)),
            BulkConfig::default(),
        );
        Fixture {
            store,
            service,
            notices,
        }
    }

    const THREE_ROWS: &str = "name,brand,price,stock,images\n\
        Galaxy A54 128GB,Samsung,450,3,https://cdn.example.com/a54.jpg\n\
        iPhone 13,Apple,600,1,\n\
        ,,10,1,\n";

    /// Listings traceable to the batch, read through the service.
    async fn traced_listings(f: &Fixture, batch_id: Uuid) -> usize {
        f.service
            .listings(&seller(), batch_id)
            .await
            .expect("listings")
            .len()
    }

    async fn upload(f: &Fixture, body: &str) -> UploadReport {
        f.service
            .upload(&seller(), Uuid::from_u128(SHOP), "stock.csv", "text/csv", body.as_bytes())
            .await
            .expect("upload")
    }

    #[tokio::test]
    async fn three_row_upload_stages_commits_and_purges() {
        let mut f = fixture().await;
        let report = upload(&f, THREE_ROWS).await;
        let batch = &report.batch;
        assert_eq!(batch.status, BatchStatus::Staging);
        assert_eq!(
            (batch.total_rows, batch.valid_rows, batch.invalid_rows, batch.skipped_rows),
            (3, 1, 1, 1)
        );
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].row_index, 3);
        let stage_names: Vec<&str> = report.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(stage_names, vec!["parse", "match", "stage", "persist"]);

        let notice = tokio::time::timeout(Duration::from_secs(1), f.notices.recv())
            .await
            .expect("notified")
            .expect("summary");
        assert_eq!((notice.successful, notice.skipped, notice.failed), (1, 1, 1));

        let committed = f.service.commit(&seller(), batch.id).await.expect("commit");
        assert_eq!(committed.batch.status, BatchStatus::Committed);
        assert_eq!(committed.summary.committed, 1);
        assert_eq!(committed.summary.skipped_invalid, 2);
        assert_eq!(committed.summary.pending_review, 1);

        let listings = f.store.shop_products().await;
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].product_id, Uuid::from_u128(1));
        assert_eq!(traced_listings(&f, batch.id).await, committed.batch.committed_rows);
        assert_eq!(listings[0].listing_status, ListingStatus::PendingReview);
        assert_eq!(f.store.audit_entries().await.len(), 1);

        let page = f
            .service
            .preview(&seller(), batch.id, PreviewQuery::default())
            .await
            .expect("preview");
        assert!(page.rows.is_empty());
    }

    #[tokio::test]
    async fn counts_always_add_up() {
        let f = fixture().await;
        let body = "name,brand,sku,price,stock,category\n\
            Galaxy A54 128GB,Samsung,S1,450,3,Phones\n\
            iPhone 13,Apple,S2,600,1,\n\
            Clay pot,,S1,10,1,\n\
            Clay pot,,S3,10,1,\n\
            Kettle,,,0,1,\n\
            Spoon,,,1,1,Garden\n";
        let batch = upload(&f, body).await.batch;
        assert_eq!(batch.total_rows, 6);
        assert_eq!(
            batch.valid_rows + batch.invalid_rows + batch.skipped_rows,
            batch.total_rows
        );
    }

    #[tokio::test]
    async fn preview_pages_and_filters() {
        let f = fixture().await;
        let batch = upload(&f, THREE_ROWS).await.batch;
        let invalid = f
            .service
            .preview(
                &seller(),
                batch.id,
                PreviewQuery {
                    page: 1,
                    per_page: 1,
                    filter: RowFilter::Invalid,
                },
            )
            .await
            .expect("preview");
        assert_eq!(invalid.total, 2);
        assert_eq!(invalid.total_pages, 2);
        assert_eq!(invalid.rows[0].row_index, 2);

        let bad = f
            .service
            .preview(
                &seller(),
                batch.id,
                PreviewQuery {
                    per_page: 101,
                    ..PreviewQuery::default()
                },
            )
            .await
            .expect_err("per_page too large");
        assert_eq!(bad.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn cancelling_twice_conflicts() {
        let f = fixture().await;
        let batch = upload(&f, THREE_ROWS).await.batch;
        let cancelled = f.service.cancel(&seller(), batch.id).await.expect("cancel");
        assert_eq!(cancelled.status, BatchStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());
        let err = f.service.cancel(&seller(), batch.id).await.expect_err("second cancel");
        assert_eq!(err.kind(), ErrorKind::Conflict);
        let err = f.service.commit(&seller(), batch.id).await.expect_err("commit after cancel");
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(f.store.shop_products().await.is_empty());
    }

    #[tokio::test]
    async fn failed_commit_leaves_nothing_behind() {
        let f = fixture().await;
        let body = "name,price,stock\nClay pot,10,1\nKettle,12,2\nLadle,3,4\n";
        let batch = upload(&f, body).await.batch;
        f.store.fail_shop_inserts_after(2);

        let err = f.service.commit(&seller(), batch.id).await.expect_err("fault");
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.detail().contains("no rows were committed"));
        assert!(f.store.shop_products().await.is_empty());
        assert_eq!(traced_listings(&f, batch.id).await, 0);
        assert!(f.store.audit_entries().await.is_empty());
        assert_eq!(f.store.catalog().await.len(), 3);

        let failed = f.service.batch(&seller(), batch.id).await.expect("batch");
        assert_eq!(failed.status, BatchStatus::Failed);
        assert!(failed.failure_reason.is_some());
    }

    #[tokio::test]
    async fn product_created_since_staging_is_reused() {
        let f = fixture().await;
        let batch = upload(&f, "name,brand,price,stock\nJiko Stove,Jiko,40,2\n").await.batch;
        let mut late = catalog_product(9, "Jiko Stove", "Jiko");
        late.category_id = None;
        f.store.add_catalog_product(late).await;

        let report = f.service.commit(&seller(), batch.id).await.expect("commit");
        assert_eq!(report.summary.catalog_rematched, 1);
        assert_eq!(report.summary.catalog_created, 0);
        let listings = f.store.shop_products().await;
        assert_eq!(listings[0].product_id, Uuid::from_u128(9));
        assert_eq!(traced_listings(&f, batch.id).await, report.batch.committed_rows);
        assert_eq!(report.batch.committed_rows, 1);
    }

    #[tokio::test]
    async fn new_products_enter_review_and_ladder_listing_status() {
        let f = fixture().await;
        let body = "name,price,stock,category,specs,images\n\
            Tecno Camon 20,200,5,Phones,,https://cdn.example.com/c.jpg\n\
            Tecno Spark 10,150,5,Phones,Storage: 64GB,\n";
        let batch = upload(&f, body).await.batch;
        let report = f.service.commit(&seller(), batch.id).await.expect("commit");
        assert_eq!(report.summary.catalog_created, 2);
        assert_eq!(report.summary.needs_specs, 1);
        assert_eq!(report.summary.needs_images, 1);
        let created: Vec<CatalogProduct> = f
            .store
            .catalog()
            .await
            .into_iter()
            .filter(|p| p.created_by_batch == Some(batch.id))
            .collect();
        assert!(created.iter().all(|p| p.status == CatalogStatus::PendingReview));
    }

    #[tokio::test]
    async fn resolving_ambiguity_then_committing() {
        let f = fixture().await;
        let batch = upload(&f, THREE_ROWS).await.batch;
        let resolved = f
            .service
            .resolve(
                &seller(),
                batch.id,
                2,
                Resolution::Product {
                    product_id: Uuid::from_u128(3),
                },
            )
            .await
            .expect("resolve");
        assert!(resolved.row.is_valid);
        assert_eq!(resolved.row.match_kind, Some(MatchKind::Fuzzy));
        assert_eq!(resolved.batch.valid_rows, 2);
        assert_eq!(resolved.batch.skipped_rows, 0);

        let report = f.service.commit(&seller(), batch.id).await.expect("commit");
        assert_eq!(report.summary.committed, 2);
        // catalog storage spec satisfies the category, no images uploaded
        assert_eq!(report.summary.needs_images, 1);
    }

    #[tokio::test]
    async fn corrections_cover_invalid_rows_until_the_batch_closes() {
        let f = fixture().await;
        let batch = upload(&f, THREE_ROWS).await.batch;
        let file = f
            .service
            .corrections(&seller(), batch.id, None)
            .await
            .expect("corrections");
        assert_eq!(file.file_name, "stock-corrections.csv");
        let outcome = parse_sheet(&file.bytes, "text/csv", &ParserLimits::default())
            .expect("reparse");
        assert_eq!(outcome.records.len(), 2);

        let marked = f.service.batch(&seller(), batch.id).await.expect("batch");
        assert!(marked.corrections_downloaded_at.is_some());
        assert_eq!(marked.status, BatchStatus::Staging);

        f.service.cancel(&seller(), batch.id).await.expect("cancel");
        let err = f
            .service
            .corrections(&seller(), batch.id, None)
            .await
            .expect_err("purged");
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn strangers_cannot_see_or_touch_a_shop() {
        let f = fixture().await;
        let batch = upload(&f, THREE_ROWS).await.batch;
        let stranger = Principal {
            user_id: Uuid::from_u128(0xbad),
            role: Role::Seller,
        };
        let err = f.service.batch(&stranger, batch.id).await.expect_err("hidden");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let missing = f.service.batch(&seller(), Uuid::new_v4()).await.expect_err("missing");
        assert_eq!(missing.kind(), ErrorKind::NotFound);
        assert_eq!(err.detail(), missing.detail());

        let err = f
            .service
            .upload(&stranger, Uuid::from_u128(SHOP), "x.csv", "text/csv", THREE_ROWS.as_bytes())
            .await
            .expect_err("not owner");
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let buyer = Principal {
            user_id: Uuid::from_u128(OWNER),
            role: Role::User,
        };
        let err = f.service.list_batches(&buyer, Uuid::from_u128(SHOP)).await.expect_err("role");
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let admin = Principal {
            user_id: Uuid::from_u128(0xad),
            role: Role::Admin,
        };
        assert!(f.service.batch(&admin, batch.id).await.is_ok());
    }

    #[tokio::test]
    async fn already_listed_products_are_rejected_at_upload() {
        let f = fixture().await;
        f.store
            .add_shop_product(ShopProduct {
                id: Uuid::new_v4(),
                shop_id: Uuid::from_u128(SHOP),
                product_id: Uuid::from_u128(1),
                sku: "OLD-1".into(),
                price: Decimal::new(45000, 2),
                stock: 1,
                condition: Condition::New,
                images: Vec::new(),
                specs: BTreeMap::new(),
                listing_status: ListingStatus::Active,
                is_available: true,
                batch_id: None,
                created_at: chrono::Utc::now(),
            })
            .await;
        let report = upload(&f, THREE_ROWS).await;
        assert_eq!(report.batch.valid_rows, 0);
        assert_eq!(report.batch.invalid_rows, 2);
    }

    #[tokio::test]
    async fn match_invalid_and_new_rows_end_to_end() {
        let f = fixture().await;
        let body = "name,brand,price,stock,category\n\
            Galaxy A54 128GB,Samsung,450,3,\n\
            Electric Kettle,Ramtons,25,-2,\n\
            Tecno Pova 5,Tecno,200,4,Phones\n";
        let report = upload(&f, body).await;
        let batch = &report.batch;
        assert_eq!(batch.total_rows, 3);
        assert_eq!((batch.valid_rows, batch.invalid_rows, batch.skipped_rows), (2, 1, 0));
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].row_index, 2);
        assert_eq!(report.errors[0].field, "stock");

        let valid = f
            .service
            .preview(
                &seller(),
                batch.id,
                PreviewQuery {
                    filter: RowFilter::Valid,
                    ..PreviewQuery::default()
                },
            )
            .await
            .expect("preview");
        let kinds: Vec<Option<MatchKind>> = valid.rows.iter().map(|r| r.match_kind).collect();
        assert_eq!(kinds, vec![Some(MatchKind::Exact), Some(MatchKind::New)]);

        let file = f
            .service
            .corrections(&seller(), batch.id, None)
            .await
            .expect("corrections");
        let outcome = parse_sheet(&file.bytes, "text/csv", &ParserLimits::default())
            .expect("reparse");
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].raw.name, "Electric Kettle");

        let committed = f.service.commit(&seller(), batch.id).await.expect("commit");
        assert_eq!(committed.batch.committed_rows, 2);
        assert_eq!(committed.summary.catalog_created, 1);
        assert_eq!(traced_listings(&f, batch.id).await, 2);

        let listings = f.store.shop_products().await;
        assert_eq!(listings.len(), 2);
        let matched = listings
            .iter()
            .find(|l| l.product_id == Uuid::from_u128(1))
            .expect("matched listing");
        assert_eq!(matched.listing_status, ListingStatus::NeedsImages);
        let created = listings
            .iter()
            .find(|l| l.product_id != Uuid::from_u128(1))
            .expect("new listing");
        assert_eq!(created.listing_status, ListingStatus::NeedsSpecs);
        let product = f
            .store
            .catalog()
            .await
            .into_iter()
            .find(|p| p.id == created.product_id)
            .expect("created product");
        assert_eq!(product.status, CatalogStatus::PendingReview);
    }

    #[tokio::test]
    async fn concurrent_resolutions_cannot_share_a_product() {
        let f = fixture().await;
        let body = "name,brand,price,stock\n\
            iPhone 13,Apple,600,1\n\
            iPhone 13 Pro,Apple,700,1\n";
        let batch = upload(&f, body).await.batch;
        assert_eq!(batch.skipped_rows, 2);

        let pick = || Resolution::Product {
            product_id: Uuid::from_u128(2),
        };
        let principal = seller();
        let (first, second) = tokio::join!(
            f.service.resolve(&principal, batch.id, 1, pick()),
            f.service.resolve(&principal, batch.id, 2, pick()),
        );
        let rows = [first.expect("first"), second.expect("second")];
        assert_eq!(rows.iter().filter(|r| r.row.is_valid).count(), 1);

        let settled = f.service.batch(&seller(), batch.id).await.expect("batch");
        assert_eq!((settled.valid_rows, settled.invalid_rows), (1, 1));
        let report = f.service.commit(&seller(), batch.id).await.expect("commit");
        assert_eq!(report.batch.committed_rows, 1);
    }

    #[test]
    fn corrections_file_name_keeps_the_stem() {
        assert_eq!(corrections_file_name("march.csv"), "march-corrections.csv");
        assert_eq!(corrections_file_name("noext"), "noext-corrections.csv");
        assert_eq!(corrections_file_name(""), "upload-corrections.csv");
    }
}
