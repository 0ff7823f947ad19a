//! Core domain model for the product harvester.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "oph-core";

/// One extracted product detail page. Every field except the canonical
/// product URL is best-effort: a miss yields `None`, never an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub sku: Option<String>,
    pub name: Option<String>,
    pub brand: Option<String>,
    pub card_price: Option<String>,
    pub discount_price: Option<String>,
    pub base_price: Option<String>,
    pub rating: Option<String>,
    pub review_count: Option<String>,
    pub seller_name: Option<String>,
    pub seller_url: Option<String>,
    pub seller_details: Option<String>,
    pub tax_id: Option<String>,
    pub product_url: String,
}

impl ProductRecord {
    /// Spreadsheet column titles, in output order.
    pub const COLUMNS: [&'static str; 13] = [
        "SKU",
        "Name",
        "Brand",
        "Card price",
        "Discount price",
        "Base price",
        "Rating",
        "Reviews",
        "Seller",
        "Seller link",
        "Seller details",
        "Tax ID",
        "Product link",
    ];

    /// Degraded record for a page whose extraction failed outright.
    pub fn absent(product_url: impl Into<String>) -> Self {
        Self {
            sku: None,
            name: None,
            brand: None,
            card_price: None,
            discount_price: None,
            base_price: None,
            rating: None,
            review_count: None,
            seller_name: None,
            seller_url: None,
            seller_details: None,
            tax_id: None,
            product_url: product_url.into(),
        }
    }

    /// Cell values in [`Self::COLUMNS`] order.
    pub fn values(&self) -> [Option<&str>; 13] {
        [
            self.sku.as_deref(),
            self.name.as_deref(),
            self.brand.as_deref(),
            self.card_price.as_deref(),
            self.discount_price.as_deref(),
            self.base_price.as_deref(),
            self.rating.as_deref(),
            self.review_count.as_deref(),
            self.seller_name.as_deref(),
            self.seller_url.as_deref(),
            self.seller_details.as_deref(),
            self.tax_id.as_deref(),
            Some(self.product_url.as_str()),
        ]
    }
}

/// Normalize an anchor href into an absolute product URL. Relative paths get
/// the site origin prefixed; absolute URLs pass through untouched.
pub fn normalize_product_link(origin: &str, href: &str) -> String {
    let href = href.trim();
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else if let Some(rest) = href.strip_prefix("//") {
        format!("https://{rest}")
    } else if href.starts_with('/') {
        format!("{}{}", origin.trim_end_matches('/'), href)
    } else {
        format!("{}/{}", origin.trim_end_matches('/'), href)
    }
}

/// Insertion-ordered set of product links. Iteration order is discovery
/// order, which keeps truncation-to-target deterministic.
#[derive(Debug, Clone, Default)]
pub struct LinkSet {
    order: Vec<String>,
    seen: HashSet<String>,
}

impl LinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert one link; returns true when it was not already present.
    pub fn insert(&mut self, link: impl Into<String>) -> bool {
        let link = link.into();
        if self.seen.contains(&link) {
            return false;
        }
        self.seen.insert(link.clone());
        self.order.push(link);
        true
    }

    /// Merge a batch of links; returns how many were new.
    pub fn merge<I>(&mut self, links: I) -> usize
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        links
            .into_iter()
            .map(|link| self.insert(link))
            .filter(|added| *added)
            .count()
    }

    pub fn contains(&self, link: &str) -> bool {
        self.seen.contains(link)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Keep only the first `n` links in discovery order.
    pub fn truncate(&mut self, n: usize) {
        if n >= self.order.len() {
            return;
        }
        for dropped in self.order.drain(n..) {
            self.seen.remove(&dropped);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn into_vec(self) -> Vec<String> {
        self.order
    }
}

impl<S: Into<String>> FromIterator<S> for LinkSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut links = Self::new();
        links.merge(iter);
        links
    }
}

/// In-memory accumulation of de-duplicated product records keyed by SKU.
/// Insertion is first-seen-wins; rows keep their insertion order.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    index: HashMap<String, usize>,
    records: Vec<ProductRecord>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record under its SKU. Returns false (dropping the record)
    /// when the SKU is absent or already present.
    pub fn insert(&mut self, record: ProductRecord) -> bool {
        let Some(sku) = record.sku.clone() else {
            return false;
        };
        if self.index.contains_key(&sku) {
            return false;
        }
        self.index.insert(sku, self.records.len());
        self.records.push(record);
        true
    }

    pub fn get(&self, sku: &str) -> Option<&ProductRecord> {
        self.index.get(sku).map(|&i| &self.records[i])
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &ProductRecord> {
        self.records.iter()
    }
}

/// Narrow progress-reporting seam: the extraction loop reports a total and
/// per-link advancement; UI concerns stay behind this trait.
pub trait ProgressObserver: Send {
    fn set_total(&mut self, total: usize);
    fn advance(&mut self, n: usize);
}

/// Observer that ignores everything.
#[derive(Debug, Default)]
pub struct NoopProgress;

impl ProgressObserver for NoopProgress {
    fn set_total(&mut self, _total: usize) {}
    fn advance(&mut self, _n: usize) {}
}
