//! WebDriver-backed browser session: search-page driving plus product-page
//! field extraction.

use std::time::Duration;

use async_trait::async_trait;
use oph_core::ProductRecord;
use scraper::{ElementRef, Html, Selector};
use serde_json::json;
use thirtyfour::error::WebDriverError;
use thirtyfour::extensions::cdp::ChromeDevTools;
use thirtyfour::prelude::*;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "oph-browser";

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error(transparent)]
    WebDriver(#[from] WebDriverError),
    #[error("script returned unexpected value: {0}")]
    Script(String),
}

/// Scroll-and-collect surface of the live search-results page.
#[async_trait]
pub trait SearchPage: Send + Sync {
    /// Scroll the window to an absolute vertical offset.
    async fn scroll_to(&self, y: u64) -> Result<(), BrowserError>;

    /// Current rendered document height.
    async fn page_height(&self) -> Result<u64, BrowserError>;

    /// Hrefs of all anchors currently matching `css`, in DOM order. A page
    /// with no matching anchors yields an empty list, not an error.
    async fn product_hrefs(&self, css: &str) -> Result<Vec<String>, BrowserError>;
}

/// Detail-page extraction: navigate to one product link and return the
/// fixed-shape record. Field misses are represented inside the record; the
/// call itself fails only on navigation or timeout errors.
#[async_trait]
pub trait ProductExtractor: Send + Sync {
    async fn extract(&self, url: &str) -> Result<ProductRecord, BrowserError>;
}

#[derive(Debug, Clone)]
pub struct BrowserConfig {
    /// WebDriver endpoint (chromedriver).
    pub webdriver_url: String,
    /// Site origin; also the prefix for relative product links.
    pub origin: String,
    pub user_agent: String,
    pub headless: bool,
    pub window_size: (u32, u32),
    /// Wait budget for individual DOM lookups.
    pub selector_timeout: Duration,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            webdriver_url: "http://localhost:9515".to_string(),
            origin: "https://ozon.ru".to_string(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36"
                .to_string(),
            headless: false,
            window_size: (1280, 720),
            selector_timeout: Duration::from_secs(10),
        }
    }
}

// Cosmetic overrides only; these do not defeat serious bot detection.
const NAVIGATOR_OVERRIDES: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => false });
window.navigator.chrome = { runtime: {} };
Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'] });
Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3, 4, 5] });
"#;

const HEADING_WIDGET: &str = "div[data-widget='webProductHeading']";
const SELLER_WIDGET: &str = "div[data-widget='webCurrentSeller']";
const SCORE_WIDGET: &str = "div[data-widget='webSingleProductScore']";
const SELLER_MODAL: &str = "div[data-popper-placement^='top']";
const SKU_MARKER: &str = "Артикул: ";

/// One live browser session driving both the search-results page and the
/// product detail pages, strictly sequentially.
pub struct BrowserSession {
    driver: WebDriver,
    config: BrowserConfig,
}

impl BrowserSession {
    /// Connect to the WebDriver endpoint and leave the page sitting on the
    /// search results for `query`.
    pub async fn launch(config: BrowserConfig, query: &str) -> Result<Self, BrowserError> {
        let mut caps = DesiredCapabilities::chrome();
        caps.add_arg(&format!("--user-agent={}", config.user_agent))?;
        caps.add_arg(&format!(
            "--window-size={},{}",
            config.window_size.0, config.window_size.1
        ))?;
        if config.headless {
            caps.add_arg("--headless=new")?;
        }
        let driver = WebDriver::new(&config.webdriver_url, caps).await?;

        let dev_tools = ChromeDevTools::new(driver.handle.clone());
        if let Err(err) = dev_tools
            .execute_cdp_with_params(
                "Page.addScriptToEvaluateOnNewDocument",
                json!({ "source": NAVIGATOR_OVERRIDES }),
            )
            .await
        {
            warn!(%err, "navigator overrides not installed");
        }

        let session = Self { driver, config };
        session.open_search(query).await?;
        Ok(session)
    }

    async fn open_search(&self, query: &str) -> Result<(), BrowserError> {
        info!(origin = %self.config.origin, "navigating to site origin");
        self.driver.goto(&self.config.origin).await?;
        // The landing page keeps rendering widgets well past onload.
        sleep(Duration::from_secs(5)).await;

        self.driver
            .execute("window.scrollBy(0, 500);", Vec::new())
            .await?;
        sleep(Duration::from_secs(2)).await;

        info!(query, "submitting search query");
        let input = self
            .wait_for(By::Css("input[name='text']"), Duration::from_secs(30))
            .await?;
        input.send_keys(query).await?;
        sleep(Duration::from_millis(500)).await;

        let submit = self
            .wait_for(By::Css("button[type='submit']"), self.config.selector_timeout)
            .await?;
        submit.click().await?;
        sleep(Duration::from_secs(2)).await;
        Ok(())
    }

    /// Poll for an element until it is present or the timeout elapses.
    async fn wait_for(&self, by: By, timeout: Duration) -> Result<WebElement, BrowserError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.driver.find(by.clone()).await {
                Ok(element) => return Ok(element),
                Err(err) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(BrowserError::WebDriver(err));
                    }
                    sleep(Duration::from_millis(250)).await;
                }
            }
        }
    }

    async fn sku(&self) -> Option<String> {
        let marker = format!("//div[contains(text(), '{SKU_MARKER}')]");
        let element = self
            .wait_for(By::XPath(&marker), Duration::from_secs(5))
            .await
            .ok()?;
        let text = element.text().await.ok()?;
        text.split(SKU_MARKER)
            .nth(1)
            .map(|sku| sku.trim().to_string())
            .filter(|sku| !sku.is_empty())
    }

    async fn seller_href(&self) -> Option<String> {
        let block = self
            .wait_for(By::Css(SELLER_WIDGET), Duration::from_secs(5))
            .await
            .ok()?;
        let link = block.find(By::Css("a[href]")).await.ok()?;
        link.attr("href").await.ok().flatten()
    }

    /// Open the seller-info modal and pull its legal-details paragraphs.
    async fn seller_modal(&self) -> (Option<String>, Option<String>) {
        let Ok(block) = self.wait_for(By::Css(SELLER_WIDGET), Duration::from_secs(5)).await else {
            return (None, None);
        };
        let Ok(button) = block.find(By::Css("button")).await else {
            return (None, None);
        };
        if button.click().await.is_err() {
            // Occluded by overlays; fall back to a synthetic click.
            let Ok(target) = button.to_json() else {
                return (None, None);
            };
            if self
                .driver
                .execute("arguments[0].click();", vec![target])
                .await
                .is_err()
            {
                return (None, None);
            }
        }
        sleep(Duration::from_millis(300)).await;

        if self
            .wait_for(By::Css(SELLER_MODAL), Duration::from_secs(5))
            .await
            .is_err()
        {
            return (None, None);
        }
        let Ok(source) = self.driver.source().await else {
            return (None, None);
        };
        parse_seller_modal(&source)
    }

    /// Quit the driver. The caller guarantees this runs on every exit path.
    pub async fn close(self) -> Result<(), BrowserError> {
        self.driver.quit().await?;
        Ok(())
    }
}

#[async_trait]
impl SearchPage for BrowserSession {
    async fn scroll_to(&self, y: u64) -> Result<(), BrowserError> {
        self.driver
            .execute("window.scrollTo(0, arguments[0]);", vec![json!(y)])
            .await?;
        Ok(())
    }

    async fn page_height(&self) -> Result<u64, BrowserError> {
        let ret = self
            .driver
            .execute("return document.body.scrollHeight;", Vec::new())
            .await?;
        ret.convert()
            .map_err(|err| BrowserError::Script(err.to_string()))
    }

    async fn product_hrefs(&self, css: &str) -> Result<Vec<String>, BrowserError> {
        // Give lazily rendered cards a chance to attach before querying.
        if let Err(err) = self
            .wait_for(By::Css(css), self.config.selector_timeout)
            .await
        {
            warn!(%err, css, "no matching anchors before timeout");
            return Ok(Vec::new());
        }

        let mut hrefs = Vec::new();
        for element in self.driver.find_all(By::Css(css)).await? {
            if let Some(href) = element.attr("href").await? {
                hrefs.push(href);
            }
        }
        Ok(hrefs)
    }
}

#[async_trait]
impl ProductExtractor for BrowserSession {
    async fn extract(&self, url: &str) -> Result<ProductRecord, BrowserError> {
        debug!(url, "navigating to product page");
        self.driver.goto(url).await?;
        sleep(Duration::from_millis(200)).await;
        self.wait_for(By::Css(HEADING_WIDGET), Duration::from_secs(5))
            .await?;

        let sku = self.sku().await;
        let seller_url = self.seller_href().await;
        let source = self.driver.source().await?;
        let fields = parse_page_fields(&source);
        let (seller_details, tax_id) = self.seller_modal().await;

        Ok(ProductRecord {
            sku,
            name: fields.name,
            brand: fields.brand,
            card_price: fields.card_price,
            discount_price: fields.discount_price,
            base_price: fields.base_price,
            rating: fields.rating,
            review_count: fields.review_count,
            seller_name: fields.seller_name,
            seller_url,
            seller_details,
            tax_id,
            product_url: url.to_string(),
        })
    }
}

#[derive(Debug, Default)]
struct PageFields {
    name: Option<String>,
    brand: Option<String>,
    card_price: Option<String>,
    discount_price: Option<String>,
    base_price: Option<String>,
    rating: Option<String>,
    review_count: Option<String>,
    seller_name: Option<String>,
}

// The scraper DOM is !Send, so all parsing stays inside synchronous helpers
// that never live across an await.
fn parse_page_fields(source: &str) -> PageFields {
    let html = Html::parse_document(source);
    let (rating, review_count) = rating_and_reviews(&html);
    let (discount_price, base_price) = full_prices(&html);
    PageFields {
        name: product_name(&html),
        brand: brand(&html),
        card_price: card_price(&html),
        discount_price,
        base_price,
        rating,
        review_count,
        seller_name: seller_name(&html),
    }
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_first_text(html: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    html.select(&sel)
        .next()
        .and_then(|node| text_or_none(node.text().collect::<String>()))
}

fn product_name(html: &Html) -> Option<String> {
    select_first_text(html, "div[data-widget='webProductHeading'] h1")
        .map(|name| name.replace('\t', "").replace('\n', " ").trim().to_string())
}

fn rating_and_reviews(html: &Html) -> (Option<String>, Option<String>) {
    let Some(text) = select_first_text(html, SCORE_WIDGET) else {
        return (None, None);
    };
    match text.split_once(" • ") {
        Some((stars, reviews)) => (
            text_or_none(stars.to_string()),
            text_or_none(reviews.to_string()),
        ),
        None => (None, None),
    }
}

fn clean_price(text: &str) -> Option<String> {
    text_or_none(text.replace('\u{2009}', "").replace('₽', "").trim().to_string())
}

fn is_leaf(span: &ElementRef) -> bool {
    span.children().filter_map(ElementRef::wrap).next().is_none()
}

/// Price shown next to the "Ozon Карта" label.
fn card_price(html: &Html) -> Option<String> {
    let span_sel = Selector::parse("span").ok()?;
    let price_sel = Selector::parse("div > span").ok()?;
    for span in html.select(&span_sel) {
        if !is_leaf(&span) {
            continue;
        }
        let label: String = span.text().collect();
        if !label.contains("Ozon Карт") || label.contains("без Ozon Карты") {
            continue;
        }
        let Some(parent) = span.parent().and_then(ElementRef::wrap) else {
            continue;
        };
        // The label span may itself match the price selector; skip it.
        if let Some(price) = parent
            .select(&price_sel)
            .find(|node| node.id() != span.id())
        {
            return clean_price(&price.text().collect::<String>());
        }
    }
    None
}

/// Discounted and pre-discount prices from the "без Ozon Карты" block.
fn full_prices(html: &Html) -> (Option<String>, Option<String>) {
    let Ok(span_sel) = Selector::parse("span") else {
        return (None, None);
    };
    let Ok(price_sel) = Selector::parse("div > span") else {
        return (None, None);
    };
    for span in html.select(&span_sel) {
        if !is_leaf(&span) {
            continue;
        }
        let label: String = span.text().collect();
        if !label.contains("без Ozon Карты") {
            continue;
        }
        let Some(block) = span
            .parent()
            .and_then(|parent| parent.parent())
            .and_then(ElementRef::wrap)
        else {
            continue;
        };
        let prices: Vec<String> = block
            .select(&price_sel)
            .filter(|node| node.id() != span.id())
            .map(|node| node.text().collect::<String>())
            .collect();
        let discount = prices.first().and_then(|price| clean_price(price));
        let base = prices.get(1).and_then(|price| clean_price(price));
        return (discount, base);
    }
    (None, None)
}

fn seller_name(html: &Html) -> Option<String> {
    let sel = Selector::parse("a[href*='/seller/']").ok()?;
    for anchor in html.select(&sel) {
        let href = anchor
            .value()
            .attr("href")
            .unwrap_or_default()
            .to_ascii_lowercase();
        if href.contains("reviews") || href.contains("info") {
            continue;
        }
        let text = anchor.text().collect::<String>().trim().to_string();
        if text.chars().count() >= 2 {
            return Some(text);
        }
    }
    None
}

/// Brand sits in the last breadcrumb.
fn brand(html: &Html) -> Option<String> {
    select_first_text(html, "div[data-widget='breadCrumbs'] li:last-child span")
}

fn parse_seller_modal(source: &str) -> (Option<String>, Option<String>) {
    let html = Html::parse_document(source);
    let Ok(sel) = Selector::parse("div[data-popper-placement^='top'] p") else {
        return (None, None);
    };
    let mut paragraphs = html
        .select(&sel)
        .filter_map(|node| text_or_none(node.text().collect::<String>()));
    (paragraphs.next(), paragraphs.next())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRODUCT_PAGE: &str = r#"
        <html><body>
        <div data-widget='breadCrumbs'>
            <ol>
                <li><span>Home</span></li>
                <li><span>Plumbing</span></li>
                <li><span>Valtec</span></li>
            </ol>
        </div>
        <div data-widget='webProductHeading'><h1>Ball valve DN50
brass</h1></div>
        <div data-widget='webSingleProductScore'>4.8 • 123 reviews</div>
        <div>
            <span>c Ozon Картой</span>
            <div><span>1 190 ₽</span></div>
        </div>
        <div>
            <div>
                <span>без Ozon Карты</span>
                <div><span>1 290 ₽</span><span>1 590 ₽</span></div>
            </div>
        </div>
        <div data-widget='webCurrentSeller'>
            <a href="/seller/valtec-123/">Valtec Official</a>
            <a href="/seller/valtec-123/reviews/">reviews</a>
        </div>
        </body></html>
    "#;

    #[test]
    fn parses_the_product_page_fields() {
        let fields = parse_page_fields(PRODUCT_PAGE);
        assert_eq!(fields.name.as_deref(), Some("Ball valve DN50 brass"));
        assert_eq!(fields.brand.as_deref(), Some("Valtec"));
        assert_eq!(fields.rating.as_deref(), Some("4.8"));
        assert_eq!(fields.review_count.as_deref(), Some("123 reviews"));
        assert_eq!(fields.card_price.as_deref(), Some("1 190"));
        assert_eq!(fields.discount_price.as_deref(), Some("1 290"));
        assert_eq!(fields.base_price.as_deref(), Some("1 590"));
        assert_eq!(fields.seller_name.as_deref(), Some("Valtec Official"));
    }

    #[test]
    fn missing_widgets_yield_absent_fields() {
        let fields = parse_page_fields("<html><body><p>nothing here</p></body></html>");
        assert_eq!(fields.name, None);
        assert_eq!(fields.brand, None);
        assert_eq!(fields.card_price, None);
        assert_eq!(fields.discount_price, None);
        assert_eq!(fields.rating, None);
        assert_eq!(fields.seller_name, None);
    }

    #[test]
    fn seller_modal_paragraphs_map_to_details_and_tax_id() {
        let source = r#"
            <div data-popper-placement='top-start'>
                <p>ООО Валтек, 125167, Москва</p>
                <p>7713456789</p>
            </div>
        "#;
        let (details, tax_id) = parse_seller_modal(source);
        assert_eq!(details.as_deref(), Some("ООО Валтек, 125167, Москва"));
        assert_eq!(tax_id.as_deref(), Some("7713456789"));
    }

    #[test]
    fn seller_modal_absent_yields_nothing() {
        let (details, tax_id) = parse_seller_modal("<div><p>unrelated</p></div>");
        assert_eq!(details, None);
        assert_eq!(tax_id, None);
    }
}
