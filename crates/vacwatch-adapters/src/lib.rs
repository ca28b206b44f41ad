//! Page driver contract and the SUUMO library-page capture built on it.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use scraper::{Html, Selector};
use thiserror::Error;
use tracing::{debug, info, warn};
use vacwatch_core::{tally_cells, MoveInBreakdown, Property, PropertySnapshot};
use vacwatch_storage::{FetchError, HttpFetcher};

pub const CRATE_NAME: &str = "vacwatch-adapters";

pub const COUNT_SELECTOR: &str = "span.fgOrange.bld";
pub const MORE_LABEL: &str = "もっと見る";

/// Either of these appearing means the listing has rendered.
pub const READY_SELECTOR: &str = ".property_view_note-list, span.fgOrange.bld";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// A visible "show more" control as reported by a driver.
#[derive(Debug, Clone, PartialEq)]
pub struct MoreControl {
    pub ordinal: usize,
    pub bounds: BoundingBox,
    /// Resolved link target, for drivers that expand by navigation.
    pub target: Option<String>,
}

impl MoreControl {
    /// Approximate on-screen position used to avoid clicking a control twice.
    pub fn position_key(&self) -> (i64, i64) {
        (self.bounds.x.round() as i64, self.bounds.y.round() as i64)
    }
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("navigation to {url} timed out after {timeout:?}")]
    NavigationTimeout { url: String, timeout: Duration },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid selector '{selector}': {message}")]
    Selector { selector: String, message: String },
    #[error("no page has been loaded")]
    NoPage,
    #[error("invalid page url {url}: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("control #{ordinal} cannot be clicked: {reason}")]
    Click { ordinal: usize, reason: String },
}

/// Minimal surface of a page session. Calls are strictly sequential.
#[async_trait]
pub trait PageDriver: Send {
    async fn goto(&mut self, url: &str, timeout: Duration) -> Result<(), DriverError>;

    /// Returns whether `selector` matched before `timeout` elapsed.
    async fn wait_for_selector(&mut self, selector: &str, timeout: Duration) -> Result<bool, DriverError>;

    async fn first_text(&mut self, selector: &str) -> Result<Option<String>, DriverError>;

    /// Visible controls whose text contains `label`, in document order.
    async fn more_controls(&mut self, label: &str) -> Result<Vec<MoreControl>, DriverError>;

    async fn click(&mut self, control: &MoreControl) -> Result<(), DriverError>;

    async fn content(&mut self) -> Result<String, DriverError>;

    async fn pause(&mut self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CapturePolicy {
    pub navigation_timeout: Duration,
    pub ready_timeout: Duration,
    pub settle: Duration,
    pub scan_pause: Duration,
    pub after_click: Duration,
    pub final_settle: Duration,
    pub max_clicks: usize,
}

impl Default for CapturePolicy {
    fn default() -> Self {
        Self {
            navigation_timeout: Duration::from_secs(60),
            ready_timeout: Duration::from_secs(10),
            settle: Duration::from_secs(3),
            scan_pause: Duration::from_millis(500),
            after_click: Duration::from_millis(1500),
            final_settle: Duration::from_secs(2),
            max_clicks: 20,
        }
    }
}

impl CapturePolicy {
    pub fn without_pauses(self) -> Self {
        Self {
            settle: Duration::ZERO,
            scan_pause: Duration::ZERO,
            after_click: Duration::ZERO,
            final_settle: Duration::ZERO,
            ..self
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("vacancy count element '{selector}' not found")]
    CountMissing { selector: &'static str },
    #[error("vacancy count text '{text}' is not an integer")]
    CountUnparsable { text: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    pub count: u32,
    pub move_in_breakdown: MoveInBreakdown,
    pub expansions: usize,
}

/// Clicks "show more" controls until none are left unclicked or
/// `policy.max_clicks` distinct positions have been clicked. Returns the
/// number of clicks. A failing click ends expansion.
pub async fn expand_more<D: PageDriver + ?Sized>(driver: &mut D, policy: &CapturePolicy) -> usize {
    let mut clicked: HashSet<(i64, i64)> = HashSet::new();

    while clicked.len() < policy.max_clicks {
        driver.pause(policy.scan_pause).await;

        let controls = match driver.more_controls(MORE_LABEL).await {
            Ok(controls) => controls,
            Err(err) => {
                debug!(error = %err, "listing show-more controls failed; stopping expansion");
                break;
            }
        };
        let Some(next) = controls
            .into_iter()
            .find(|c| !clicked.contains(&c.position_key()))
        else {
            break;
        };

        match driver.click(&next).await {
            Ok(()) => {
                clicked.insert(next.position_key());
                driver.pause(policy.after_click).await;
            }
            Err(err) => {
                debug!(error = %err, ordinal = next.ordinal, "show-more click failed; stopping expansion");
                break;
            }
        }
    }

    clicked.len()
}

fn parse_count(text: &str) -> Result<u32, CaptureError> {
    let digits: String = text.trim().chars().filter(|c| *c != ',').collect();
    digits.parse().map_err(|_| CaptureError::CountUnparsable {
        text: text.trim().to_string(),
    })
}

/// Navigates to the property page, expands it, and extracts the count and
/// move-in breakdown.
pub async fn capture_property<D: PageDriver + ?Sized>(
    driver: &mut D,
    property: &Property,
    policy: &CapturePolicy,
) -> Result<Capture, CaptureError> {
    driver.goto(&property.url, policy.navigation_timeout).await?;

    if !driver.wait_for_selector(READY_SELECTOR, policy.ready_timeout).await? {
        debug!(id = %property.id, "readiness selector not seen; continuing");
    }
    driver.pause(policy.settle).await;

    let count_text = driver
        .first_text(COUNT_SELECTOR)
        .await?
        .ok_or(CaptureError::CountMissing {
            selector: COUNT_SELECTOR,
        })?;
    let count = parse_count(&count_text)?;

    let expansions = expand_more(driver, policy).await;
    driver.pause(policy.final_settle).await;

    let html = driver.content().await?;
    let move_in_breakdown = parse_move_in_breakdown(&html)?;

    Ok(Capture {
        count,
        move_in_breakdown,
        expansions,
    })
}

/// Captures a property and folds any failure into an unsuccessful snapshot.
pub async fn snapshot_property<D: PageDriver + ?Sized>(
    driver: &mut D,
    property: &Property,
    policy: &CapturePolicy,
) -> PropertySnapshot {
    info!(id = %property.id, name = %property.name, "capturing property");
    match capture_property(driver, property, policy).await {
        Ok(capture) => {
            let snapshot = PropertySnapshot::succeeded(property, capture.count, capture.move_in_breakdown);
            info!(
                id = %property.id,
                count = snapshot.count,
                move_in_rows = snapshot.breakdown_total(),
                expansions = capture.expansions,
                "captured property"
            );
            snapshot
        }
        Err(err) => {
            warn!(id = %property.id, error = %err, "capture failed");
            PropertySnapshot::failed(property, err.to_string())
        }
    }
}

fn parse_selector(selector: &str) -> Result<Selector, DriverError> {
    Selector::parse(selector).map_err(|e| DriverError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_first_text(document: &Html, selector: &str) -> Result<Option<String>, DriverError> {
    let sel = parse_selector(selector)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>())))
}

pub fn parse_move_in_breakdown(html: &str) -> Result<MoveInBreakdown, DriverError> {
    let cells = parse_selector("td")?;
    let document = Html::parse_document(html);
    Ok(tally_cells(
        document.select(&cells).map(|cell| cell.text().collect::<String>()),
    ))
}

/// Anchors whose text contains `label`, resolved against `base`. Links that
/// only run script or jump within the page are skipped, as are targets in
/// `followed`. Ordinals count every matching anchor so positions stay stable
/// as targets get followed.
fn more_links(
    html: &str,
    base: &Url,
    label: &str,
    followed: &HashSet<String>,
) -> Result<Vec<MoreControl>, DriverError> {
    let anchors = parse_selector("a[href]")?;
    let document = Html::parse_document(html);

    let links = document
        .select(&anchors)
        .filter(|a| a.text().collect::<String>().contains(label))
        .enumerate()
        .filter_map(|(ordinal, a)| {
            let href = a.value().attr("href")?.trim();
            if href.is_empty() || href.starts_with('#') || href.to_ascii_lowercase().starts_with("javascript:") {
                return None;
            }
            let target = base.join(href).ok()?.to_string();
            if followed.contains(&target) {
                return None;
            }
            Some(MoreControl {
                ordinal,
                bounds: BoundingBox {
                    x: 0.0,
                    y: ordinal as f64,
                    width: 0.0,
                    height: 0.0,
                },
                target: Some(target),
            })
        })
        .collect();
    Ok(links)
}

#[derive(Debug, Clone)]
struct LoadedPage {
    url: Url,
    html: String,
}

/// Page driver over plain HTTP. Markup is taken as served; "show more"
/// links are expanded by fetching their target and appending it to the
/// page content.
///
/// Only anchors with a followable `href` become controls. Controls that
/// are `#` fragments or `javascript:` links are skipped, so rows a site
/// loads by script behind such a control are never seen and the breakdown
/// undercounts them. Control bounds are synthetic (`x = 0`, `y` = document
/// order), which makes the position dedup in [`expand_more`] a no-op here;
/// it matters for drivers that report real layout.
#[derive(Debug)]
pub struct HttpPageDriver {
    http: HttpFetcher,
    page: Option<LoadedPage>,
    followed: HashSet<String>,
}

impl HttpPageDriver {
    pub fn new(http: HttpFetcher) -> Self {
        Self {
            http,
            page: None,
            followed: HashSet::new(),
        }
    }

    fn page(&self) -> Result<&LoadedPage, DriverError> {
        self.page.as_ref().ok_or(DriverError::NoPage)
    }
}

#[async_trait]
impl PageDriver for HttpPageDriver {
    async fn goto(&mut self, url: &str, timeout: Duration) -> Result<(), DriverError> {
        let fetched = tokio::time::timeout(timeout, self.http.fetch_text(url))
            .await
            .map_err(|_| DriverError::NavigationTimeout {
                url: url.to_string(),
                timeout,
            })??;
        let page_url = Url::parse(&fetched.final_url).map_err(|e| DriverError::InvalidUrl {
            url: fetched.final_url.clone(),
            message: e.to_string(),
        })?;
        self.followed.clear();
        self.page = Some(LoadedPage {
            url: page_url,
            html: fetched.body,
        });
        Ok(())
    }

    async fn wait_for_selector(&mut self, selector: &str, _timeout: Duration) -> Result<bool, DriverError> {
        let sel = parse_selector(selector)?;
        let document = Html::parse_document(&self.page()?.html);
        let found = document.select(&sel).next().is_some();
        Ok(found)
    }

    async fn first_text(&mut self, selector: &str) -> Result<Option<String>, DriverError> {
        let document = Html::parse_document(&self.page()?.html);
        select_first_text(&document, selector)
    }

    async fn more_controls(&mut self, label: &str) -> Result<Vec<MoreControl>, DriverError> {
        let page = self.page()?;
        more_links(&page.html, &page.url, label, &self.followed)
    }

    async fn click(&mut self, control: &MoreControl) -> Result<(), DriverError> {
        let target = control.target.clone().ok_or_else(|| DriverError::Click {
            ordinal: control.ordinal,
            reason: "control has no link target".to_string(),
        })?;
        self.page()?;
        let fetched = self.http.fetch_text(&target).await?;
        self.followed.insert(target);
        if let Some(page) = self.page.as_mut() {
            page.html.push_str(&fetched.body);
        }
        Ok(())
    }

    async fn content(&mut self) -> Result<String, DriverError> {
        Ok(self.page()?.html.clone())
    }
}
