use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::tempdir;
use vacwatch_adapters::{CapturePolicy, DriverError, MoreControl, PageDriver, COUNT_SELECTOR};
use vacwatch_storage::{HistoryStore, RegistryStore};
use vacwatch_sync::ScrapePipeline;

const GRANDE: &str = "https://suumo.jp/library/tf_27/sc_27107/to_1002461672/";
const RIVERSIDE: &str = "https://suumo.jp/library/tf_27/sc_27107/to_1002440443/";

struct Page {
    count: Option<String>,
    html: String,
}

/// Serves a canned count and markup per URL. Unknown URLs time out.
#[derive(Default)]
struct ScriptedDriver {
    pages: HashMap<String, Page>,
    current: Option<String>,
    visited: Vec<String>,
}

impl ScriptedDriver {
    fn page(mut self, url: &str, count: Option<&str>, cells: &[&str]) -> Self {
        let rows: String = cells.iter().map(|c| format!("<tr><td>{c}</td></tr>")).collect();
        self.pages.insert(
            url.to_string(),
            Page {
                count: count.map(str::to_string),
                html: format!("<html><body><table>{rows}</table></body></html>"),
            },
        );
        self
    }

    fn current(&self) -> Result<&Page, DriverError> {
        self.current
            .as_ref()
            .and_then(|url| self.pages.get(url))
            .ok_or(DriverError::NoPage)
    }
}

#[async_trait]
impl PageDriver for ScriptedDriver {
    async fn goto(&mut self, url: &str, timeout: Duration) -> Result<(), DriverError> {
        self.visited.push(url.to_string());
        if !self.pages.contains_key(url) {
            self.current = None;
            return Err(DriverError::NavigationTimeout {
                url: url.to_string(),
                timeout,
            });
        }
        self.current = Some(url.to_string());
        Ok(())
    }

    async fn wait_for_selector(&mut self, _selector: &str, _timeout: Duration) -> Result<bool, DriverError> {
        Ok(self.current()?.count.is_some())
    }

    async fn first_text(&mut self, selector: &str) -> Result<Option<String>, DriverError> {
        assert_eq!(selector, COUNT_SELECTOR);
        Ok(self.current()?.count.clone())
    }

    async fn more_controls(&mut self, _label: &str) -> Result<Vec<MoreControl>, DriverError> {
        Ok(Vec::new())
    }

    async fn click(&mut self, control: &MoreControl) -> Result<(), DriverError> {
        Err(DriverError::Click {
            ordinal: control.ordinal,
            reason: "no controls on scripted pages".to_string(),
        })
    }

    async fn content(&mut self) -> Result<String, DriverError> {
        Ok(self.current()?.html.clone())
    }
}

async fn seeded_stores(dir: &std::path::Path) -> (RegistryStore, HistoryStore) {
    let registry = RegistryStore::in_dir(dir);
    registry.add("グランデ弁天町", GRANDE).await.expect("seed grande");
    registry.add("リバーサイド", RIVERSIDE).await.expect("seed riverside");
    (registry, HistoryStore::in_dir(dir))
}

fn policy() -> CapturePolicy {
    CapturePolicy::default().without_pauses()
}

#[tokio::test]
async fn failing_property_is_recorded_and_run_still_appends() {
    let dir = tempdir().expect("tempdir");
    let (registry, history) = seeded_stores(dir.path()).await;
    let driver = ScriptedDriver::default().page(GRANDE, Some("3"), &["即入居可", "'26年3月上旬", "'26年3月上旬"]);

    let mut pipeline = ScrapePipeline::new(registry, history.clone(), driver).with_policy(policy());
    let summary = pipeline.run_once().await.expect("run succeeds");
    assert_eq!(summary.attempted, 2);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.history_len, 1);

    let driver = pipeline.into_driver();
    assert_eq!(driver.visited, vec![GRANDE.to_string(), RIVERSIDE.to_string()]);

    let entries = history.load().await.expect("history");
    let entry = &entries[0];
    let grande = entry.property("property_1002461672").expect("grande snapshot");
    assert!(grande.success);
    assert_eq!(grande.count, 3);
    assert_eq!(grande.move_in_breakdown.get("26年3月上旬"), Some(&2));

    let riverside = entry.property("property_1002440443").expect("riverside snapshot");
    assert!(!riverside.success);
    assert_eq!(riverside.count, 0);
    assert!(riverside.move_in_breakdown.is_empty());
    assert!(riverside.error.as_deref().unwrap_or_default().contains("timed out"));
}

#[tokio::test]
async fn run_with_no_successes_leaves_history_untouched() {
    let dir = tempdir().expect("tempdir");
    let (registry, history) = seeded_stores(dir.path()).await;
    let driver = ScriptedDriver::default().page(GRANDE, None, &["相談"]);

    let mut pipeline = ScrapePipeline::new(registry, history.clone(), driver).with_policy(policy());
    let err = pipeline.run_once().await.unwrap_err();
    assert!(err.to_string().contains("failed"));
    assert!(!history.path().exists());
}

#[tokio::test]
async fn empty_registry_is_an_error() {
    let dir = tempdir().expect("tempdir");
    let registry = RegistryStore::in_dir(dir.path());
    let history = HistoryStore::in_dir(dir.path());

    let mut pipeline = ScrapePipeline::new(registry, history.clone(), ScriptedDriver::default()).with_policy(policy());
    let err = pipeline.run_once().await.unwrap_err();
    assert!(err.to_string().contains("no properties registered"));
    assert!(!history.path().exists());
}

#[tokio::test]
async fn consecutive_runs_accumulate_history_in_order() {
    let dir = tempdir().expect("tempdir");
    let (registry, history) = seeded_stores(dir.path()).await;
    let driver = ScriptedDriver::default()
        .page(GRANDE, Some("3"), &["即入居可"])
        .page(RIVERSIDE, Some("1"), &["相談"]);

    let mut pipeline = ScrapePipeline::new(registry, history.clone(), driver).with_policy(policy());
    pipeline.run_once().await.expect("first run");
    let summary = pipeline.run_once().await.expect("second run");
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.history_len, 2);

    let raw = std::fs::read_to_string(history.path()).expect("history file");
    let json: serde_json::Value = serde_json::from_str(&raw).expect("json");
    assert_eq!(json.as_array().map(Vec::len), Some(2));
    assert_eq!(json[1]["properties"][1]["moveInBreakdown"]["相談"], 1);
    assert!(json[1]["timestamp"].as_str().unwrap().ends_with("+09:00"));
}
