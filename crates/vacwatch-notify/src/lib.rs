//! Change detection between consecutive scrape runs and email delivery of
//! the resulting report.

mod mail;
mod report;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;
use tracing::{info, warn};
use vacwatch_core::{env_flag, env_or, env_parse, env_value, ConfigError, HistoryEntry};
use vacwatch_storage::HistoryStore;

pub use mail::{MailError, Mailer, OutgoingMail, SmtpMailer};
pub use report::{
    change_subject, daily_subject, format_breakdown, render_change_report, render_daily_report, target_count,
};

pub const CRATE_NAME: &str = "vacwatch-notify";

/// Move-in keys containing this marker are highlighted.
pub const DEFAULT_TARGET_MOVE_IN: &str = "26年3月";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    Count,
    MoveIn { key: String, highlight: bool },
}

/// One observed difference for one property between two runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub property_id: String,
    pub property_name: String,
    pub kind: ChangeKind,
    pub previous: u32,
    pub current: u32,
}

impl Change {
    pub fn delta(&self) -> i64 {
        i64::from(self.current) - i64::from(self.previous)
    }

    pub fn highlighted(&self) -> bool {
        matches!(self.kind, ChangeKind::MoveIn { highlight: true, .. })
    }

    /// e.g. `物件数: 3件 → 5件 (2件増加)`.
    pub fn message(&self) -> String {
        let label = match &self.kind {
            ChangeKind::Count => "物件数",
            ChangeKind::MoveIn { key, .. } => key.as_str(),
        };
        let direction = if self.delta() > 0 { "増加" } else { "減少" };
        format!(
            "{label}: {}件 → {}件 ({}件{direction})",
            self.previous,
            self.current,
            self.delta().unsigned_abs()
        )
    }
}

/// Differences between the latest entry and the one before it. Properties
/// missing from `previous` are skipped. A key absent on one side counts as 0.
pub fn detect_changes(current: &HistoryEntry, previous: &HistoryEntry, marker: &str) -> Vec<Change> {
    let mut changes = Vec::new();

    for now in &current.properties {
        let Some(before) = previous.property(&now.id) else {
            continue;
        };

        if now.count != before.count {
            changes.push(Change {
                property_id: now.id.clone(),
                property_name: now.name.clone(),
                kind: ChangeKind::Count,
                previous: before.count,
                current: now.count,
            });
        }

        // Keys of the latest run first, then keys that disappeared.
        let gone = before
            .move_in_breakdown
            .keys()
            .filter(|key| !now.move_in_breakdown.contains_key(*key));
        for key in now.move_in_breakdown.keys().chain(gone) {
            let was = before.move_in_breakdown.get(key).copied().unwrap_or(0);
            let is = now.move_in_breakdown.get(key).copied().unwrap_or(0);
            if was != is {
                changes.push(Change {
                    property_id: now.id.clone(),
                    property_name: now.name.clone(),
                    kind: ChangeKind::MoveIn {
                        key: key.clone(),
                        highlight: key.contains(marker),
                    },
                    previous: was,
                    current: is,
                });
            }
        }
    }

    changes
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportMode {
    /// Sent when the latest run differs from the previous one.
    #[default]
    Changes,
    /// Snapshot of the latest run, sent every time.
    Daily,
}

impl FromStr for ReportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "changes" => Ok(Self::Changes),
            "daily" => Ok(Self::Daily),
            other => Err(format!("unknown report mode '{other}' (expected changes or daily)")),
        }
    }
}

impl fmt::Display for ReportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Changes => "changes",
            Self::Daily => "daily",
        })
    }
}

/// Resolved SMTP connection and addressing.
#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub server: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone)]
pub struct NotifyConfig {
    pub data_dir: PathBuf,
    pub mode: ReportMode,
    pub force_send: bool,
    pub require_target_change: bool,
    pub target_move_in: String,
    pub smtp_server: String,
    pub smtp_port: u16,
    pub smtp_user: Option<String>,
    pub smtp_password: Option<String>,
    pub from_email: Option<String>,
    pub notification_email: Option<String>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            mode: ReportMode::default(),
            force_send: false,
            require_target_change: false,
            target_move_in: DEFAULT_TARGET_MOVE_IN.to_string(),
            smtp_server: "smtp.gmail.com".to_string(),
            smtp_port: 587,
            smtp_user: None,
            smtp_password: None,
            from_email: None,
            notification_email: None,
        }
    }
}

impl NotifyConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            data_dir: env_value("VACWATCH_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            mode: defaults.mode,
            force_send: env_flag("FORCE_SEND"),
            require_target_change: env_flag("NOTIFY_REQUIRE_TARGET_CHANGE"),
            target_move_in: env_or("TARGET_MOVE_IN", DEFAULT_TARGET_MOVE_IN),
            smtp_server: env_or("SMTP_SERVER", &defaults.smtp_server),
            smtp_port: env_parse("SMTP_PORT", defaults.smtp_port)?,
            smtp_user: env_value("SMTP_USER"),
            smtp_password: env_value("SMTP_PASSWORD"),
            from_email: env_value("FROM_EMAIL"),
            notification_email: env_value("NOTIFICATION_EMAIL"),
        })
    }

    /// Sender defaults to the SMTP user and recipient to the sender.
    pub fn smtp(&self) -> Result<SmtpSettings, NotifyError> {
        let (Some(user), Some(password)) = (self.smtp_user.clone(), self.smtp_password.clone()) else {
            return Err(NotifyError::MissingCredentials);
        };
        let from = self.from_email.clone().unwrap_or_else(|| user.clone());
        let to = self.notification_email.clone().unwrap_or_else(|| from.clone());
        Ok(SmtpSettings {
            server: self.smtp_server.clone(),
            port: self.smtp_port,
            user,
            password,
            from,
            to,
        })
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("no history entries in {path}")]
    NoData { path: String },
    #[error("SMTP_USER and SMTP_PASSWORD must both be set to send mail")]
    MissingCredentials,
    #[error(transparent)]
    Mail(#[from] MailError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoChanges,
    NoTargetChange,
}

/// What a notify run decided to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyPlan {
    Skip(SkipReason),
    Send { subject: String, body: String, changes: Vec<Change> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyOutcome {
    Skipped(SkipReason),
    Sent { subject: String, to: String },
}

/// Builds the report for the latest history entry, or decides to skip.
pub fn plan_notification(history: &[HistoryEntry], config: &NotifyConfig) -> Option<NotifyPlan> {
    let latest = history.last()?;
    let marker = config.target_move_in.as_str();

    if config.mode == ReportMode::Daily {
        return Some(NotifyPlan::Send {
            subject: daily_subject(latest, marker),
            body: render_daily_report(latest, marker),
            changes: Vec::new(),
        });
    }

    let changes = match history.len() {
        0 | 1 => Vec::new(),
        n => detect_changes(latest, &history[n - 2], marker),
    };
    let target_changed = changes.iter().any(Change::highlighted);

    if !config.force_send {
        if changes.is_empty() {
            info!("no changes since the previous run");
            return Some(NotifyPlan::Skip(SkipReason::NoChanges));
        }
        if config.require_target_change && !target_changed {
            info!(changes = changes.len(), marker, "changes found but none for the target month");
            return Some(NotifyPlan::Skip(SkipReason::NoTargetChange));
        }
    } else if changes.is_empty() {
        info!("no changes since the previous run; sending anyway (FORCE_SEND)");
    }

    Some(NotifyPlan::Send {
        subject: change_subject(latest, &changes, marker),
        body: render_change_report(latest, &changes, marker),
        changes,
    })
}

/// Loads history, plans, and delivers through the mailer built by `connect`.
/// `connect` is only called when there is something to send.
pub async fn run_notify<F, M>(
    config: &NotifyConfig,
    history: &HistoryStore,
    connect: F,
) -> Result<NotifyOutcome, NotifyError>
where
    F: FnOnce(&SmtpSettings) -> Result<M, MailError>,
    M: Mailer,
{
    let entries = history.load_or_empty().await;
    let plan = plan_notification(&entries, config).ok_or_else(|| NotifyError::NoData {
        path: history.path().display().to_string(),
    })?;

    let (subject, body, changes) = match plan {
        NotifyPlan::Skip(reason) => return Ok(NotifyOutcome::Skipped(reason)),
        NotifyPlan::Send { subject, body, changes } => (subject, body, changes),
    };

    let settings = config.smtp()?;
    let mailer = connect(&settings)?;
    let mail = OutgoingMail {
        from: settings.from.clone(),
        to: settings.to.clone(),
        subject,
        body,
    };

    if let Err(err) = mailer.send(&mail).await {
        warn!(error = %err, to = %mail.to, "mail delivery failed");
        return Err(err.into());
    }
    info!(
        to = %mail.to,
        subject = %mail.subject,
        changes = changes.len(),
        mode = %config.mode,
        "notification sent"
    );
    Ok(NotifyOutcome::Sent {
        subject: mail.subject,
        to: mail.to,
    })
}

pub async fn run_notify_from_env(mode: ReportMode, force: bool) -> anyhow::Result<NotifyOutcome> {
    let mut config = NotifyConfig::from_env()?;
    config.mode = mode;
    config.force_send |= force;
    let history = HistoryStore::in_dir(&config.data_dir);
    Ok(run_notify(&config, &history, SmtpMailer::connect).await?)
}
