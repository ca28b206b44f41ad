//! Plain-text email bodies and subjects.

use vacwatch_core::{HistoryEntry, MoveInBreakdown, PropertySnapshot, IMMEDIATE_KEY, NEGOTIABLE_KEY};

use crate::Change;

const FOOTER: [&str; 2] = ["このメールは自動送信されています。", "詳細はWebサイトをご確認ください。"];

fn rule(ch: char, width: usize) -> String {
    std::iter::repeat(ch).take(width).collect()
}

/// Units across all snapshots whose move-in key contains `marker`.
pub fn target_count(properties: &[PropertySnapshot], marker: &str) -> u32 {
    properties
        .iter()
        .flat_map(|p| p.move_in_breakdown.iter())
        .filter(|(key, _)| key.contains(marker))
        .map(|(_, count)| *count)
        .sum()
}

/// Breakdown lines grouped as target month, immediate or negotiable, then
/// dated. Each group keeps key order.
pub fn format_breakdown(breakdown: &MoveInBreakdown, marker: &str) -> Vec<String> {
    if breakdown.is_empty() {
        return vec!["データなし".to_string()];
    }

    let mut target = Vec::new();
    let mut flexible = Vec::new();
    let mut dated = Vec::new();
    for (key, count) in breakdown {
        let line = format!("  * {key}: {count}件");
        if key.contains(marker) {
            target.push(line);
        } else if key == IMMEDIATE_KEY || key == NEGOTIABLE_KEY {
            flexible.push(line);
        } else {
            dated.push(line);
        }
    }

    let mut lines = Vec::new();
    for (heading, group) in [
        (format!("  【{marker}入居 *注目*】"), target),
        ("  【即入居可・相談】".to_string(), flexible),
        ("  【時期指定】".to_string(), dated),
    ] {
        if !group.is_empty() {
            lines.push(heading);
            lines.extend(group);
        }
    }
    lines
}

fn push_properties(lines: &mut Vec<String>, properties: &[PropertySnapshot], marker: &str) {
    for property in properties {
        lines.push(rule('-', 40));
        lines.push(format!("[物件] {}", property.name));
        lines.push(format!("   空室数: {}件", property.count));
        lines.push("   入居時期:".to_string());
        lines.extend(format_breakdown(&property.move_in_breakdown, marker));
        lines.push(format!("   URL: {}", property.url));
        lines.push(String::new());
    }

    let total: u32 = properties.iter().map(|p| p.count).sum();
    lines.push(rule('=', 50));
    lines.push(format!("合計空室数: {total}件"));
    lines.push(rule('=', 50));
    lines.push(String::new());
    lines.extend(FOOTER.iter().map(|s| s.to_string()));
}

fn push_change_list(lines: &mut Vec<String>, changes: &[Change]) {
    let mut groups: Vec<(&str, Vec<&Change>)> = Vec::new();
    for change in changes {
        match groups.iter_mut().find(|(id, _)| *id == change.property_id) {
            Some((_, group)) => group.push(change),
            None => groups.push((change.property_id.as_str(), vec![change])),
        }
    }

    lines.push("変更内容:".to_string());
    lines.push(rule('-', 40));
    for (_, group) in &groups {
        lines.push(format!("[物件] {}", group[0].property_name));
        for change in group {
            if change.highlighted() {
                lines.push(format!("  * {} *注目*", change.message()));
            } else {
                lines.push(format!("  - {}", change.message()));
            }
        }
        lines.push(String::new());
    }
    lines.push(rule('-', 40));
    lines.push(String::new());
}

/// Body of the change notification. The change list is omitted when empty
/// (forced sends).
pub fn render_change_report(entry: &HistoryEntry, changes: &[Change], marker: &str) -> String {
    let mut lines = vec![
        rule('=', 50),
        "SUUMO 物件情報 変更通知".to_string(),
        rule('=', 50),
        format!("検出日時: {} {}", entry.date, entry.time),
        String::new(),
    ];

    if !changes.is_empty() {
        push_change_list(&mut lines, changes);
    }

    let target = target_count(&entry.properties, marker);
    if target > 0 {
        lines.push(rule('*', 25));
        lines.push(format!("{marker}入居: 現在{target}件"));
        lines.push(rule('*', 25));
        lines.push(String::new());
    }

    push_properties(&mut lines, &entry.properties, marker);
    lines.join("\n")
}

/// Snapshot-only body for the daily report.
pub fn render_daily_report(entry: &HistoryEntry, marker: &str) -> String {
    let mut lines = vec![
        rule('=', 50),
        "SUUMO 物件情報 日報".to_string(),
        rule('=', 50),
        format!("取得日時: {} {}", entry.date, entry.time),
        String::new(),
    ];

    let target = target_count(&entry.properties, marker);
    if target > 0 {
        lines.push(rule('*', 25));
        lines.push(format!("{marker}入居: {target}件 あり！"));
        lines.push(rule('*', 25));
        lines.push(String::new());
    }

    push_properties(&mut lines, &entry.properties, marker);
    lines.join("\n")
}

pub fn change_subject(entry: &HistoryEntry, changes: &[Change], marker: &str) -> String {
    let stamp = format!("{} {}", entry.date, entry.time);
    if changes.iter().any(Change::highlighted) {
        return format!("【{marker}入居に変更あり】SUUMO物件情報 {stamp}");
    }
    match target_count(&entry.properties, marker) {
        0 => format!("【物件情報更新】SUUMO {stamp}"),
        n => format!("【物件情報更新】SUUMO {stamp} ({marker}: {n}件)"),
    }
}

pub fn daily_subject(entry: &HistoryEntry, marker: &str) -> String {
    match target_count(&entry.properties, marker) {
        0 => format!("SUUMO物件情報 {}", entry.date),
        n => format!("【{marker}入居{n}件】SUUMO物件情報 {}", entry.date),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{detect_changes, DEFAULT_TARGET_MOVE_IN};
    use chrono::TimeZone;
    use vacwatch_core::{jst, tally_cells, Property};

    fn entry(snapshots: Vec<PropertySnapshot>) -> HistoryEntry {
        HistoryEntry::new(jst().with_ymd_and_hms(2026, 2, 24, 9, 5, 7).unwrap(), snapshots)
    }

    fn grande(count: u32, cells: &[&str]) -> PropertySnapshot {
        let property = Property::from_listing_url("グランデ", "https://suumo.jp/library/to_11/").unwrap();
        PropertySnapshot::succeeded(&property, count, tally_cells(cells.iter().copied()))
    }

    #[test]
    fn breakdown_groups_target_then_flexible_then_dated() {
        let breakdown = tally_cells(["26年4月", "即入居可", "'26年3月下旬", "相談", "'26年3月上旬"]);
        assert_eq!(
            format_breakdown(&breakdown, DEFAULT_TARGET_MOVE_IN),
            vec![
                "  【26年3月入居 *注目*】",
                "  * 26年3月上旬: 1件",
                "  * 26年3月下旬: 1件",
                "  【即入居可・相談】",
                "  * 即入居可: 1件",
                "  * 相談: 1件",
                "  【時期指定】",
                "  * 26年4月: 1件",
            ]
        );
        assert_eq!(format_breakdown(&MoveInBreakdown::new(), DEFAULT_TARGET_MOVE_IN), vec!["データなし"]);
    }

    #[test]
    fn change_report_marks_target_month_changes() {
        let previous = entry(vec![grande(3, &["即入居可", "'26年3月上旬"])]);
        let current = entry(vec![grande(5, &["即入居可", "'26年3月上旬", "'26年3月上旬", "相談"])]);
        let changes = detect_changes(&current, &previous, DEFAULT_TARGET_MOVE_IN);

        let body = render_change_report(&current, &changes, DEFAULT_TARGET_MOVE_IN);
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines[1], "SUUMO 物件情報 変更通知");
        assert_eq!(lines[3], "検出日時: 2026-02-24 09:05:07");
        assert!(lines.contains(&"[物件] グランデ"));
        assert!(lines.contains(&"  - 物件数: 3件 → 5件 (2件増加)"));
        assert!(lines.contains(&"  * 26年3月上旬: 1件 → 2件 (1件増加) *注目*"));
        assert!(lines.contains(&"  - 相談: 0件 → 1件 (1件増加)"));
        assert!(lines.contains(&"26年3月入居: 現在2件"));
        assert!(lines.contains(&"合計空室数: 5件"));
        assert_eq!(lines.last(), Some(&"詳細はWebサイトをご確認ください。"));

        assert_eq!(
            change_subject(&current, &changes, DEFAULT_TARGET_MOVE_IN),
            "【26年3月入居に変更あり】SUUMO物件情報 2026-02-24 09:05:07"
        );
    }

    #[test]
    fn subjects_without_target_changes() {
        let current = entry(vec![grande(2, &["'26年3月中旬"])]);
        assert_eq!(
            change_subject(&current, &[], DEFAULT_TARGET_MOVE_IN),
            "【物件情報更新】SUUMO 2026-02-24 09:05:07 (26年3月: 1件)"
        );
        assert_eq!(daily_subject(&current, DEFAULT_TARGET_MOVE_IN), "【26年3月入居1件】SUUMO物件情報 2026-02-24");

        let quiet = entry(vec![grande(1, &["即入居可"])]);
        assert_eq!(
            change_subject(&quiet, &[], DEFAULT_TARGET_MOVE_IN),
            "【物件情報更新】SUUMO 2026-02-24 09:05:07"
        );
        assert_eq!(daily_subject(&quiet, DEFAULT_TARGET_MOVE_IN), "SUUMO物件情報 2026-02-24");
    }

    #[test]
    fn daily_report_has_banner_and_no_change_list() {
        let current = entry(vec![grande(2, &["'26年3月中旬", "相談"])]);
        let body = render_daily_report(&current, DEFAULT_TARGET_MOVE_IN);
        assert!(body.contains("SUUMO 物件情報 日報"));
        assert!(body.contains("取得日時: 2026-02-24 09:05:07"));
        assert!(body.contains("26年3月入居: 1件 あり！"));
        assert!(!body.contains("変更内容:"));
    }
}
