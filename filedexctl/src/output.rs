//! Plain-text and JSON rendering for command results.

use std::collections::BTreeMap;

use anyhow::Result;
use filedex_core::{Category, FileEvent, FileRecord, IndexChange, IndexStats, SweepReport};
use serde::Serialize;

fn json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn records(records: &[FileRecord], as_json: bool) -> Result<()> {
    if as_json {
        return json(records);
    }
    for record in records {
        println!(
            "{:<8} {:>9}  {}  {}",
            record.category.as_str(),
            human_size(record.size_bytes),
            record.modified_at.format("%Y-%m-%d %H:%M"),
            record.path.display()
        );
    }
    Ok(())
}

pub fn stats(stats: &IndexStats, as_json: bool) -> Result<()> {
    if as_json {
        return json(stats);
    }
    println!("files  {}", stats.total_files);
    println!("size   {}", human_size(stats.total_size_bytes));
    for (category, count) in &stats.counts_by_category {
        println!("  {:<8} {count}", category.label());
    }
    Ok(())
}

pub fn organization(stats: &BTreeMap<Category, u64>, as_json: bool) -> Result<()> {
    if as_json {
        return json(stats);
    }
    for (category, files) in stats {
        println!("{:<10} {files}", category.folder_name());
    }
    Ok(())
}

pub fn events(events: &[FileEvent], as_json: bool) -> Result<()> {
    if as_json {
        return json(events);
    }
    for event in events {
        let at = event.timestamp.format("%Y-%m-%d %H:%M:%S");
        match &event.from_path {
            Some(from) => println!(
                "{at}  {:<8} {} -> {}",
                event.kind.as_str(),
                from.display(),
                event.path.display()
            ),
            None => println!("{at}  {:<8} {}", event.kind.as_str(), event.path.display()),
        }
    }
    Ok(())
}

pub fn sweep_report(report: &SweepReport, as_json: bool) -> Result<()> {
    if as_json {
        return json(report);
    }
    println!(
        "scanned {}, created {}, modified {}, tombstoned {}{}",
        report.scanned,
        report.created,
        report.modified,
        report.tombstoned,
        if report.truncated { " (truncated)" } else { "" }
    );
    Ok(())
}

pub fn change(change: &IndexChange) {
    match &change.from_path {
        Some(from) => println!(
            "{:<8} {} -> {}",
            change.kind.as_str(),
            from.display(),
            change.path.display()
        ),
        None => println!("{:<8} {}", change.kind.as_str(), change.path.display()),
    }
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
