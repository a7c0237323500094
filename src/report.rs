//! Human-readable report rendering for terminal output.
//!
//! Produces a colored summary of an ingestion run (line classification,
//! grouping, enrichment tags, top addresses) and a listing of stored entries
//! returned by a query.
use colored::*;

use crate::pipeline::RunSummary;
use crate::store::StoredEntry;

fn visible_len(s: &str) -> usize {
    // Strip ANSI escape sequences (\x1b[ ... m) to compute printable width
    let mut len = 0;
    let mut iter = s.chars().peekable();
    while let Some(ch) = iter.next() {
        if ch == '\u{1b}' {
            if let Some('[') = iter.peek().cloned() {
                let _ = iter.next();
            }
            for c in iter.by_ref() {
                if c == 'm' {
                    break;
                }
            }
        } else {
            len += 1;
        }
    }
    len
}

fn section_header(title: &str) -> String {
    let len = visible_len(title);
    let mut s = String::new();
    s.push('\n');
    s.push_str(title);
    s.push('\n');
    s.push_str(&"─".repeat(len));
    s.push_str("\n\n");
    s
}

fn push_section(out: &mut String, title: ColoredString, lines: Vec<String>) {
    out.push_str(&section_header(&title.to_string()));
    for line in lines {
        out.push_str(&line);
        out.push('\n');
    }
}

fn or_dash(v: Option<&str>) -> String {
    v.map_or_else(|| "-".dimmed().to_string(), str::to_string)
}

pub fn render_run_summary(summary: &RunSummary) -> String {
    let mut out = String::new();
    let name = if summary.file_name.is_empty() {
        "(unnamed input)"
    } else {
        summary.file_name.as_str()
    };
    out.push_str(&format!(
        "{} {}\n",
        "Leakscope: Ingestion Results for".bold().cyan(),
        name.bold()
    ));

    let c = &summary.classify;
    push_section(
        &mut out,
        "Line Classification".bold().yellow(),
        vec![
            format!("Lines Read: {}", c.lines_total),
            format!("Accepted: {}", c.accepted),
            format!("Rejected: {}", c.rejected()),
            format!("  Consecutive Colons: {}", c.consecutive_colons),
            format!("  Unknown Protocol: {}", c.unknown_protocol),
            format!("  Too Many Colons: {}", c.too_many_colons),
            format!("  Embedded IPv4: {}", c.embedded_ipv4),
        ],
    );

    let d = &summary.dispatch;
    let mut enrich_lines = vec![
        format!("Addresses Seen: {}", summary.addresses_seen),
        format!("Addresses Enriched: {}", d.groups_enriched),
        format!("Batches: {}", d.batches),
        format!("Records Stored: {}", d.records_stored),
    ];
    if d.tag_counts.is_empty() {
        enrich_lines.push("(No addresses above threshold)".to_string());
    } else {
        enrich_lines.push("Tags".bold().blue().to_string());
        for (tag, count) in &d.tag_counts {
            enrich_lines.push(format!("  {}: {}", tag, count));
        }
    }
    push_section(&mut out, "Enrichment".bold().cyan(), enrich_lines);

    let top_lines = if summary.top_addresses.is_empty() {
        vec!["(No addresses above threshold)".to_string()]
    } else {
        summary
            .top_addresses
            .iter()
            .map(|(address, n)| format!("  {}: {}", address, n))
            .collect()
    };
    push_section(&mut out, "Top Addresses".bold().magenta(), top_lines);

    out
}

/// Listing of one page of query results out of `total` matches.
pub fn render_entries(entries: &[StoredEntry], total: u64) -> String {
    let mut out = String::new();
    let mut lines = vec![format!("Showing {} of {} entries", entries.len(), total)];
    for e in entries {
        let r = &e.record;
        lines.push(format!(
            "{} {} {}:{}",
            format!("#{}", e.id).bold(),
            r.address.green(),
            r.username,
            r.password.red()
        ));
        lines.push(format!(
            "  ip: {}  port: {}  path: {}  title: {}",
            or_dash(r.ip_address.as_deref()),
            r.port.map_or_else(|| "-".dimmed().to_string(), |p| p.to_string()),
            or_dash(r.url_path.as_deref()),
            or_dash(r.title.as_deref()),
        ));
        lines.push(format!(
            "  tags: {}  source: {}:{}",
            r.tags.join(","),
            r.file_name,
            r.line_number
        ));
    }
    push_section(&mut out, "Stored Entries".bold().cyan(), lines);
    out
}
