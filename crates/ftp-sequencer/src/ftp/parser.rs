//! Unix-style LIST line parser.
//!
//! ```text
//! drwxr-xr-x   2 user group  4096 Jan  1 12:00 dirname
//! -rw-r--r--   1 user group  1234 Jan  1  2025 file.txt
//! lrwxrwxrwx   1 user group    42 Jan  1 12:00 link -> target
//! ```
//!
//! Each parsed line becomes a [`StatRecord`]. `Display` on a record writes a
//! canonical line that parses back to an equal record.

use crate::ftp::types::StatRecord;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;

lazy_static! {
    static ref UNIX_LINE: Regex = Regex::new(
        r"(?x)
        ^([dlcbps-])([rwxsStT-]{9})\s+          # type + permissions
        (\d+)\s+                                # link count
        (\S+)\s+                                # owner
        (\S+)\s+                                # group
        (\d+)\s+                                # size
        ([A-Za-z]{3}\s+\d{1,2}\s+(?:\d{1,2}:\d{2}|\d{4}))\s+   # date
        (.+)$                                   # filename (possibly with -> target)
        ",
    )
    .unwrap();
}

/// Parse every line of a LIST payload, skipping lines that are not entries.
pub fn parse_listing(raw: &str) -> Vec<StatRecord> {
    raw.lines()
        .map(str::trim_end)
        .filter(|l| !l.is_empty())
        .filter_map(parse_stat_line)
        .collect()
}

/// Parse one `ls -l` line. Returns `None` for lines like `total 12`.
pub fn parse_stat_line(line: &str) -> Option<StatRecord> {
    let caps = UNIX_LINE.captures(line.trim())?;

    let kind = caps.get(1)?.as_str();
    let perms = caps.get(2)?.as_str();
    let nlink = caps.get(3)?.as_str().parse::<u32>().ok()?;
    let owner = caps.get(4)?.as_str().to_string();
    let group = caps.get(5)?.as_str().to_string();
    let size = caps.get(6)?.as_str().parse::<u64>().ok()?;
    let mtime = parse_unix_date(caps.get(7)?.as_str())?;
    let name_raw = caps.get(8)?.as_str();

    let is_symbolic_link = kind == "l";
    let (filename, link_target) = match name_raw.split_once(" -> ") {
        Some((name, target)) if is_symbolic_link => (name.to_string(), Some(target.to_string())),
        _ => (name_raw.to_string(), None),
    };

    Some(StatRecord {
        is_directory: kind == "d",
        is_symbolic_link,
        is_file: kind == "-",
        permissions: parse_permissions(perms),
        nlink,
        owner,
        group,
        size,
        mtime,
        link_target,
        filename,
    })
}

/// `rwxr-xr-x` → 755. Set-id and sticky letters count as execute when lowercase.
pub fn parse_permissions(perms: &str) -> u16 {
    perms
        .as_bytes()
        .chunks(3)
        .fold(0u16, |acc, triplet| {
            let digit = triplet.iter().fold(0u16, |d, &c| {
                d + match c {
                    b'r' => 4,
                    b'w' => 2,
                    b'x' | b's' | b't' => 1,
                    _ => 0,
                }
            });
            acc * 10 + digit
        })
}

/// Inverse of [`parse_permissions`]: 755 → `rwxr-xr-x`.
pub fn format_permissions(permissions: u16) -> String {
    let digits = [permissions / 100 % 10, permissions / 10 % 10, permissions % 10];
    let mut out = String::with_capacity(9);
    for d in digits {
        out.push(if d & 4 != 0 { 'r' } else { '-' });
        out.push(if d & 2 != 0 { 'w' } else { '-' });
        out.push(if d & 1 != 0 { 'x' } else { '-' });
    }
    out
}

/// "Jan  1 12:00" (most recent such day) or "Jan  1  2025" (midnight), as epoch ms.
fn parse_unix_date(s: &str) -> Option<i64> {
    parse_unix_date_at(s, Utc::now())
}

/// The year-less form names the latest matching moment that is not more
/// than a day after `now`; a Feb 29 walks back to the last leap year.
fn parse_unix_date_at(s: &str, now: DateTime<Utc>) -> Option<i64> {
    let normalised = s.split_whitespace().collect::<Vec<_>>().join(" ");

    if normalised.contains(':') {
        let latest = now + Duration::days(1);
        return (now.year() - 8..=now.year())
            .rev()
            .filter_map(|year| {
                NaiveDateTime::parse_from_str(&format!("{} {}", year, normalised), "%Y %b %d %H:%M").ok()
            })
            .map(|dt| Utc.from_utc_datetime(&dt))
            .find(|dt| *dt <= latest)
            .map(|dt| dt.timestamp_millis());
    }

    let date = NaiveDate::parse_from_str(&normalised, "%b %d %Y").ok()?;
    let dt = date.and_hms_opt(0, 0, 0)?;
    Some(Utc.from_utc_datetime(&dt).timestamp_millis())
}

impl fmt::Display for StatRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_directory {
            'd'
        } else if self.is_symbolic_link {
            'l'
        } else if self.is_file {
            '-'
        } else {
            // special files all parse to the same flags
            'p'
        };

        let mtime = Utc
            .timestamp_millis_opt(self.mtime)
            .single()
            .unwrap_or_default();
        // year-less only when it reads back as the same moment
        let recent = mtime.format("%b %e %H:%M").to_string();
        let date = if parse_unix_date(&recent) == Some(self.mtime) {
            recent
        } else {
            mtime.format("%b %e  %Y").to_string()
        };

        write!(
            f,
            "{}{} {:>3} {} {} {:>8} {} {}",
            kind,
            format_permissions(self.permissions),
            self.nlink,
            self.owner,
            self.group,
            self.size,
            date,
            self.filename
        )?;
        if let Some(target) = &self.link_target {
            write!(f, " -> {}", target)?;
        }
        Ok(())
    }
}
