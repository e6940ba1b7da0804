/*
 * Cvassist - personal CV assistant backend
 * Copyright (C) 2025–2026 Pedro Monteiro <pedro@cvassist.dev>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Contact intake: best-effort parsing of free-text "contact me" messages
//! into structured fields, plus the append-only Postgres store behind the
//! admin listing.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

const COMPANY_START: &str = "Company:";
const COMPANY_END: &str = ", Contact:";
const CONTACT_START: &str = "Contact:";
const CONTACT_END: &str = ", Message:";
const MESSAGE_START: &str = "Message:";

/// The input could not be decomposed into the required fields. Carries a
/// human-readable reason; no record is created.
#[derive(thiserror::Error, Debug)]
#[error("{reason}. Expected format: 'Company: <company>, Contact: <name>, Message: <text>'")]
pub struct ParseRejection {
    pub reason: String,
}

#[derive(Debug, PartialEq, Eq)]
pub struct NewContactMessage {
    pub company: String,
    pub contact: String,
    pub message: String,
}

/// Byte offset of `needle` in `haystack`, ASCII case-insensitive. The
/// markers are pure ASCII, so a byte-window comparison is offset-safe on
/// any UTF-8 input.
fn find_ignore_ascii_case(haystack: &str, needle: &str) -> Option<usize> {
    let h = haystack.as_bytes();
    let n = needle.as_bytes();
    if n.is_empty() || n.len() > h.len() {
        return None;
    }
    h.windows(n.len()).position(|w| w.eq_ignore_ascii_case(n))
}

/// Substring strictly between `start` and `end`, empty when either marker
/// is missing or `end` occurs at or before `start`.
fn extract_between<'a>(text: &'a str, start: &str, end: &str) -> &'a str {
    let Some(s) = find_ignore_ascii_case(text, start) else {
        return "";
    };
    let Some(e) = find_ignore_ascii_case(text, end) else {
        return "";
    };
    if e <= s {
        return "";
    }
    &text[s + start.len()..e]
}

/// Substring after `start` to the end of the input, empty when the marker
/// is missing.
fn extract_after<'a>(text: &'a str, start: &str) -> &'a str {
    match find_ignore_ascii_case(text, start) {
        Some(s) => &text[s + start.len()..],
        None => "",
    }
}

/// Parse one free-text contact message.
///
/// # Errors
///
/// Returns [`ParseRejection`] naming the fields that came out empty.
pub fn parse_contact(input: &str) -> Result<NewContactMessage, ParseRejection> {
    let company = extract_between(input, COMPANY_START, COMPANY_END).trim();
    let contact = extract_between(input, CONTACT_START, CONTACT_END).trim();
    let message = extract_after(input, MESSAGE_START).trim();

    let mut missing = Vec::new();
    if company.is_empty() {
        missing.push("Company");
    }
    if contact.is_empty() {
        missing.push("Contact");
    }
    if message.is_empty() {
        missing.push("Message");
    }

    if !missing.is_empty() {
        return Err(ParseRejection {
            reason: format!("could not extract: {}", missing.join(", ")),
        });
    }

    Ok(NewContactMessage {
        company: company.to_string(),
        contact: contact.to_string(),
        message: message.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct StoredMessage {
    pub id: i32,
    pub company: String,
    pub contact: String,
    pub message: String,
    pub date: DateTime<Utc>,
}

/// Idempotent schema bootstrap, run once at startup.
pub async fn ensure_schema(pg: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS contact_messages (
             id      SERIAL PRIMARY KEY,
             company TEXT NOT NULL,
             contact TEXT NOT NULL,
             message TEXT NOT NULL,
             date    TIMESTAMPTZ NOT NULL
         )",
    )
    .execute(pg)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS contact_messages_date_idx ON contact_messages (date DESC)")
        .execute(pg)
        .await?;

    Ok(())
}

/// Insert a parsed message with a UTC-now timestamp; returns the assigned id.
pub async fn insert_message(pg: &PgPool, new: &NewContactMessage) -> Result<i32, sqlx::Error> {
    let id: i32 = sqlx::query_scalar(
        "INSERT INTO contact_messages (company, contact, message, date)
         VALUES ($1, $2, $3, $4) RETURNING id",
    )
    .bind(&new.company)
    .bind(&new.contact)
    .bind(&new.message)
    .bind(Utc::now())
    .fetch_one(pg)
    .await?;

    Ok(id)
}

/// All stored messages, newest first. Unbounded by design; volume is a
/// handful of rows.
pub async fn list_messages(pg: &PgPool) -> Result<Vec<StoredMessage>, sqlx::Error> {
    let rows = sqlx::query_as::<_, (i32, String, String, String, DateTime<Utc>)>(
        "SELECT id, company, contact, message, date
         FROM contact_messages ORDER BY date DESC",
    )
    .fetch_all(pg)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(id, company, contact, message, date)| StoredMessage {
            id,
            company,
            contact,
            message,
            date,
        })
        .collect())
}

/// Fixed admin-facing timestamp rendering, always UTC.
#[must_use]
pub fn format_timestamp(date: DateTime<Utc>) -> String {
    date.format("%Y-%m-%d %H:%M:%S").to_string()
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_well_formed() {
        let parsed =
            parse_contact("Company: TechCorp, Contact: Jane Doe, Message: Hello there").unwrap();
        assert_eq!(parsed.company, "TechCorp");
        assert_eq!(parsed.contact, "Jane Doe");
        assert_eq!(parsed.message, "Hello there");
    }

    #[test]
    fn test_parse_with_leading_prose() {
        let parsed = parse_contact(
            "Send a message to Company: Acme, Contact: Bob, Message: Call me back",
        )
        .unwrap();
        assert_eq!(parsed.company, "Acme");
        assert_eq!(parsed.contact, "Bob");
        assert_eq!(parsed.message, "Call me back");
    }

    #[test]
    fn test_parse_markers_case_insensitive() {
        let parsed = parse_contact("company: A, contact: B, message: C").unwrap();
        assert_eq!(parsed.company, "A");
        assert_eq!(parsed.contact, "B");
        assert_eq!(parsed.message, "C");
    }

    #[test]
    fn test_parse_trims_whitespace() {
        let parsed = parse_contact("Company:   A  , Contact:  B , Message:   C  ").unwrap();
        assert_eq!(parsed.company, "A");
        assert_eq!(parsed.contact, "B");
        assert_eq!(parsed.message, "C");
    }

    #[test]
    fn test_parse_missing_message_marker_rejected() {
        let err = parse_contact("Company: A, Contact: B").unwrap_err();
        assert!(err.reason.contains("Message"));
        assert!(err.to_string().contains("Expected format"));
    }

    #[test]
    fn test_parse_whitespace_field_rejected() {
        let err = parse_contact("Company: A, Contact:   , Message: C").unwrap_err();
        assert!(err.reason.contains("Contact"));
    }

    #[test]
    fn test_parse_end_marker_before_start_yields_empty_field() {
        // ", Contact:" appears before "Company:", so company must be empty.
        let err = parse_contact(", Contact: B, Message: C Company: A").unwrap_err();
        assert!(err.reason.contains("Company"));
    }

    #[test]
    fn test_parse_non_ascii_input_is_offset_safe() {
        let parsed =
            parse_contact("Company: Olá Lda, Contact: João, Message: Até já ☕").unwrap();
        assert_eq!(parsed.company, "Olá Lda");
        assert_eq!(parsed.contact, "João");
        assert_eq!(parsed.message, "Até já ☕");
    }

    #[test]
    fn test_find_ignore_ascii_case_returns_byte_offset() {
        assert_eq!(find_ignore_ascii_case("xxCOMPANY:yy", "Company:"), Some(2));
        assert_eq!(find_ignore_ascii_case("short", "Company:"), None);
    }

    #[test]
    fn test_format_timestamp_fixed_format() {
        let date = Utc.with_ymd_and_hms(2026, 1, 5, 9, 30, 7).unwrap();
        assert_eq!(format_timestamp(date), "2026-01-05 09:30:07");
    }
}
