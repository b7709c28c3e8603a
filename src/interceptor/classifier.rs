// SPDX-License-Identifier: Apache-2.0

//! Query Classifier
//!
//! Lexical statement classification. Nothing here parses SQL: a category is
//! picked from the leading keyword and a second statement is detected by a
//! semicolon followed by anything but whitespace. A `;` inside a string
//! literal or comment therefore also counts as a separator, which only ever
//! produces refusals.

use super::types::QueryCategory;

const INSERT_KEYWORDS: &[&str] = &["INSERT", "REPLACE"];
const DDL_KEYWORDS: &[&str] = &["CREATE", "DROP", "ALTER", "TRUNCATE", "RENAME"];

/// Determines the statement category of raw query text.
///
/// Leading whitespace and comments are skipped. A leading `WITH` clause is
/// stepped over so the statement it introduces decides the category; a
/// `WITH ... DELETE` is a DELETE, not a read. A `WITH` clause that cannot be
/// stepped over takes the category of the first write keyword it contains.
pub fn classify(text: &str) -> QueryCategory {
    let body = match statement_body(text) {
        Some(body) => body,
        None => return unparsed_cte_category(text),
    };

    if starts_with_keyword(body, "SELECT") {
        QueryCategory::Select
    } else if starts_with_any(body, INSERT_KEYWORDS) {
        QueryCategory::Insert
    } else if starts_with_keyword(body, "UPDATE") {
        QueryCategory::Update
    } else if starts_with_keyword(body, "DELETE") {
        QueryCategory::Delete
    } else if starts_with_any(body, DDL_KEYWORDS) {
        QueryCategory::Ddl
    } else {
        QueryCategory::Other
    }
}

/// Uppercased first keyword of the statement, past comments and any CTE list.
pub fn leading_keyword(text: &str) -> Option<String> {
    let body = statement_body(text)?;
    let end = body
        .char_indices()
        .find(|(_, c)| !is_word_char(*c))
        .map(|(idx, _)| idx)
        .unwrap_or(body.len());
    if end == 0 {
        return None;
    }
    Some(body[..end].to_ascii_uppercase())
}

/// Text of the main statement, or `None` for a malformed `WITH` clause.
fn statement_body(text: &str) -> Option<&str> {
    let body = skip_leading_comments(text);
    if starts_with_keyword(body, "WITH") {
        skip_cte_list(body)
    } else {
        Some(body)
    }
}

/// True when a semicolon is followed by any non-whitespace character.
///
/// A single trailing semicolon is not a second statement.
pub fn has_multiple_statements(text: &str) -> bool {
    text.match_indices(';')
        .any(|(idx, _)| text[idx + 1..].chars().any(|c| !c.is_whitespace()))
}

fn skip_leading_comments(text: &str) -> &str {
    let mut rest = text.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--").or_else(|| rest.strip_prefix('#')) {
            rest = match after.find('\n') {
                Some(idx) => after[idx + 1..].trim_start(),
                None => "",
            };
        } else if let Some(after) = rest.strip_prefix("/*!") {
            // MySQL executes the body of a versioned comment
            rest = after
                .trim_start_matches(|c: char| c.is_ascii_digit())
                .trim_start();
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = match after.find("*/") {
                Some(idx) => after[idx + 2..].trim_start(),
                None => "",
            };
        } else if let Some(after) = rest.strip_prefix("*/") {
            // Close of a versioned comment
            rest = after.trim_start();
        } else {
            return rest;
        }
    }
}

fn starts_with_keyword(text: &str, keyword: &str) -> bool {
    strip_keyword(text, keyword).is_some()
}

fn starts_with_any(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|keyword| starts_with_keyword(text, keyword))
}

/// Strips `keyword` (case-insensitive, whole word) and following whitespace.
fn strip_keyword<'a>(text: &'a str, keyword: &str) -> Option<&'a str> {
    let head = text.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = &text[keyword.len()..];
    match rest.chars().next() {
        Some(c) if is_word_char(c) => None,
        _ => Some(rest.trim_start()),
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// Steps over `WITH [RECURSIVE] name [(cols)] AS (...) [, ...]`.
///
/// Comments may sit between any two parts. Returns the text of the statement
/// that follows, or `None` when the clause is not shaped like a CTE list.
fn skip_cte_list(text: &str) -> Option<&str> {
    let rest = skip_leading_comments(strip_keyword(text, "WITH")?);
    let mut rest = strip_keyword(rest, "RECURSIVE")
        .map(skip_leading_comments)
        .unwrap_or(rest);

    loop {
        rest = skip_leading_comments(skip_identifier(rest)?);
        if rest.starts_with('(') {
            rest = skip_leading_comments(skip_parenthesized(rest)?);
        }
        rest = skip_leading_comments(strip_keyword(rest, "AS")?);
        if !rest.starts_with('(') {
            return None;
        }
        rest = skip_leading_comments(skip_parenthesized(rest)?);

        match rest.strip_prefix(',') {
            Some(after) => rest = skip_leading_comments(after),
            None => return Some(rest),
        }
    }
}

fn skip_identifier(text: &str) -> Option<&str> {
    if let Some(after) = text.strip_prefix('`') {
        let end = after.find('`')?;
        return Some(after[end + 1..].trim_start());
    }
    let end = text
        .char_indices()
        .find(|(_, c)| !is_word_char(*c))
        .map(|(idx, _)| idx)
        .unwrap_or(text.len());
    if end == 0 {
        return None;
    }
    Some(text[end..].trim_start())
}

/// Skips a balanced `( ... )` group, honouring quoted literals and comments.
fn skip_parenthesized(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'(' => depth += 1,
            b')' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(text[i + 1..].trim_start());
                }
            }
            _ => match skip_inert(text, i) {
                Some(next) => {
                    i = next;
                    continue;
                }
                None if bytes[i] == b'/' && bytes.get(i + 1) == Some(&b'*') => return None,
                None => {}
            },
        }
        i += 1;
    }
    None
}

/// End of the literal or comment starting at byte `i`, or `None` when none
/// starts there. Versioned comment bodies are code, so they are not inert.
fn skip_inert(text: &str, i: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    match bytes[i] {
        quote @ (b'\'' | b'"' | b'`') => {
            let mut j = i + 1;
            while j < bytes.len() && bytes[j] != quote {
                if bytes[j] == b'\\' && quote != b'`' {
                    j += 1;
                }
                j += 1;
            }
            Some((j + 1).min(bytes.len()))
        }
        b'#' => Some(line_end(text, i)),
        b'-' if bytes.get(i + 1) == Some(&b'-') => Some(line_end(text, i)),
        b'/' if bytes.get(i + 1) == Some(&b'*') && bytes.get(i + 2) != Some(&b'!') => {
            text[i + 2..].find("*/").map(|off| i + 2 + off + 2)
        }
        _ => None,
    }
}

fn line_end(text: &str, i: usize) -> usize {
    text[i..].find('\n').map_or(text.len(), |off| i + off + 1)
}

/// First write keyword of an unparsed `WITH` statement, outside literals and
/// comments. Words directly followed by `(` are function calls.
fn unparsed_cte_category(text: &str) -> QueryCategory {
    let bytes = text.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if let Some(next) = skip_inert(text, i) {
            i = next;
            continue;
        }
        let Some(c) = text[i..].chars().next() else { break };
        if !is_word_char(c) {
            i += c.len_utf8();
            continue;
        }

        let len = text[i..]
            .char_indices()
            .find(|(_, c)| !is_word_char(*c))
            .map_or(text.len() - i, |(idx, _)| idx);
        let word = &text[i..i + len];
        i += len;

        if text[i..].trim_start().starts_with('(') {
            continue;
        }
        let category = if INSERT_KEYWORDS.iter().any(|k| word.eq_ignore_ascii_case(k)) {
            QueryCategory::Insert
        } else if word.eq_ignore_ascii_case("UPDATE") {
            QueryCategory::Update
        } else if word.eq_ignore_ascii_case("DELETE") {
            QueryCategory::Delete
        } else {
            continue;
        };
        return category;
    }

    QueryCategory::Other
}
