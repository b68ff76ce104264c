//! Message operations: ranged peek FETCH, Message-ID search, APPEND

use async_imap::types::{Fetch, Flag};
use async_imap::Session;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tracing::{debug, warn};

use crate::backend::{normalize_message_id, parse_headers, MessageEnvelope, MessageFlag};
use crate::error::{FerryError, Result};

/// FETCH items for one migrated message: identifiers, flags, timestamp and
/// the raw body, fetched with PEEK so the source stays unmarked.
const FETCH_QUERY: &str = "(UID FLAGS INTERNALDATE BODY.PEEK[])";

/// Collects a FETCH stream tolerantly: logs and skips individual responses
/// that fail to parse. Returns all successfully parsed items.
async fn collect_tolerant<E: std::fmt::Display>(
    stream: impl futures::Stream<Item = std::result::Result<Fetch, E>>,
    context: &str,
) -> Vec<Fetch> {
    futures::pin_mut!(stream);
    let mut items = Vec::new();
    while let Some(result) = stream.next().await {
        match result {
            Ok(fetch) => items.push(fetch),
            Err(e) => {
                warn!("Skipping unparseable IMAP response ({}): {}", context, e);
            }
        }
    }
    items
}

/// Fetch the inclusive sequence range `[start, end]` from the currently
/// examined folder.
pub(super) async fn fetch_batch<S>(
    session: &mut Session<S>,
    path: &str,
    start: u32,
    end: u32,
) -> Result<Vec<MessageEnvelope>>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + std::fmt::Debug + Send,
{
    let range = format!("{}:{}", start, end);
    let fetches = collect_tolerant(
        session
            .fetch(&range, FETCH_QUERY)
            .await
            .map_err(|e| FerryError::Fetch(format!("FETCH {} in {} failed: {}", range, path, e)))?,
        &format!("messages in {}", path),
    )
    .await;

    let mut envelopes: Vec<MessageEnvelope> = fetches.iter().filter_map(parse_message).collect();
    envelopes.sort_by_key(|m| m.seq);

    debug!(
        folder = %path,
        range = %range,
        parsed = envelopes.len(),
        "Fetched message batch"
    );
    Ok(envelopes)
}

/// Whether the currently examined folder holds a message with the given
/// Message-ID header.
pub(super) async fn search_message_id<S>(
    session: &mut Session<S>,
    path: &str,
    message_id: &str,
) -> Result<bool>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + std::fmt::Debug + Send,
{
    let needle = normalize_message_id(message_id).unwrap_or_default();
    // Quotes and backslashes would break the quoted search string.
    let needle: String = needle
        .chars()
        .filter(|c| *c != '"' && *c != '\\')
        .collect();
    let query = format!("HEADER Message-ID \"{}\"", needle);

    let hits = session
        .search(&query)
        .await
        .map_err(|e| FerryError::Search(format!("SEARCH in {} failed: {}", path, e)))?;
    Ok(!hits.is_empty())
}

pub(super) async fn append<S>(
    session: &mut Session<S>,
    path: &str,
    body: &[u8],
    flags: &[MessageFlag],
    internal_date: Option<DateTime<Utc>>,
) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + std::fmt::Debug + Send,
{
    let flag_list = if flags.is_empty() {
        None
    } else {
        Some(format!(
            "({})",
            flags
                .iter()
                .map(|f| f.as_imap())
                .collect::<Vec<_>>()
                .join(" ")
        ))
    };
    let date = internal_date.map(|d| d.format("%d-%b-%Y %H:%M:%S %z").to_string());

    session
        .append(path, flag_list.as_deref(), date.as_deref(), body)
        .await
        .map_err(|e| FerryError::Append(format!("APPEND to {} failed: {}", path, e)))
}

/// Build a transferable envelope from one FETCH response. Responses
/// without a body are unusable for migration and yield None.
fn parse_message(fetch: &Fetch) -> Option<MessageEnvelope> {
    let body = fetch.body()?.to_vec();
    let headers = parse_headers(&body);
    let message_id = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("Message-ID"))
        .and_then(|(_, v)| normalize_message_id(v));

    let flags: Vec<MessageFlag> = fetch.flags().filter_map(|f| convert_flag(&f)).collect();
    let internal_date = fetch.internal_date().map(|d| d.with_timezone(&Utc));

    Some(MessageEnvelope {
        seq: fetch.message,
        uid: fetch.uid,
        headers,
        message_id,
        flags,
        internal_date,
        body,
    })
}

fn convert_flag(flag: &Flag<'_>) -> Option<MessageFlag> {
    match flag {
        Flag::Seen => Some(MessageFlag::Seen),
        Flag::Answered => Some(MessageFlag::Answered),
        Flag::Flagged => Some(MessageFlag::Flagged),
        Flag::Deleted => Some(MessageFlag::Deleted),
        Flag::Draft => Some(MessageFlag::Draft),
        Flag::Recent => Some(MessageFlag::Recent),
        Flag::Custom(s) => Some(MessageFlag::Custom(s.to_string())),
        // MayCreate is a permission marker, not message state
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_headers_preserves_order() {
        let body = b"Message-ID: <a@x>\r\nFrom: a@example.com\r\nSubject: hi\r\n\r\nbody";
        let headers = parse_headers(body);
        assert_eq!(headers[0].0, "Message-ID");
        assert_eq!(headers[0].1, "<a@x>");
        assert_eq!(headers[2].1, "hi");
    }

    #[test]
    fn test_flag_conversion() {
        assert_eq!(convert_flag(&Flag::Seen), Some(MessageFlag::Seen));
        assert_eq!(
            convert_flag(&Flag::Custom("$Label1".into())),
            Some(MessageFlag::Custom("$Label1".to_string()))
        );
        assert_eq!(convert_flag(&Flag::MayCreate), None);
    }
}
