//! Cursor-based pagination shared by every listing

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::backend::QueueError;

/// One page of a listing. A missing `next_page_token` marks the end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

impl<T> Page<T> {
    pub fn is_last(&self) -> bool {
        self.next_page_token.is_none()
    }
}

/// Opaque cursor: the sequence number of the last item already returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageToken(u64);

impl PageToken {
    pub fn after(seq: u64) -> Self {
        Self(seq)
    }

    pub fn seq(&self) -> u64 {
        self.0
    }

    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(format!("seq:{}", self.0))
    }

    pub fn decode(token: &str) -> Result<Self, QueueError> {
        let invalid = || QueueError::InvalidPageToken(token.to_string());
        let bytes = URL_SAFE_NO_PAD.decode(token).map_err(|_| invalid())?;
        let text = String::from_utf8(bytes).map_err(|_| invalid())?;
        text.strip_prefix("seq:")
            .and_then(|n| n.parse().ok())
            .map(Self)
            .ok_or_else(invalid)
    }
}

/// Normalized paging arguments handed to backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// Only items with a sequence number above this are returned
    pub after: Option<u64>,
    pub limit: usize,
}

impl PageRequest {
    pub fn first(limit: usize) -> Self {
        Self { after: None, limit }
    }

    /// Decode an incoming token and clamp the limit into `[1, max_limit]`.
    pub fn parse(
        page_token: Option<&str>,
        limit: Option<u32>,
        default_limit: u32,
        max_limit: u32,
    ) -> Result<Self, QueueError> {
        let after = page_token
            .filter(|t| !t.is_empty())
            .map(PageToken::decode)
            .transpose()?
            .map(|t| t.seq());
        let limit = limit.unwrap_or(default_limit).clamp(1, max_limit.max(1)) as usize;
        Ok(Self { after, limit })
    }

    /// Build a page from `(seq, item)` pairs already filtered and ordered by
    /// `seq`. Takes up to `limit` of them and emits a token only when more
    /// remain.
    pub fn paginate<T>(&self, ordered: impl IntoIterator<Item = (u64, T)>) -> Page<T> {
        let mut rest = ordered
            .into_iter()
            .filter(|(seq, _)| self.after.map_or(true, |after| *seq > after));

        let mut items = Vec::with_capacity(self.limit.min(64));
        let mut last_seq = None;
        for (seq, item) in rest.by_ref().take(self.limit) {
            last_seq = Some(seq);
            items.push(item);
        }

        let next_page_token = match (last_seq, rest.next()) {
            (Some(seq), Some(_)) => Some(PageToken::after(seq).encode()),
            _ => None,
        };

        Page {
            items,
            next_page_token,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_token_is_opaque_and_decodes() {
        let token = PageToken::after(42).encode();
        assert!(!token.contains("42"));
        assert_eq!(PageToken::decode(&token).unwrap().seq(), 42);
    }

    #[test]
    fn test_malformed_token_rejected() {
        assert!(matches!(
            PageToken::decode("not a token!"),
            Err(QueueError::InvalidPageToken(_))
        ));
        let wrong_payload = URL_SAFE_NO_PAD.encode("hello");
        assert!(PageToken::decode(&wrong_payload).is_err());
    }

    #[test]
    fn test_limit_clamped() {
        let req = PageRequest::parse(None, Some(0), 30, 1000).unwrap();
        assert_eq!(req.limit, 1);
        let req = PageRequest::parse(None, Some(5000), 30, 1000).unwrap();
        assert_eq!(req.limit, 1000);
        let req = PageRequest::parse(Some(""), None, 30, 1000).unwrap();
        assert_eq!(req, PageRequest::first(30));
    }

    #[test]
    fn test_paginate_walks_all_items() {
        let data: Vec<(u64, &str)> = vec![(1, "a"), (3, "b"), (4, "c"), (9, "d"), (10, "e")];

        let first = PageRequest::first(2).paginate(data.clone());
        assert_eq!(first.items, vec!["a", "b"]);
        let token = first.next_page_token.clone().unwrap();

        let second = PageRequest::parse(Some(&token), Some(2), 30, 1000)
            .unwrap()
            .paginate(data.clone());
        assert_eq!(second.items, vec!["c", "d"]);

        let third = PageRequest::parse(second.next_page_token.as_deref(), Some(2), 30, 1000)
            .unwrap()
            .paginate(data);
        assert_eq!(third.items, vec!["e"]);
        assert!(third.is_last());
    }

    #[test]
    fn test_exact_fit_has_no_next_token() {
        let page = PageRequest::first(2).paginate(vec![(1, 'x'), (2, 'y')]);
        assert_eq!(page.items.len(), 2);
        assert!(page.is_last());
    }

    #[test]
    fn test_page_wire_shape() {
        let page = Page {
            items: vec![1, 2],
            next_page_token: None,
        };
        assert_eq!(serde_json::to_value(&page).unwrap(), json!({ "items": [1, 2] }));
    }
}
