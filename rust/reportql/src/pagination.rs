//! Page windows, opaque cursors, and the lazy exact-total optimizer.

use crate::error::{Result, ServiceError};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::future::Future;

#[derive(Debug, Serialize, Deserialize)]
struct CursorPayload {
    offset: i64,
}

pub fn decode_cursor(cursor: &str) -> Result<i64> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| ServiceError::validation("invalid cursor"))?;
    let payload: CursorPayload = serde_json::from_slice(&bytes)
        .map_err(|_| ServiceError::validation("invalid cursor payload"))?;
    Ok(payload.offset.max(0))
}

pub fn encode_cursor(offset: i64) -> String {
    let payload = CursorPayload {
        offset: offset.max(0),
    };
    URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).unwrap_or_default())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWindow {
    pub offset: i64,
    pub limit: i64,
}

impl PageWindow {
    /// A cursor wins over a zero-based page number.
    pub fn resolve(
        page: Option<i64>,
        page_size: Option<i64>,
        cursor: Option<&str>,
        default_size: i64,
        max_size: i64,
    ) -> Result<Self> {
        let limit = page_size.unwrap_or(default_size).clamp(1, max_size.max(1));
        let offset = match cursor {
            Some(cursor) => decode_cursor(cursor)?,
            None => page.unwrap_or(0).max(0).saturating_mul(limit),
        };
        Ok(Self { offset, limit })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub records: Vec<T>,
    pub total: i64,
    pub offset: i64,
    pub limit: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_cursor: Option<String>,
}

/// Runs the page query and only issues `count` when the page came back full.
pub async fn paginate<T, P, PF, C, CF>(window: PageWindow, fetch_page: P, count: C) -> Result<Page<T>>
where
    P: FnOnce(PageWindow) -> PF,
    PF: Future<Output = Result<Vec<T>>>,
    C: FnOnce() -> CF,
    CF: Future<Output = Result<i64>>,
{
    let records = fetch_page(window).await?;
    let returned = records.len() as i64;
    let total = if returned < window.limit {
        window.offset.saturating_add(returned)
    } else {
        count().await?
    };

    let next_offset = window.offset.saturating_add(window.limit);
    let next_cursor = (returned >= window.limit && next_offset < total)
        .then(|| encode_cursor(next_offset));
    let prev_cursor =
        (window.offset > 0).then(|| encode_cursor(window.offset.saturating_sub(window.limit)));

    Ok(Page {
        records,
        total,
        offset: window.offset,
        limit: window.limit,
        next_cursor,
        prev_cursor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn cursor_round_trips_and_rejects_garbage() {
        assert_eq!(decode_cursor(&encode_cursor(150)).unwrap(), 150);
        assert!(matches!(
            decode_cursor("%%%"),
            Err(ServiceError::Validation(_))
        ));
    }

    #[test]
    fn window_clamps_page_size_and_prefers_cursor() {
        let window = PageWindow::resolve(Some(2), Some(5000), None, 50, 1000).unwrap();
        assert_eq!(window, PageWindow { offset: 2000, limit: 1000 });

        let cursor = encode_cursor(40);
        let window = PageWindow::resolve(Some(9), Some(20), Some(&cursor), 50, 1000).unwrap();
        assert_eq!(window, PageWindow { offset: 40, limit: 20 });
    }

    #[tokio::test]
    async fn short_page_skips_the_count_query() {
        let counts = AtomicUsize::new(0);
        let window = PageWindow {
            offset: 20,
            limit: 10,
        };
        let page = paginate(
            window,
            |_| async { Ok(vec![1, 2, 3]) },
            || async {
                counts.fetch_add(1, Ordering::SeqCst);
                Ok(999)
            },
        )
        .await
        .unwrap();

        assert_eq!(page.total, 23);
        assert_eq!(counts.load(Ordering::SeqCst), 0);
        assert!(page.next_cursor.is_none());
        assert_eq!(decode_cursor(page.prev_cursor.as_deref().unwrap()).unwrap(), 10);
    }

    #[tokio::test]
    async fn full_page_asks_for_the_exact_total() {
        let counts = AtomicUsize::new(0);
        let window = PageWindow {
            offset: 0,
            limit: 2,
        };
        let page = paginate(
            window,
            |w| async move { Ok(vec![w.offset; w.limit as usize]) },
            || async {
                counts.fetch_add(1, Ordering::SeqCst);
                Ok(5)
            },
        )
        .await
        .unwrap();

        assert_eq!(page.total, 5);
        assert_eq!(counts.load(Ordering::SeqCst), 1);
        assert_eq!(decode_cursor(page.next_cursor.as_deref().unwrap()).unwrap(), 2);
        assert!(page.prev_cursor.is_none());
    }

    #[tokio::test]
    async fn full_last_page_has_no_next_cursor() {
        let page = paginate(
            PageWindow {
                offset: 3,
                limit: 3,
            },
            |_| async { Ok(vec!["a", "b", "c"]) },
            || async { Ok(6) },
        )
        .await
        .unwrap();
        assert_eq!(page.total, 6);
        assert!(page.next_cursor.is_none());
    }

    #[tokio::test]
    async fn short_page_at_the_largest_offset_saturates_the_total() {
        let page = paginate(
            PageWindow {
                offset: i64::MAX,
                limit: 10,
            },
            |_| async { Ok(vec!["a", "b"]) },
            || async { Ok(0) },
        )
        .await
        .unwrap();
        assert_eq!(page.total, i64::MAX);
        assert!(page.next_cursor.is_none());
    }
}
