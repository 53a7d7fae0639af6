//! Lazy iteration over cursor-paginated listings.
//!
//! A listing walks forward with `after` unless the initial parameters carry a
//! non-empty `before`, in which case it walks backward towards the newest
//! item. Backward pages are held back until the walk ends and then yielded
//! in reverse fetch order, so either way items come out in listing order.

use async_stream::stream;
use futures::stream::BoxStream;
use log::debug;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::client::error::ClientError;
use crate::client::params::{get_param, set_param, Params};
use crate::client::{GetOptions, RedditClient};
use crate::models::{Listing, ListingData};

/// Largest page Reddit will serve.
pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Default)]
pub struct ListingOptions {
    pub params: Params,
    pub oauth: bool,
    /// Maximum number of items to yield. `None` walks to the end.
    pub limit: Option<usize>,
}

impl ListingOptions {
    pub fn new(params: Params) -> Self {
        Self {
            params,
            ..Self::default()
        }
    }

    pub fn oauth(mut self, oauth: bool) -> Self {
        self.oauth = oauth;
        self
    }

    pub fn limit(mut self, limit: impl Into<Option<usize>>) -> Self {
        self.limit = limit.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    fn cursor_param(self) -> &'static str {
        match self {
            Direction::Forward => "after",
            Direction::Backward => "before",
        }
    }
}

/// Pagination state, independent of any I/O.
#[derive(Debug)]
pub struct ListingCursor<T> {
    direction: Direction,
    cursor: Option<String>,
    remaining: Option<usize>,
    pending_reverse: Vec<Vec<T>>,
    done: bool,
}

impl<T> ListingCursor<T> {
    pub fn new(params: &[(String, String)], limit: Option<usize>) -> Self {
        let before = get_param(params, "before").filter(|before| !before.is_empty());
        let (direction, cursor) = match before {
            Some(before) => (Direction::Backward, Some(before.to_string())),
            None => (
                Direction::Forward,
                get_param(params, "after")
                    .filter(|after| !after.is_empty())
                    .map(str::to_string),
            ),
        };

        Self {
            direction,
            cursor,
            remaining: limit,
            pending_reverse: Vec::new(),
            done: limit == Some(0),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn page_size(&self) -> usize {
        self.remaining.map_or(MAX_PAGE_SIZE, |remaining| remaining.min(MAX_PAGE_SIZE))
    }

    /// Write the parameters for the next page request.
    pub fn apply(&self, params: &mut Params) {
        set_param(params, "limit", self.page_size().to_string());
        // Without count Reddit leaves the before/after cursors out
        set_param(params, "count", "200");
        if let Some(cursor) = &self.cursor {
            set_param(params, self.direction.cursor_param(), cursor.clone());
        }
    }

    /// Account for a fetched page and return the items that can be yielded now.
    pub fn accept(&mut self, page: ListingData<T>) -> Vec<T> {
        let next = match self.direction {
            Direction::Forward => page.after,
            Direction::Backward => page.before,
        }
        .filter(|cursor| !cursor.is_empty());
        let mut children = page.children;

        if let Some(remaining) = self.remaining {
            if children.len() > remaining {
                match self.direction {
                    Direction::Forward => children.truncate(remaining),
                    Direction::Backward => {
                        children.drain(..children.len() - remaining);
                    }
                }
            }
            let remaining = remaining - children.len();
            self.remaining = Some(remaining);
            if remaining == 0 {
                self.done = true;
            }
        }

        if next.is_none() || children.is_empty() {
            self.done = true;
        }
        self.cursor = next;

        match self.direction {
            Direction::Forward => children,
            Direction::Backward => {
                self.pending_reverse.push(children);
                Vec::new()
            }
        }
    }

    /// Backward pages fetched but not yet yielded, and the items they hold.
    pub fn held_back(&self) -> (usize, usize) {
        let items = self.pending_reverse.iter().map(Vec::len).sum();
        (self.pending_reverse.len(), items)
    }

    /// Items still held back once the walk has ended.
    pub fn finish(&mut self) -> Vec<T> {
        self.pending_reverse.drain(..).rev().flatten().collect()
    }
}

/// `/duplicates` answers with `[original, crossposts]`; the listing is the last element.
fn listing_envelope(value: Value) -> Value {
    match value {
        Value::Array(mut items) => items.pop().unwrap_or(Value::Null),
        other => other,
    }
}

fn parse_page<T: DeserializeOwned>(
    path: &str,
    value: Value,
) -> Result<ListingData<T>, ClientError> {
    let value = listing_envelope(value);
    if value.get("kind").and_then(Value::as_str) != Some("Listing") {
        return Err(ClientError::Protocol(format!("{} is not a listing", path)));
    }
    let listing: Listing<T> = serde_json::from_value(value)
        .map_err(|e| ClientError::Protocol(format!("malformed listing from {}: {}", path, e)))?;
    Ok(listing.data)
}

async fn fetch_page<T: DeserializeOwned>(
    client: &RedditClient,
    path: &str,
    params: &Params,
    oauth: bool,
) -> Result<ListingData<T>, ClientError> {
    let payload = client
        .get(
            path,
            GetOptions {
                params: params.clone(),
                oauth,
            },
        )
        .await?;
    parse_page(path, payload.into_json()?)
}

/// Stream the children of the listing at `path`. Pages are fetched one at a
/// time, only as the stream is polled.
pub fn listing_stream<T>(
    client: RedditClient,
    path: String,
    options: ListingOptions,
) -> BoxStream<'static, Result<T, ClientError>>
where
    T: DeserializeOwned + Send + 'static,
{
    Box::pin(stream! {
        let ListingOptions { mut params, oauth, limit } = options;
        let mut cursor = ListingCursor::<T>::new(&params, limit);
        debug!(
            "Fetching listing {} {:?} from {:?} limit={:?}",
            path,
            cursor.direction(),
            cursor.cursor,
            limit
        );

        while !cursor.is_done() {
            cursor.apply(&mut params);
            match fetch_page::<T>(&client, &path, &params, oauth).await {
                Ok(page) => {
                    for item in cursor.accept(page) {
                        yield Ok(item);
                    }
                }
                Err(err) => {
                    let (pages, items) = cursor.held_back();
                    if pages > 0 {
                        debug!(
                            "Listing {} failed, discarding {} buffered pages ({} items)",
                            path, pages, items
                        );
                    }
                    yield Err(err);
                    return;
                }
            }
        }

        for item in cursor.finish() {
            yield Ok(item);
        }
    })
}
