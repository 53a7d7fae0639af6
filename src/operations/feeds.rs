use futures::stream::BoxStream;
use log::{debug, info};

use crate::client::params::params;
use crate::client::{ClientError, GetOptions, ListingOptions, Params, RedditClient};
use crate::models::{ListingData, ListingSort, RawThing, Submission, Thing};

/// Largest number of fullnames `/api/info` resolves per request.
pub const INFO_BATCH_SIZE: usize = 100;

/// Path of a subreddit feed, or of the front page when no subreddit is given.
pub fn feed_path(subreddit: Option<&str>, sort: Option<ListingSort>) -> String {
    let mut path = match subreddit {
        Some(subreddit) => format!("/r/{}", subreddit.trim_start_matches("r/")),
        None => String::new(),
    };
    if let Some(sort) = sort {
        path.push('/');
        path.push_str(sort.as_str());
    }
    if path.is_empty() {
        path.push('/');
    }
    path
}

/// Posts of a subreddit feed, or of the front page.
pub fn feed(
    client: &RedditClient,
    subreddit: Option<&str>,
    sort: Option<ListingSort>,
    params: Params,
    limit: Option<usize>,
) -> BoxStream<'static, Result<Submission, ClientError>> {
    let path = feed_path(subreddit, sort);
    info!("Streaming feed {}", path);
    client.listing(&path, ListingOptions::new(params).limit(limit))
}

/// Crossposts of `article` (an id without the `t3_` prefix).
pub fn crossposts(
    client: &RedditClient,
    article: &str,
    params: Params,
    limit: Option<usize>,
) -> BoxStream<'static, Result<Submission, ClientError>> {
    let article = article.trim_start_matches("t3_");
    client.listing(
        &format!("/duplicates/{}.json", article),
        ListingOptions::new(params).limit(limit),
    )
}

/// Resolve fullnames to things, in batches of [`INFO_BATCH_SIZE`].
pub async fn info(
    client: &RedditClient,
    fullnames: &[String],
) -> Result<Vec<RawThing>, ClientError> {
    let mut things = Vec::with_capacity(fullnames.len());

    for batch in fullnames.chunks(INFO_BATCH_SIZE) {
        debug!("Resolving {} fullnames via /api/info", batch.len());
        let payload = client
            .get(
                "/api/info.json",
                GetOptions {
                    params: params([("id", batch.join(","))]),
                    oauth: false,
                },
            )
            .await?;

        let listing: Thing<ListingData<RawThing>> = serde_json::from_value(payload.into_json()?)
            .map_err(|e| ClientError::Protocol(format!("malformed /api/info response: {}", e)))?;
        things.extend(listing.data.children);
    }

    Ok(things)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::{json_response, ScriptedTransport};
    use crate::client::params::get_query;
    use crate::client::ClientConfig;
    use futures::TryStreamExt;
    use serde_json::json;
    use std::sync::Arc;

    fn client(transport: Arc<ScriptedTransport>) -> RedditClient {
        RedditClient::builder(ClientConfig::default())
            .transport(transport)
            .build()
            .unwrap()
    }

    fn listing(names: &[String]) -> serde_json::Value {
        let children: Vec<_> = names
            .iter()
            .map(|n| json!({"kind": "t3", "data": {"name": n}}))
            .collect();
        json!({
            "kind": "Listing",
            "data": {
                "after": null,
                "before": null,
                "children": children,
            }
        })
    }

    #[test]
    fn test_feed_path() {
        assert_eq!(feed_path(None, None), "/");
        assert_eq!(feed_path(None, Some(ListingSort::Top)), "/top");
        assert_eq!(feed_path(Some("rust"), None), "/r/rust");
        assert_eq!(feed_path(Some("r/rust"), Some(ListingSort::New)), "/r/rust/new");
    }

    #[tokio::test]
    async fn test_feed_requests_sorted_subreddit() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(json_response(
            200,
            json!({"kind": "Listing", "data": {"after": null, "children": [
                {"kind": "t3", "data": {"id": "a", "name": "t3_a", "title": "Hello"}}
            ]}}),
        ));

        let client = client(transport.clone());
        let sort = Some(ListingSort::New);
        let posts: Vec<Submission> = feed(&client, Some("rust"), sort, Params::new(), Some(10))
            .try_collect()
            .await
            .unwrap();

        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].data.title, "Hello");
        let requests = transport.requests();
        assert_eq!(requests[0].url.path(), "/r/rust/new.json");
        assert_eq!(get_query(&requests[0].url, "limit").as_deref(), Some("10"));
    }

    #[tokio::test]
    async fn test_crossposts_reads_second_listing() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(json_response(
            200,
            json!([
                {"kind": "Listing", "data": {"children": [
                    {"kind": "t3", "data": {"id": "orig", "name": "t3_orig"}}
                ]}},
                {"kind": "Listing", "data": {"after": null, "children": [
                    {"kind": "t3", "data": {"id": "x", "name": "t3_x"}}
                ]}}
            ]),
        ));

        let client = client(transport.clone());
        let posts: Vec<Submission> = crossposts(&client, "t3_orig", Params::new(), None)
            .try_collect()
            .await
            .unwrap();

        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].data.name, "t3_x");
        assert_eq!(transport.requests()[0].url.path(), "/duplicates/orig.json");
    }

    #[tokio::test]
    async fn test_info_batches_by_hundred() {
        let fullnames: Vec<String> = (0..150).map(|i| format!("t3_{}", i)).collect();
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(json_response(200, listing(&fullnames[..100])));
        transport.push(json_response(200, listing(&fullnames[100..])));

        let things = info(&client(transport.clone()), &fullnames).await.unwrap();

        assert_eq!(things.len(), 150);
        assert_eq!(things[149].data["name"], "t3_149");
        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        let ids = get_query(&requests[1].url, "id").unwrap();
        assert_eq!(ids.split(',').count(), 50);
        assert!(ids.starts_with("t3_100,"));
    }
}
