use log::info;
use serde::Serialize;

use crate::client::params::{params, to_params};
use crate::client::{ClientError, GetOptions, Params, Payload, PostOptions, RedditClient};
use crate::models::{Thing, WikiPage, WikiSettings};

/// Longest edit reason Reddit keeps in the page history.
pub const MAX_REASON_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum WikiPermLevel {
    /// Defer to the subreddit's wiki settings.
    UseSubredditPerm,
    ApprovedContributors,
    Moderators,
}

impl WikiPermLevel {
    pub fn as_u8(&self) -> u8 {
        match self {
            WikiPermLevel::UseSubredditPerm => 0,
            WikiPermLevel::ApprovedContributors => 1,
            WikiPermLevel::Moderators => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WikiEdit {
    /// Existing page, or a new page to create.
    pub page: String,
    /// Markdown source.
    pub content: String,
    pub reason: String,
}

#[derive(Serialize)]
struct PermissionsForm<'a> {
    page: &'a str,
    permlevel: u8,
    listed: bool,
}

async fn get_thing<T: serde::de::DeserializeOwned>(
    client: &RedditClient,
    path: &str,
    params: Params,
) -> Result<T, ClientError> {
    let payload = client.get(path, GetOptions { params, oauth: false }).await?;
    let thing: Thing<T> = serde_json::from_value(payload.into_json()?)
        .map_err(|e| ClientError::Protocol(format!("malformed response from {}: {}", path, e)))?;
    Ok(thing.data)
}

/// Current content of a wiki page. `revision` selects an older version.
pub async fn page(
    client: &RedditClient,
    subreddit: &str,
    page: &str,
    revision: Option<&str>,
) -> Result<WikiPage, ClientError> {
    let query = match revision {
        Some(v) => params([("v", v)]),
        None => Params::new(),
    };
    get_thing(client, &format!("/r/{}/wiki/{}.json", subreddit, page), query).await
}

pub async fn settings(
    client: &RedditClient,
    subreddit: &str,
    page: &str,
) -> Result<WikiSettings, ClientError> {
    let path = format!("/r/{}/wiki/settings/{}.json", subreddit, page);
    get_thing(client, &path, Params::new()).await
}

/// Replace the content of a page, creating it if needed.
pub async fn edit(
    client: &RedditClient,
    subreddit: &str,
    edit: &WikiEdit,
) -> Result<Payload, ClientError> {
    if edit.reason.chars().count() > MAX_REASON_LEN {
        return Err(ClientError::Config(format!(
            "wiki edit reason is longer than {} characters",
            MAX_REASON_LEN
        )));
    }

    info!("Editing wiki page {} on r/{}", edit.page, subreddit);
    client
        .post(
            &format!("/r/{}/api/wiki/edit.json", subreddit),
            to_params(edit)?,
            PostOptions::default(),
        )
        .await
}

pub async fn edit_permissions(
    client: &RedditClient,
    subreddit: &str,
    page: &str,
    permlevel: WikiPermLevel,
    listed: bool,
) -> Result<Payload, ClientError> {
    let form = PermissionsForm {
        page,
        permlevel: permlevel.as_u8(),
        listed,
    };
    client
        .post(
            &format!("/r/{}/wiki/settings/{}.json", subreddit, page),
            to_params(&form)?,
            PostOptions::default(),
        )
        .await
}
