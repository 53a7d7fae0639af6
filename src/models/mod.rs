use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// `{kind, data}` wrapper used for every Reddit object ("thing").
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Thing<D> {
    pub kind: String,
    pub data: D,
}

/// Top-level listing envelope: `{kind: "Listing", data: {...}}`
pub type Listing<T> = Thing<ListingData<T>>;

/// One page of a cursor-paginated listing
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ListingData<T> {
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default)]
    pub before: Option<String>,
    #[serde(default)]
    pub dist: Option<i64>,
    #[serde(default)]
    pub modhash: Option<String>,
    pub children: Vec<T>,
}

/// Any listing child, with its fields left untyped.
pub type RawThing = Thing<Map>;
pub type Map = serde_json::Map<String, Value>;

/// Post data as returned by subreddit feeds and `/api/info`
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct PostData {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub subreddit: String,
    #[serde(default)]
    pub subreddit_name_prefixed: String,
    #[serde(default)]
    pub permalink: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub created_utc: f64,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub num_comments: i64,
    #[serde(default)]
    pub over_18: bool,
    #[serde(default)]
    pub link_flair_text: Option<String>,

    // Everything else stays available untyped
    #[serde(flatten)]
    pub additional_fields: HashMap<String, Value>,
}

pub type Submission = Thing<PostData>;

impl PostData {
    /// Get a short summary for the post (title, author, score)
    pub fn format_short_summary(&self) -> String {
        format!(
            "[{} | {} pts] {} - by u/{}",
            self.subreddit_name_prefixed, self.score, self.title, self.author
        )
    }
}

/// Sort orders accepted by subreddit feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ListingSort {
    Hot,
    New,
    Top,
    Rising,
    Controversial,
    Best,
}

impl ListingSort {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingSort::Hot => "hot",
            ListingSort::New => "new",
            ListingSort::Top => "top",
            ListingSort::Rising => "rising",
            ListingSort::Controversial => "controversial",
            ListingSort::Best => "best",
        }
    }
}

impl fmt::Display for ListingSort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wiki page as returned by `/r/{sub}/wiki/{page}.json`
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct WikiPage {
    #[serde(default)]
    pub content_md: String,
    #[serde(default)]
    pub may_revise: bool,
    #[serde(default)]
    pub revision_date: Option<f64>,
    #[serde(default)]
    pub revision_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,

    #[serde(flatten)]
    pub additional_fields: HashMap<String, Value>,
}

/// Wiki page settings as returned by `/r/{sub}/wiki/settings/{page}.json`
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct WikiSettings {
    #[serde(default)]
    pub permlevel: i64,
    #[serde(default)]
    pub listed: bool,
    #[serde(default)]
    pub editors: Vec<Value>,

    #[serde(flatten)]
    pub additional_fields: HashMap<String, Value>,
}
