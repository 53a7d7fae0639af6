use clap::Parser;
use rapi::models::ListingSort;
use rapi::operations::flair::FlairType;
use rapi::operations::wiki::WikiPermLevel;

#[derive(Parser, Debug)]
#[command(
    name = "rapi",
    version,
    about = "Request engine for Reddit's REST and GraphQL APIs."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Parse a `name=value` pair.
fn parse_param(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected name=value, got {:?}", raw))
}

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// GET an endpoint and print the JSON response.
    Get {
        /// Path such as /r/rust/about, or an absolute URL.
        #[arg(help = "Endpoint path", required = true)]
        path: String,

        /// Query parameters.
        #[arg(
            long = "param",
            short,
            value_parser = parse_param,
            help = "Query parameter as name=value"
        )]
        params: Vec<(String, String)>,

        /// Send to oauth.reddit.com with the bearer token.
        #[arg(long, help = "Use OAuth authentication")]
        oauth: bool,
    },

    /// POST a form to an endpoint. `api_type=json` is always added.
    Post {
        #[arg(help = "Endpoint path", required = true)]
        path: String,

        #[arg(long = "param", short, value_parser = parse_param, help = "Form field as name=value")]
        params: Vec<(String, String)>,

        #[arg(long, help = "Use OAuth authentication")]
        oauth: bool,
    },

    /// Print the items of a listing, one per line.
    /// Without --path, the feed of --subreddit (or the front page) is listed.
    Listing {
        #[arg(long, short, help = "Listing path such as /r/mod/about/modqueue")]
        path: Option<String>,

        #[arg(long, short, help = "Subreddit name (optional)")]
        subreddit: Option<String>,

        #[arg(long, value_enum, help = "Feed sort order")]
        sort: Option<ListingSort>,

        #[arg(long, short, help = "Maximum number of items to retrieve")]
        limit: Option<usize>,

        #[arg(long = "param", value_parser = parse_param, help = "Query parameter as name=value")]
        params: Vec<(String, String)>,

        #[arg(long, help = "Use OAuth authentication")]
        oauth: bool,

        /// Print raw JSON instead of one summary line per item.
        #[arg(long, help = "Print items as JSON")]
        json: bool,
    },

    /// Run a persisted GraphQL query.
    Gql {
        #[arg(help = "Operation name", required = true)]
        operation: String,

        #[arg(help = "sha256 hash of the persisted query", required = true)]
        hash: String,

        #[arg(long, default_value = "{}", help = "Query variables as JSON")]
        variables: String,
    },

    /// Resolve fullnames (t3_abc, t1_def, ...) via /api/info.
    Info {
        #[arg(help = "Fullnames", required = true, num_args = 1..)]
        fullnames: Vec<String>,
    },

    /// Subreddit wiki management.
    Wiki {
        #[command(subcommand)]
        command: WikiCommands,
    },

    /// Subreddit flair management.
    Flair {
        #[command(subcommand)]
        command: FlairCommands,
    },
}

#[derive(clap::Subcommand, Debug)]
pub enum WikiCommands {
    /// Print a wiki page's markdown.
    Page {
        subreddit: String,
        page: String,
        #[arg(long, help = "Revision id")]
        revision: Option<String>,
    },

    /// Print a wiki page's settings.
    Settings { subreddit: String, page: String },

    /// Replace a wiki page's content.
    Edit {
        subreddit: String,
        page: String,
        /// File holding the new markdown.
        #[arg(long, required = true)]
        file: std::path::PathBuf,
        /// Shown in the page history, at most 256 characters.
        #[arg(long, default_value = "")]
        reason: String,
    },

    /// Change who may edit a wiki page.
    Permissions {
        subreddit: String,
        page: String,
        #[arg(long, value_enum, required = true)]
        level: WikiPermLevel,
        #[arg(long, help = "List the page on the wiki index")]
        listed: bool,
    },
}

#[derive(clap::Subcommand, Debug)]
pub enum FlairCommands {
    /// Set flair on a user or a submission.
    Set {
        subreddit: String,
        #[arg(long, conflicts_with = "link", required_unless_present = "link")]
        user: Option<String>,
        /// Fullname of the submission.
        #[arg(long)]
        link: Option<String>,
        #[arg(long)]
        text: Option<String>,
        #[arg(long)]
        css_class: Option<String>,
    },

    /// Remove a user's flair.
    Delete { subreddit: String, user: String },

    /// Delete every flair template of one type.
    ClearTemplates {
        subreddit: String,
        #[arg(long = "type", value_enum, default_value = "user")]
        flair_type: FlairType,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_param() {
        assert_eq!(parse_param("sort=new"), Ok(("sort".to_string(), "new".to_string())));
        assert_eq!(parse_param("q=a=b"), Ok(("q".to_string(), "a=b".to_string())));
        assert!(parse_param("sort").is_err());
    }

    #[test]
    fn test_cli_parses_listing() {
        let args = ["rapi", "listing", "-s", "rust", "--sort", "new", "-l", "5"];
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.command {
            Commands::Listing { subreddit, sort, limit, .. } => {
                assert_eq!(subreddit.as_deref(), Some("rust"));
                assert_eq!(sort, Some(ListingSort::New));
                assert_eq!(limit, Some(5));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_flair_set_needs_a_target() {
        assert!(Cli::try_parse_from(["rapi", "flair", "set", "rust"]).is_err());
        let both = ["rapi", "flair", "set", "rust", "--user", "a", "--link", "t3_b"];
        assert!(Cli::try_parse_from(both).is_err());
    }
}
