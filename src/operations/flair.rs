use log::info;
use serde::Serialize;

use crate::client::params::{params, to_params};
use crate::client::{ClientError, Payload, PostOptions, RedditClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum FlairType {
    User,
    Link,
}

impl FlairType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlairType::User => "USER_FLAIR",
            FlairType::Link => "LINK_FLAIR",
        }
    }
}

/// Flair to assign to either a user or a submission.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SetFlair {
    /// Fullname of the submission to flair.
    pub link: Option<String>,
    /// Username to flair.
    pub name: Option<String>,
    pub text: Option<String>,
    pub css_class: Option<String>,
}

impl SetFlair {
    pub fn user(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn link(fullname: impl Into<String>) -> Self {
        Self {
            link: Some(fullname.into()),
            ..Self::default()
        }
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn css_class(mut self, css_class: impl Into<String>) -> Self {
        self.css_class = Some(css_class.into());
        self
    }
}

pub async fn clear_templates(
    client: &RedditClient,
    subreddit: &str,
    flair_type: FlairType,
) -> Result<Payload, ClientError> {
    info!("Clearing {} templates on r/{}", flair_type.as_str(), subreddit);
    client
        .post(
            &format!("/r/{}/api/clearflairtemplates.json", subreddit),
            params([("flair_type", flair_type.as_str())]),
            PostOptions::default(),
        )
        .await
}

/// Remove a user's flair on a subreddit.
pub async fn delete_user(
    client: &RedditClient,
    subreddit: &str,
    user: &str,
) -> Result<Payload, ClientError> {
    client
        .post(
            &format!("/r/{}/api/flair/deleteflair.json", subreddit),
            params([("name", user)]),
            PostOptions::default(),
        )
        .await
}

/// Set user or submission flair. Exactly one of `link` and `name` must be given.
pub async fn set(
    client: &RedditClient,
    subreddit: &str,
    flair: &SetFlair,
) -> Result<Payload, ClientError> {
    match (&flair.link, &flair.name) {
        (Some(_), Some(_)) => {
            return Err(ClientError::Config(
                "flair target must be either a link or a user, not both".to_string(),
            ))
        }
        (None, None) => {
            return Err(ClientError::Config(
                "flair target needs a link or a user".to_string(),
            ))
        }
        _ => {}
    }

    client
        .post(
            &format!("/r/{}/api/flair.json", subreddit),
            to_params(flair)?,
            PostOptions::default(),
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{CredentialError, CredentialProvider, IssuedCredential};
    use crate::client::testing::{json_response, ScriptedTransport};
    use crate::client::ClientConfig;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    struct Modhash;

    #[async_trait]
    impl CredentialProvider for Modhash {
        async fn provide(&self) -> Result<Option<IssuedCredential>, CredentialError> {
            Ok(Some(IssuedCredential::new("mh", i64::MAX)))
        }
    }

    fn client(transport: Arc<ScriptedTransport>) -> RedditClient {
        RedditClient::builder(ClientConfig::default())
            .transport(transport)
            .modhash_provider(Arc::new(Modhash))
            .build()
            .unwrap()
    }

    fn body(transport: &ScriptedTransport) -> String {
        let requests = transport.requests();
        String::from_utf8(requests[0].body.clone().unwrap().to_vec()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_user_flair() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(json_response(200, json!({"json": {"errors": []}})));

        set(&client(transport.clone()), "rust", &SetFlair::user("ferris").text("Crab"))
            .await
            .unwrap();

        assert_eq!(transport.requests()[0].url.path(), "/r/rust/api/flair.json");
        assert_eq!(body(&transport), "name=ferris&text=Crab&api_type=json");
    }

    #[tokio::test]
    async fn test_set_needs_exactly_one_target() {
        let transport = Arc::new(ScriptedTransport::new());
        let client = client(transport.clone());

        let both = SetFlair {
            link: Some("t3_a".to_string()),
            name: Some("ferris".to_string()),
            ..SetFlair::default()
        };
        assert!(matches!(set(&client, "rust", &both).await, Err(ClientError::Config(_))));
        let neither = set(&client, "rust", &SetFlair::default()).await;
        assert!(matches!(neither, Err(ClientError::Config(_))));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_user() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(json_response(200, json!({"json": {"errors": []}})));

        delete_user(&client(transport.clone()), "rust", "ferris").await.unwrap();

        assert_eq!(transport.requests()[0].url.path(), "/r/rust/api/flair/deleteflair.json");
        assert_eq!(body(&transport), "name=ferris&api_type=json");
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_templates() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(json_response(200, json!({"json": {"errors": []}})));

        clear_templates(&client(transport.clone()), "rust", FlairType::Link).await.unwrap();

        assert_eq!(transport.requests()[0].url.path(), "/r/rust/api/clearflairtemplates.json");
        assert_eq!(body(&transport), "flair_type=LINK_FLAIR&api_type=json");
    }
}
