mod cli;

use chrono::DateTime;
use chrono_tz::America::Los_Angeles;
use clap::Parser;
use cli::{Cli, Commands, FlairCommands, WikiCommands};
use futures::StreamExt;
use log::{error, info};
use rapi::client::{ClientError, GetOptions, ListingOptions, Payload, PostOptions, RedditClient};
use rapi::config::AppConfig;
use rapi::models::{RawThing, Submission};
use rapi::operations::{feeds, flair, wiki};
use serde_json::Value;

/// Render epoch seconds in Pacific time, the way posts are listed on the site.
fn format_timestamp(created_utc: f64) -> String {
    DateTime::from_timestamp(created_utc as i64, 0)
        .map(|ts| ts.with_timezone(&Los_Angeles).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "????-??-?? ??:??:??".to_string())
}

fn thing_line(thing: &RawThing) -> String {
    let data = &thing.data;
    let text = |key: &str| data.get(key).and_then(Value::as_str).unwrap_or_default().to_string();
    let created = data.get("created_utc").and_then(Value::as_f64).unwrap_or_default();
    let summary = match data.get("title").and_then(Value::as_str) {
        Some(title) => title.to_string(),
        None => text("body").lines().next().unwrap_or_default().to_string(),
    };
    format!(
        "[{}] {} {} by {}",
        format_timestamp(created),
        text("name"),
        summary,
        text("author")
    )
}

fn print_json(value: &impl serde::Serialize) -> Result<(), ClientError> {
    let pretty = serde_json::to_string_pretty(value)
        .map_err(|e| ClientError::Protocol(format!("cannot render response: {}", e)))?;
    println!("{}", pretty);
    Ok(())
}

fn print_payload(payload: Payload) -> Result<(), ClientError> {
    match payload {
        Payload::Json(value) => print_json(&value),
        Payload::Text(text) => {
            println!("{}", text);
            Ok(())
        }
        Payload::Raw(bytes) => {
            info!("Received {} bytes of non-JSON data", bytes.len());
            Ok(())
        }
    }
}

async fn run(client: RedditClient, command: Commands) -> Result<(), ClientError> {
    match command {
        Commands::Get { path, params, oauth } => {
            info!("GET {}", path);
            print_payload(client.get(&path, GetOptions { params, oauth }).await?)
        }
        Commands::Post { path, params, oauth } => {
            info!("POST {}", path);
            let options = PostOptions {
                oauth,
                ..PostOptions::default()
            };
            print_payload(client.post(&path, params, options).await?)
        }
        Commands::Listing {
            path: Some(path),
            limit,
            params,
            oauth,
            json,
            ..
        } => {
            let options = ListingOptions::new(params).oauth(oauth).limit(limit);
            let mut items = client.listing::<RawThing>(&path, options);
            while let Some(item) = items.next().await {
                let item = item?;
                if json {
                    print_json(&item)?;
                } else {
                    println!("{}", thing_line(&item));
                }
            }
            Ok(())
        }
        Commands::Listing {
            path: None,
            subreddit,
            sort,
            limit,
            params,
            json,
            ..
        } => {
            let mut posts = feeds::feed(&client, subreddit.as_deref(), sort, params, limit);
            while let Some(post) = posts.next().await {
                let post: Submission = post?;
                if json {
                    print_json(&post)?;
                } else {
                    println!(
                        "[{}] {}",
                        format_timestamp(post.data.created_utc),
                        post.data.format_short_summary()
                    );
                }
            }
            Ok(())
        }
        Commands::Gql { operation, hash, variables } => {
            let variables: Value = serde_json::from_str(&variables)
                .map_err(|e| ClientError::Config(format!("--variables is not JSON: {}", e)))?;
            print_json(&client.gql(&operation, &hash, variables).await?)
        }
        Commands::Info { fullnames } => {
            for thing in feeds::info(&client, &fullnames).await? {
                println!("{}", thing_line(&thing));
            }
            Ok(())
        }
        Commands::Wiki { command } => run_wiki(&client, command).await,
        Commands::Flair { command } => run_flair(&client, command).await,
    }
}

async fn run_wiki(client: &RedditClient, command: WikiCommands) -> Result<(), ClientError> {
    match command {
        WikiCommands::Page { subreddit, page, revision } => {
            let page = wiki::page(client, &subreddit, &page, revision.as_deref()).await?;
            println!("{}", page.content_md);
            Ok(())
        }
        WikiCommands::Settings { subreddit, page } => {
            print_json(&wiki::settings(client, &subreddit, &page).await?)
        }
        WikiCommands::Edit { subreddit, page, file, reason } => {
            let content = std::fs::read_to_string(&file).map_err(|e| {
                ClientError::Config(format!("cannot read {}: {}", file.display(), e))
            })?;
            let edit = wiki::WikiEdit { page, content, reason };
            print_payload(wiki::edit(client, &subreddit, &edit).await?)
        }
        WikiCommands::Permissions { subreddit, page, level, listed } => {
            print_payload(wiki::edit_permissions(client, &subreddit, &page, level, listed).await?)
        }
    }
}

async fn run_flair(client: &RedditClient, command: FlairCommands) -> Result<(), ClientError> {
    match command {
        FlairCommands::Set { subreddit, user, link, text, css_class } => {
            let payload = flair::SetFlair { link, name: user, text, css_class };
            print_payload(flair::set(client, &subreddit, &payload).await?)
        }
        FlairCommands::Delete { subreddit, user } => {
            print_payload(flair::delete_user(client, &subreddit, &user).await?)
        }
        FlairCommands::ClearTemplates { subreddit, flair_type } => {
            print_payload(flair::clear_templates(client, &subreddit, flair_type).await?)
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = AppConfig::load();

    let client = match config.create_client() {
        Ok(client) => client,
        Err(err) => {
            error!("Failed to create Reddit client: {}", err);
            std::process::exit(1);
        }
    };

    if let Err(err) = run(client, cli.command).await {
        error!("{}", err);
        std::process::exit(1);
    }
}
