//! Turns raw HTTP responses into payloads or [`RedditApiError`]s.
//!
//! Reddit reports errors in three shapes: the legacy `{error, message, reason}`
//! object, the `{json: {errors: [[code, message, field]]}}` envelope of
//! `api_type=json` form posts, and GraphQL `{errors: [...]}` arrays. Bodies are
//! decoded against these shapes in a fixed order by [`decode_envelope`].

use bytes::Bytes;
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::client::error::{ClientError, ErrorCode, RedditApiError, RedditError};
use crate::client::transport::HttpResponse;

/// Rate limit wait time embedded in a `RATELIMIT` message.
static RATELIMIT_WAIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,3}) (milliseconds?|seconds?|minutes?)").expect("valid regex"));

/// `"<status> : <text>"` GraphQL error messages.
static GRAPHQL_STATUS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{3}) : (.+)$").expect("valid regex"));

pub const GRAPHQL_ERROR: &str = "GRAPHQL_ERROR";
pub const GRAPHQL_SYNTAX_ERROR: &str = "GRAPHQL_SYNTAX_ERROR";
pub const RATELIMIT: &str = "RATELIMIT";
/// Code given to `json.errors` entries that carry no code of their own.
pub const UNKNOWN_ERROR: &str = "UNKNOWN";

/// Human readable explanations for `reason` codes of failed GETs.
const REASONS: &[(&str, &str)] = &[
    ("gold_only", "that subreddit needs an active reddit premium subscription"),
    ("banned", "that subreddit was banned"),
    ("private", "that subreddit is private"),
    ("quarantined", "that subreddit is quarantined and requires you to opt-in"),
    (
        "gated",
        "that subreddit contains content pertaining to drug use and abuse, \
         and requires you to opt-in",
    ),
    ("PAGE_NOT_CREATED", "that page has not been created yet"),
    ("MAY_NOT_VIEW", "you're not allowed to view that page"),
];

/// Successful result of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    /// Body of a non-JSON resource, untouched.
    Raw(Bytes),
    /// A POST answer that was text but not JSON.
    Text(String),
}

impl Payload {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_json(self) -> Result<Value, ClientError> {
        match self {
            Payload::Json(value) => Ok(value),
            Payload::Raw(bytes) => Err(ClientError::Protocol(format!(
                "expected JSON, got {} bytes of binary data",
                bytes.len()
            ))),
            Payload::Text(text) => Err(ClientError::Protocol(format!(
                "expected JSON, got text: {}",
                text
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ApiTypeJson {
    pub json: ApiTypeJsonBody,
}

#[derive(Debug, Deserialize)]
pub struct ApiTypeJsonBody {
    #[serde(default)]
    pub errors: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
pub struct GraphQlErrors {
    pub errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
pub struct GraphQlError {
    #[serde(default)]
    pub message: Value,
    #[serde(default)]
    pub path: Option<Vec<Value>>,
}

/// The `{error, message, reason, explanation}` shape. Every field is optional.
#[derive(Debug, Default, Deserialize)]
pub struct LegacyError {
    #[serde(default)]
    pub error: Value,
    #[serde(default)]
    pub message: Value,
    #[serde(default)]
    pub reason: Value,
    #[serde(default)]
    pub explanation: Value,
    #[serde(default)]
    pub quarantine_message: Value,
}

/// A JSON object body, classified by shape.
#[derive(Debug)]
pub enum Envelope {
    ApiTypeJson(ApiTypeJson),
    GraphQl(GraphQlErrors),
    Legacy(LegacyError),
}

/// Classify an object body. Shapes are tried most specific first; any other
/// object is [`Envelope::Legacy`]. Non-objects have no envelope.
pub fn decode_envelope(value: &Value) -> Option<Envelope> {
    if !value.is_object() {
        return None;
    }
    if let Ok(envelope) = ApiTypeJson::deserialize(value) {
        return Some(Envelope::ApiTypeJson(envelope));
    }
    if let Ok(envelope) = GraphQlErrors::deserialize(value) {
        return Some(Envelope::GraphQl(envelope));
    }
    LegacyError::deserialize(value).ok().map(Envelope::Legacy)
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn is_json_or_text(content_type: &str) -> bool {
    content_type.starts_with("application/json") || content_type.starts_with("text/plain")
}

/// `"quarantined"` -> `"Quarantined"`, `"NO_TEXT"` -> `"No text"`.
fn capitalize(reason: &str) -> String {
    let spaced = reason.replace('_', " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

fn reason_explanation(reason: &str) -> Option<&'static str> {
    REASONS
        .iter()
        .find(|(code, _)| *code == reason)
        .map(|(_, explanation)| *explanation)
}

/// Normalize the answer to a GET.
pub fn get_response(response: &HttpResponse, url: &Url) -> Result<Payload, ClientError> {
    if !is_json_or_text(&response.content_type) {
        debug!(
            "Not parsing response data from {} as data is of type {} and not JSON",
            url, response.content_type
        );
        return Ok(Payload::Raw(response.body.clone()));
    }

    let value: Value = serde_json::from_slice(&response.body).map_err(|e| {
        ClientError::Protocol(format!(
            "error parsing JSON response from {}: {}\nResponse data: {}",
            url,
            e,
            response.text()
        ))
    })?;

    if response.is_success() {
        return Ok(Payload::Json(value));
    }

    Err(get_error(response, &value).into())
}

fn get_error(response: &HttpResponse, value: &Value) -> RedditApiError {
    let Some(legacy) = value
        .is_object()
        .then(|| LegacyError::deserialize(value).ok())
        .flatten()
    else {
        return RedditApiError::new(RedditError::new(response.status, response.status_text.clone()));
    };

    let code = ErrorCode::from_json(&legacy.error).unwrap_or(ErrorCode::from(response.status));
    let message = text(&legacy.message).unwrap_or_else(|| response.status_text.clone());
    let mut err = RedditApiError::new(RedditError::new(code, message));

    if let Some(reason) = text(&legacy.reason) {
        let explanation = text(&legacy.explanation)
            .or_else(|| text(&legacy.quarantine_message))
            .or_else(|| reason_explanation(&reason).map(str::to_string))
            .unwrap_or_else(|| capitalize(&reason));
        err.push(RedditError::new(reason, explanation));
    }
    err
}

/// Normalize the answer to an `api_type=json` form POST.
pub fn post_response(
    response: &HttpResponse,
    url: &Url,
    error_parse_max_size: usize,
) -> Result<Payload, ClientError> {
    let content_type = response.content_type.as_str();
    if !(content_type.is_empty() || is_json_or_text(content_type))
        || response.body.len() > error_parse_max_size
    {
        debug!(
            "Not parsing errors of POST to {}: response is {} bytes of {:?} (max {})",
            url,
            response.body.len(),
            content_type,
            error_parse_max_size
        );
        return Ok(Payload::Raw(response.body.clone()));
    }

    let value: Value = match serde_json::from_slice(&response.body) {
        Ok(value) => value,
        Err(e) => {
            let text = response.text();
            if !response.is_success() && text == "Internal Server Error" {
                return Err(RedditApiError::new(RedditError::new(response.status, text)).into());
            }
            warn!(
                "Error parsing POST response data ({}) from {} as JSON: {}",
                content_type, url, e
            );
            return Ok(Payload::Text(text));
        }
    };

    match decode_envelope(&value) {
        Some(Envelope::ApiTypeJson(envelope)) if response.is_success() => {
            let errors = envelope
                .json
                .errors
                .iter()
                .map(|entry| api_type_json_error(entry))
                .collect();
            if let Some(err) = RedditApiError::from_errors(errors) {
                return Err(err.into());
            }
        }
        Some(Envelope::Legacy(legacy)) if !response.is_success() => {
            if let (Some(code), Some(message)) =
                (ErrorCode::from_json(&legacy.error), text(&legacy.message))
            {
                let mut err = RedditApiError::new(RedditError::new(code, message));
                if let (Some(reason), Some(explanation)) =
                    (text(&legacy.reason), text(&legacy.explanation))
                {
                    err.push(RedditError::new(reason, explanation));
                }
                return Err(err.into());
            }
        }
        _ => {}
    }

    Ok(Payload::Json(value))
}

/// One `[code, message, field]` entry. Entries without a usable code are still errors.
fn api_type_json_error(entry: &[Value]) -> RedditError {
    let code = entry
        .first()
        .and_then(ErrorCode::from_json)
        .unwrap_or_else(|| ErrorCode::Name(UNKNOWN_ERROR.to_string()));
    let message = entry.get(1).and_then(text).unwrap_or_default();
    let mut error = RedditError::new(code, message);
    if let Some(field) = entry.get(2).and_then(text) {
        error = error.with_field(field);
    }
    error
}

/// How long to back off for a `RATELIMIT` error, including one extra second.
/// `None` if there is no such error or its message carries no wait time.
pub fn ratelimit_delay(err: &RedditApiError) -> Option<Duration> {
    let error = err.errors().iter().find(|e| e.code == RATELIMIT)?;
    warn!("Got ratelimit: {}", error);

    let captures = RATELIMIT_WAIT.captures(&error.message)?;
    let amount: u64 = captures[1].parse().ok()?;
    let unit = &captures[2];
    let millis = if unit.starts_with("minute") {
        amount * 60_000
    } else if unit.starts_with("millisecond") {
        amount
    } else {
        amount * 1000
    };

    let delay = Duration::from_millis(millis + 1000);
    info!("Sleeping for {}ms due to ratelimit", delay.as_millis());
    Some(delay)
}

/// Normalize the answer to a persisted GraphQL query.
pub fn gql_response(response: &HttpResponse) -> Result<Value, ClientError> {
    let value: Value = match serde_json::from_slice(&response.body) {
        Ok(value) => value,
        Err(e) if response.is_success() => {
            return Err(ClientError::Protocol(format!(
                "error parsing GraphQL response: {}\nResponse data: {}",
                e,
                response.text()
            )));
        }
        Err(_) => {
            let error = RedditError::new(response.status, response.text());
            return Err(RedditApiError::new(error).into());
        }
    };

    if let Some(Envelope::GraphQl(envelope)) = decode_envelope(&value) {
        let mut errors = Vec::with_capacity(envelope.errors.len() + 1);
        if !response.is_success() {
            errors.push(RedditError::new(response.status, response.status_text.clone()));
        }
        errors.extend(envelope.errors.iter().map(graphql_error));
        if let Some(err) = RedditApiError::from_errors(errors) {
            return Err(err.into());
        }
    }

    if !response.is_success() {
        let error = RedditError::new(response.status, response.status_text.clone());
        return Err(RedditApiError::new(error).into());
    }

    Ok(value)
}

fn graphql_error(error: &GraphQlError) -> RedditError {
    let message = match &error.message {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    };

    let mut entry = match GRAPHQL_STATUS.captures(&message) {
        Some(captures) => match captures[1].parse::<i64>() {
            Ok(status) => RedditError::new(status, &captures[2]),
            Err(_) => RedditError::new(GRAPHQL_ERROR, message.clone()),
        },
        None => RedditError::new(GRAPHQL_ERROR, message.clone()),
    };

    if let Some(path) = error.path.as_ref().filter(|path| !path.is_empty()) {
        let field = path
            .iter()
            .map(|segment| match segment {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(".");
        entry = entry.with_field(field);
    }
    entry
}

/// Normalize the answer to a same-origin SVC GraphQL call.
pub fn svc_gql_response(response: &HttpResponse, operation: &str) -> Result<Value, ClientError> {
    match response.status {
        400 => Err(ClientError::Csrf(format!(
            "{} was rejected with HTTP 400, the csrf_token cookie is probably invalid",
            operation
        ))),
        500 => Err(RedditApiError::new(RedditError::new(
            GRAPHQL_SYNTAX_ERROR,
            format!(
                "{} failed with HTTP 500, the variables are probably malformed",
                operation
            ),
        ))
        .into()),
        _ => gql_response(response),
    }
}
