//! Query string and form body parameters.

use serde::Serialize;
use serde_json::Value;
use url::Url;

use crate::client::error::ClientError;

/// Ordered `(name, value)` pairs, as sent on the wire.
pub type Params = Vec<(String, String)>;

/// Encode one value the way Reddit's form endpoints expect it.
///
/// Booleans become `1`/`0`, arrays are joined with `,`, objects are sent as
/// JSON. `None` means the parameter should be left out (null or empty string).
pub fn form_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(items) => Some(
            items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(","),
        ),
        Value::Object(_) => Some(value.to_string()),
    }
}

/// Flatten a serializable struct or map into parameters, sorted by name.
pub fn to_params<T: Serialize + ?Sized>(value: &T) -> Result<Params, ClientError> {
    let value = serde_json::to_value(value)
        .map_err(|e| ClientError::Config(format!("cannot encode parameters: {}", e)))?;

    match value {
        Value::Object(map) => {
            let mut params: Params = map
                .into_iter()
                .filter_map(|(key, value)| form_value(&value).map(|v| (key, v)))
                .collect();
            params.sort_by(|a, b| a.0.cmp(&b.0));
            Ok(params)
        }
        Value::Null => Ok(Params::new()),
        other => Err(ClientError::Config(format!(
            "parameters must be an object, got {}",
            other
        ))),
    }
}

/// Build parameters from literal pairs.
pub fn params<K, V, I>(pairs: I) -> Params
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Set `name` to `value`, replacing an existing entry.
pub fn set_param(params: &mut Params, name: &str, value: impl Into<String>) {
    let value = value.into();
    match params.iter_mut().find(|(key, _)| key == name) {
        Some(entry) => entry.1 = value,
        None => params.push((name.to_string(), value)),
    }
}

pub fn get_param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

/// Set a query parameter on `url`, replacing every existing occurrence.
pub fn set_query(url: &mut Url, name: &str, value: &str) {
    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != name)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let mut pairs = url.query_pairs_mut();
    pairs.clear();
    for (k, v) in &retained {
        pairs.append_pair(k, v);
    }
    pairs.append_pair(name, value);
}

pub fn get_query(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

/// `application/x-www-form-urlencoded` body.
pub fn encode_form(params: &[(String, String)]) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params)
        .finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize)]
    struct Flair<'a> {
        name: Option<&'a str>,
        text: &'a str,
        css_class: &'a str,
        sticky: bool,
        ids: Vec<&'a str>,
    }

    #[test]
    fn test_form_values() {
        assert_eq!(form_value(&json!(true)).as_deref(), Some("1"));
        assert_eq!(form_value(&json!(false)).as_deref(), Some("0"));
        assert_eq!(form_value(&json!(["t3_a", "t3_b"])).as_deref(), Some("t3_a,t3_b"));
        assert_eq!(form_value(&json!({"a": 1})).as_deref(), Some("{\"a\":1}"));
        assert_eq!(form_value(&json!(25)).as_deref(), Some("25"));
        assert_eq!(form_value(&json!("")), None);
        assert_eq!(form_value(&json!(null)), None);
    }

    #[test]
    fn test_struct_to_params_skips_empty() {
        let flair = Flair {
            name: None,
            text: "mod",
            css_class: "",
            sticky: false,
            ids: vec!["a", "b"],
        };
        assert_eq!(
            to_params(&flair).unwrap(),
            params([("ids", "a,b"), ("sticky", "0"), ("text", "mod")])
        );
        assert!(to_params(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_set_query_replaces() {
        let mut url =
            Url::parse("https://www.reddit.com/r/a/new.json?limit=100&after=t3_x").unwrap();
        set_query(&mut url, "limit", "5");
        set_query(&mut url, "count", "200");
        assert_eq!(get_query(&url, "limit").as_deref(), Some("5"));
        assert_eq!(get_query(&url, "after").as_deref(), Some("t3_x"));
        assert_eq!(url.query_pairs().filter(|(k, _)| k == "limit").count(), 1);
    }

    #[test]
    fn test_encode_form() {
        let body = encode_form(&params([("text", "a b&c"), ("api_type", "json")]));
        assert_eq!(body, "text=a+b%26c&api_type=json");
    }
}
