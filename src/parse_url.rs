use url::Url;

use crate::errors::{LauncherError, Result};

/// Custom scheme this handler is registered for.
pub const SCHEME: &str = "ds9";

/// A validated launch request. Immutable once produced.
#[derive(Clone, Debug)]
pub struct LaunchRequest {
    pub frame_ids: Vec<String>,
    pub frame_url: Url,
    pub token: String,
    pub raw: Url,
}

/// Validates an incoming scheme URL. Checks run in a fixed order and the
/// first violated rule wins, so the reported message is deterministic.
pub fn parse(url: &str) -> Result<LaunchRequest> {
    if !url.starts_with(&format!("{}://", SCHEME)) {
        return Err(LauncherError::Validation(format!(
            "Must start with `{}://`.",
            SCHEME
        )));
    }

    let parsed = Url::parse(url)
        .map_err(|err| LauncherError::Validation(format!("Unable to parse URL: {}.", err)))?;

    let frame_id_params: Vec<String> = parsed
        .query_pairs()
        .filter(|(key, _)| key == "frame_ids")
        .map(|(_, value)| value.into_owned())
        .collect();

    if frame_id_params.is_empty() {
        return Err(LauncherError::Validation(
            "Must specify `frame_ids` query parameter.".to_string(),
        ));
    }

    // Repeated parameters are merged, each value split on commas, empties dropped.
    let frame_ids: Vec<String> = frame_id_params
        .iter()
        .flat_map(|value| value.split(','))
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect();

    if frame_ids.is_empty() {
        return Err(LauncherError::Validation(
            "Must specify at least 1 frame id.".to_string(),
        ));
    }

    // Last value wins when `frame_url` repeats.
    let frame_url_param = parsed
        .query_pairs()
        .filter(|(key, _)| key == "frame_url")
        .map(|(_, value)| value.into_owned())
        .last();

    let Some(frame_url_param) = frame_url_param else {
        return Err(LauncherError::Validation(
            "Must specify `frame_url` query parameter.".to_string(),
        ));
    };

    let frame_url = Url::parse(&frame_url_param)
        .map_err(|err| LauncherError::Validation(format!("Unable to parse `frame_url`: {}.", err)))?;

    if frame_url.scheme() != "http" && frame_url.scheme() != "https" {
        return Err(LauncherError::Validation(format!(
            "`frame_url` must be a http(s) URL, not `{}`.",
            frame_url.scheme()
        )));
    }

    let token = parsed
        .query_pairs()
        .filter(|(key, _)| key == "token")
        .map(|(_, value)| value.into_owned())
        .last()
        .unwrap_or_default();

    if token.is_empty() {
        return Err(LauncherError::Validation(
            "Must specify a non-empty `token` query parameter.".to_string(),
        ));
    }

    Ok(LaunchRequest {
        frame_ids,
        frame_url,
        token,
        raw: parsed,
    })
}

/// Redacts the access token from a URL for display and logging. Falls back to
/// a plain substring scrub when the input does not even parse, so the token
/// never leaks through malformed inputs either.
pub fn display_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(parsed) => {
            let mut sanitized = parsed.clone();
            let kept: Vec<(String, String)> = parsed
                .query_pairs()
                .filter(|(key, _)| key != "token")
                .map(|(key, value)| (key.into_owned(), value.into_owned()))
                .collect();
            if kept.is_empty() {
                sanitized.set_query(None);
            } else {
                sanitized.query_pairs_mut().clear().extend_pairs(kept);
            }
            sanitized.to_string()
        }
        Err(_) => scrub_token_param(raw),
    }
}

fn scrub_token_param(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = find_token_param(rest) {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        match tail.find('&') {
            Some(amp) => rest = &tail[amp + 1..],
            None => rest = "",
        }
    }
    out.push_str(rest);
    out.trim_end_matches(['?', '&']).to_string()
}

/// Finds `token=` where it starts a query parameter, ignoring parameters whose
/// name merely ends in `token` (`mytoken=` stays untouched).
fn find_token_param(s: &str) -> Option<usize> {
    let mut from = 0;
    while let Some(offset) = s[from..].find("token=") {
        let start = from + offset;
        if start == 0 || matches!(s.as_bytes()[start - 1], b'?' | b'&') {
            return Some(start);
        }
        from = start + 1;
    }
    None
}
