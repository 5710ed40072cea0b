use url::Url;

use crate::config::ConnectOptions;
use crate::error::SignalError;

pub const QUERY_TOKEN: &str = "access_token";
pub const QUERY_PROTOCOL: &str = "protocol";
pub const QUERY_RECONNECT: &str = "reconnect";
pub const QUERY_PARTICIPANT_SID: &str = "sid";
pub const QUERY_AUTO_SUBSCRIBE: &str = "auto_subscribe";
pub const QUERY_ADAPTIVE_STREAM: &str = "adaptive_stream";
pub const QUERY_SDK: &str = "sdk";
pub const QUERY_VERSION: &str = "version";
pub const QUERY_OS: &str = "os";

/// Normalizes any supported scheme to the websocket one.
pub fn to_websocket_url(url: &Url) -> Result<Url, SignalError> {
    let mut out = url.clone();
    let scheme = match url.scheme() {
        "ws" | "wss" => return Ok(out),
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(SignalError::InvalidUrl(format!(
                "unsupported scheme '{other}'"
            )));
        }
    };
    out.set_scheme(scheme)
        .map_err(|_| SignalError::InvalidUrl(url.to_string()))?;
    Ok(out)
}

/// Normalizes any supported scheme to the http one, for the validation
/// probe and the region settings endpoint.
pub fn to_http_url(url: &Url) -> Result<Url, SignalError> {
    let mut out = url.clone();
    let scheme = match url.scheme() {
        "http" | "https" => return Ok(out),
        "ws" => "http",
        "wss" => "https",
        other => {
            return Err(SignalError::InvalidUrl(format!(
                "unsupported scheme '{other}'"
            )));
        }
    };
    out.set_scheme(scheme)
        .map_err(|_| SignalError::InvalidUrl(url.to_string()))?;
    Ok(out)
}

/// Builds the full connect URI: websocket scheme, `/rtc` path, and the
/// handshake parameters as query pairs.
pub fn build_connect_url(
    base: &Url,
    token: &str,
    options: &ConnectOptions,
    reconnect: bool,
    participant_sid: Option<&str>,
) -> Result<Url, SignalError> {
    let mut url = to_websocket_url(base)?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| SignalError::InvalidUrl(base.to_string()))?;
        segments.pop_if_empty().push("rtc");
    }
    {
        let mut query = url.query_pairs_mut();
        query.append_pair(QUERY_TOKEN, token);
        query.append_pair(QUERY_PROTOCOL, &options.protocol_version.to_string());
        if reconnect {
            query.append_pair(QUERY_RECONNECT, "1");
            if let Some(sid) = participant_sid {
                query.append_pair(QUERY_PARTICIPANT_SID, sid);
            }
        }
        query.append_pair(
            QUERY_AUTO_SUBSCRIBE,
            if options.auto_subscribe { "1" } else { "0" },
        );
        query.append_pair(
            QUERY_ADAPTIVE_STREAM,
            if options.adaptive_stream { "1" } else { "0" },
        );
        query.append_pair(QUERY_SDK, &options.client_info.sdk);
        query.append_pair(QUERY_VERSION, &options.client_info.version);
        query.append_pair(QUERY_OS, &options.client_info.os);
    }
    Ok(url)
}

/// Derives the validation probe endpoint from a connect URI, preserving the
/// query so the server can evaluate the same handshake.
pub fn build_validate_url(connect_url: &Url) -> Result<Url, SignalError> {
    let mut url = to_http_url(connect_url)?;
    url.set_path("/rtc/validate");
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn query_map(url: &Url) -> HashMap<String, String> {
        url.query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    #[test]
    fn connect_url_carries_all_handshake_params() {
        let base = Url::parse("wss://rooms.example.wavelink.cloud").unwrap();
        let options = ConnectOptions::default().with_adaptive_stream(true);
        let url = build_connect_url(&base, "tok-123", &options, false, None).unwrap();

        assert_eq!(url.path(), "/rtc");
        let params = query_map(&url);
        assert_eq!(params[QUERY_TOKEN], "tok-123");
        assert_eq!(params[QUERY_PROTOCOL], options.protocol_version.to_string());
        assert_eq!(params[QUERY_AUTO_SUBSCRIBE], "1");
        assert_eq!(params[QUERY_ADAPTIVE_STREAM], "1");
        assert_eq!(params[QUERY_SDK], "rust");
        assert_eq!(params[QUERY_VERSION], env!("CARGO_PKG_VERSION"));
        assert!(!params.contains_key(QUERY_RECONNECT));
    }

    #[test]
    fn reconnect_url_adds_resume_params() {
        let base = Url::parse("https://rooms.example.wavelink.cloud").unwrap();
        let options = ConnectOptions::default();
        let url = build_connect_url(&base, "tok", &options, true, Some("PA_9")).unwrap();

        assert_eq!(url.scheme(), "wss");
        let params = query_map(&url);
        assert_eq!(params[QUERY_RECONNECT], "1");
        assert_eq!(params[QUERY_PARTICIPANT_SID], "PA_9");
    }

    #[test]
    fn validate_url_keeps_query_and_switches_scheme() {
        let base = Url::parse("ws://127.0.0.1:7880").unwrap();
        let options = ConnectOptions::default();
        let connect = build_connect_url(&base, "tok", &options, false, None).unwrap();
        let validate = build_validate_url(&connect).unwrap();

        assert_eq!(validate.scheme(), "http");
        assert_eq!(validate.path(), "/rtc/validate");
        assert_eq!(validate.query(), connect.query());
    }
}
