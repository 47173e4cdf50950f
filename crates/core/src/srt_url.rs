//! SRT input URL parsing and serialisation.
//!
//! A channel's `srt_input` is stored as a single string such as
//! `srt://src:4000?mode=listener&latency=200`. Editing a channel splits it
//! into a base URL plus the recognised tuning parameters and serialises it
//! back in a stable order, so that two edits with the same values always
//! produce byte-identical URLs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::form_urlencoded;

use crate::error::CoreError;

const SRT_SCHEME: &str = "srt://";

/// SRT connection mode. `caller` is the protocol default and is therefore
/// never written to the URL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SrtMode {
    #[default]
    Caller,
    Listener,
    Rendezvous,
}

impl SrtMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SrtMode::Caller => "caller",
            SrtMode::Listener => "listener",
            SrtMode::Rendezvous => "rendezvous",
        }
    }
}

impl FromStr for SrtMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "caller" => Ok(SrtMode::Caller),
            "listener" => Ok(SrtMode::Listener),
            "rendezvous" => Ok(SrtMode::Rendezvous),
            other => Err(CoreError::Validation(format!(
                "Invalid SRT mode '{other}'. Must be one of: caller, listener, rendezvous"
            ))),
        }
    }
}

/// Recognised SRT query parameters.
///
/// Parameters the agent does not know about are preserved verbatim in
/// `extra` and written after the known ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrtParams {
    pub passphrase: Option<String>,
    pub mode: SrtMode,
    /// Receiver latency in milliseconds (`latency` and `rcvlatency`).
    pub latency_ms: Option<u32>,
    pub peer_idle_timeout_ms: Option<u32>,
    /// Receive buffer size in bytes.
    pub rcvbuf: Option<u64>,
    /// Send buffer size in bytes.
    pub sndbuf: Option<u64>,
    /// Flow control window in packets.
    pub fc: Option<u32>,
    pub extra: Vec<(String, String)>,
}

/// An SRT URL split into its base (`srt://host:port`) and parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrtUrl {
    pub host: String,
    pub port: u16,
    pub params: SrtParams,
}

impl SrtUrl {
    /// Parse a stored `srt_input` string.
    ///
    /// The host may be empty (`srt://:9000?mode=listener`), the port is
    /// mandatory.
    pub fn parse(input: &str) -> Result<Self, CoreError> {
        let input = input.trim();
        let rest = input.strip_prefix(SRT_SCHEME).ok_or_else(|| {
            CoreError::Validation(format!("SRT input '{input}' must start with {SRT_SCHEME}"))
        })?;

        let (authority, query) = match rest.split_once('?') {
            Some((authority, query)) => (authority, Some(query)),
            None => (rest, None),
        };
        let authority = authority.trim_end_matches('/');

        let (host, port) = authority.rsplit_once(':').ok_or_else(|| {
            CoreError::Validation(format!("SRT input '{input}' is missing a port"))
        })?;
        let port: u16 = port
            .parse()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| CoreError::Validation(format!("Invalid SRT port '{port}'")))?;

        let params = match query {
            Some(query) => parse_params(query)?,
            None => SrtParams::default(),
        };

        Ok(Self {
            host: host.to_string(),
            port,
            params,
        })
    }

    /// `srt://host:port` without any query string.
    pub fn base(&self) -> String {
        format!("{SRT_SCHEME}{}:{}", self.host, self.port)
    }

    /// Same URL with the passphrase masked, for logs and error messages.
    pub fn redacted(&self) -> String {
        let mut copy = self.clone();
        if copy.params.passphrase.is_some() {
            copy.params.passphrase = Some("***".into());
        }
        copy.to_string()
    }
}

impl fmt::Display for SrtUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base())?;
        let pairs = serialize_params(&self.params);
        if !pairs.is_empty() {
            f.write_str("?")?;
            f.write_str(&pairs.join("&"))?;
        }
        Ok(())
    }
}

impl FromStr for SrtUrl {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn parse_params(query: &str) -> Result<SrtParams, CoreError> {
    let mut params = SrtParams::default();
    let mut latency = None;
    let mut rcvlatency = None;

    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "passphrase" => params.passphrase = non_empty(&value),
            "mode" => params.mode = value.parse()?,
            "latency" => latency = Some(parse_number(&key, &value)?),
            "rcvlatency" => rcvlatency = Some(parse_number(&key, &value)?),
            "peeridletimeout" => params.peer_idle_timeout_ms = Some(parse_number(&key, &value)?),
            "rcvbuf" => params.rcvbuf = Some(parse_number(&key, &value)?),
            "sndbuf" => params.sndbuf = Some(parse_number(&key, &value)?),
            "fc" => params.fc = Some(parse_number(&key, &value)?),
            _ => params.extra.push((key.into_owned(), value.into_owned())),
        }
    }

    params.latency_ms = latency.or(rcvlatency);
    Ok(params)
}

fn serialize_params(params: &SrtParams) -> Vec<String> {
    let mut pairs = Vec::new();

    if let Some(passphrase) = &params.passphrase {
        pairs.push(format!("passphrase={}", encode(passphrase)));
    }
    if params.mode != SrtMode::Caller {
        pairs.push(format!("mode={}", params.mode.as_str()));
    }
    if let Some(latency) = params.latency_ms {
        pairs.push(format!("latency={latency}"));
        pairs.push(format!("rcvlatency={latency}"));
    }
    if let Some(timeout) = params.peer_idle_timeout_ms {
        pairs.push(format!("peeridletimeout={timeout}"));
    }
    if let Some(rcvbuf) = params.rcvbuf {
        pairs.push(format!("rcvbuf={rcvbuf}"));
    }
    if let Some(sndbuf) = params.sndbuf {
        pairs.push(format!("sndbuf={sndbuf}"));
    }
    if let Some(fc) = params.fc {
        pairs.push(format!("fc={fc}"));
    }
    for (key, value) in &params.extra {
        pairs.push(format!("{}={}", encode(key), encode(value)));
    }

    pairs
}

fn encode(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T, CoreError> {
    value.trim().parse().map_err(|_| {
        CoreError::Validation(format!("SRT parameter '{key}' must be a number, got '{value}'"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn parses_bare_url() {
        let url = SrtUrl::parse("srt://src:4000").unwrap();
        assert_eq!(url.host, "src");
        assert_eq!(url.port, 4000);
        assert_eq!(url.params, SrtParams::default());
        assert_eq!(url.to_string(), "srt://src:4000");
    }

    #[test]
    fn parses_listener_without_host() {
        let url = SrtUrl::parse("srt://:9000?mode=listener").unwrap();
        assert_eq!(url.host, "");
        assert_eq!(url.params.mode, SrtMode::Listener);
    }

    #[test]
    fn rcvlatency_used_when_latency_missing() {
        let url = SrtUrl::parse("srt://a:1?rcvlatency=250").unwrap();
        assert_eq!(url.params.latency_ms, Some(250));
    }

    #[test]
    fn serialises_in_stable_order() {
        let url = SrtUrl::parse(
            "srt://a:1?fc=25600&sndbuf=2&rcvbuf=1&peeridletimeout=5000&latency=200&mode=listener&passphrase=secret%20pass",
        )
        .unwrap();
        assert_eq!(
            url.to_string(),
            "srt://a:1?passphrase=secret+pass&mode=listener&latency=200&rcvlatency=200\
             &peeridletimeout=5000&rcvbuf=1&sndbuf=2&fc=25600"
        );
    }

    #[test]
    fn caller_mode_is_omitted() {
        let url = SrtUrl::parse("srt://a:1?mode=caller").unwrap();
        assert_eq!(url.to_string(), "srt://a:1");
    }

    #[test]
    fn unknown_parameters_are_kept_after_known_ones() {
        let url = SrtUrl::parse("srt://a:1?streamid=live/feed&latency=120").unwrap();
        assert_eq!(
            url.to_string(),
            "srt://a:1?latency=120&rcvlatency=120&streamid=live%2Ffeed"
        );
    }

    #[test]
    fn serialisation_is_a_fixed_point() {
        let first = SrtUrl::parse("srt://a:1?latency=80&passphrase=x%26y").unwrap().to_string();
        let second = SrtUrl::parse(&first).unwrap().to_string();
        assert_eq!(first, second);
    }

    #[test]
    fn redacts_passphrase() {
        let url = SrtUrl::parse("srt://a:1?passphrase=topsecret").unwrap();
        assert_eq!(url.redacted(), "srt://a:1?passphrase=***");
        assert!(!url.redacted().contains("topsecret"));
    }

    #[test]
    fn rejects_malformed_input() {
        assert_matches!(SrtUrl::parse("udp://a:1"), Err(CoreError::Validation(_)));
        assert_matches!(SrtUrl::parse("srt://nohost"), Err(CoreError::Validation(_)));
        assert_matches!(SrtUrl::parse("srt://a:0"), Err(CoreError::Validation(_)));
        assert_matches!(SrtUrl::parse("srt://a:1?latency=fast"), Err(CoreError::Validation(_)));
        assert_matches!(SrtUrl::parse("srt://a:1?mode=push"), Err(CoreError::Validation(_)));
    }
}
