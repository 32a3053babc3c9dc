//! Saber Command Protocol
//!
//! Commands are ASCII text written to the request characteristic:
//!
//! ```text
//! get_sabers
//! save_settings:ssid=<s>pass=<s>universe=<s>max_channels=<s>;
//! ```
//!
//! Parameters are concatenated `key=value` pairs in a fixed order with no
//! separator between them and no escaping. A value containing `:`, `=`, `;`
//! or the next key name produces text the controller cannot split back
//! apart; such values are logged but sent unchanged.

use crate::domain::error::CodecError;
use crate::domain::models::{Response, SaberEntry};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

const VERB_DELIMITER: char = ':';
const KEY_VALUE_DELIMITER: char = '=';
const TERMINATOR: char = ';';

const SAVE_SETTINGS_KEYS: &[&str] = &["ssid", "pass", "universe", "max_channels"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// List the sabers known to the controller
    GetSabers,
    /// Store Wi-Fi and Art-Net settings on the controller
    SaveSettings,
}

impl Verb {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GetSabers => "get_sabers",
            Self::SaveSettings => "save_settings",
        }
    }

    /// Parameter keys in wire order.
    pub fn keys(self) -> &'static [&'static str] {
        match self {
            Self::GetSabers => &[],
            Self::SaveSettings => SAVE_SETTINGS_KEYS,
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verb {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "get_sabers" => Ok(Self::GetSabers),
            "save_settings" => Ok(Self::SaveSettings),
            other => Err(CodecError::UnknownVerb(other.to_string())),
        }
    }
}

/// Settings pushed with `save_settings`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WifiSettings {
    pub ssid: String,
    pub pass: String,
    pub universe: String,
    pub max_channels: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    verb: Verb,
    params: Vec<(String, String)>,
}

impl Command {
    /// Build a command, checking the keys against the verb's fixed layout.
    pub fn new(verb: Verb, params: Vec<(String, String)>) -> Result<Self, CodecError> {
        let expected = verb.keys();
        let matches = params.len() == expected.len()
            && params.iter().zip(expected).all(|((k, _), e)| k == *e);
        if !matches {
            return Err(CodecError::ParameterMismatch {
                verb,
                expected: expected.iter().map(|k| k.to_string()).collect(),
                found: params.iter().map(|(k, _)| k.clone()).collect(),
            });
        }
        Ok(Self { verb, params })
    }

    pub fn get_sabers() -> Self {
        Self::bare(Verb::GetSabers)
    }

    pub fn save_settings(settings: &WifiSettings) -> Self {
        let values = [
            &settings.ssid,
            &settings.pass,
            &settings.universe,
            &settings.max_channels,
        ];
        Self {
            verb: Verb::SaveSettings,
            params: SAVE_SETTINGS_KEYS
                .iter()
                .zip(values)
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    pub fn verb(&self) -> Verb {
        self.verb
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Wire text for this command.
    pub fn encode(&self) -> String {
        if self.params.is_empty() {
            return self.verb.as_str().to_string();
        }

        let mut out = String::from(self.verb.as_str());
        out.push(VERB_DELIMITER);
        for (key, value) in &self.params {
            if value.contains(&[VERB_DELIMITER, KEY_VALUE_DELIMITER, TERMINATOR][..]) {
                warn!(
                    "Value of {} for {} contains a protocol delimiter and will not decode cleanly",
                    key, self.verb
                );
            }
            out.push_str(key);
            out.push(KEY_VALUE_DELIMITER);
            out.push_str(value);
        }
        out.push(TERMINATOR);
        out
    }

    /// Parse wire text produced by [`Command::encode`].
    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let Some((verb, body)) = text.split_once(VERB_DELIMITER) else {
            let verb: Verb = text.strip_suffix(TERMINATOR).unwrap_or(text).parse()?;
            if let Some(key) = verb.keys().first() {
                return Err(CodecError::MissingParameter {
                    verb,
                    key: key.to_string(),
                });
            }
            return Ok(Self::bare(verb));
        };

        let verb: Verb = verb.parse()?;
        let body = body
            .strip_suffix(TERMINATOR)
            .ok_or(CodecError::MissingTerminator)?;
        let keys = verb.keys();
        if keys.is_empty() {
            if body.is_empty() {
                return Ok(Self::bare(verb));
            }
            return Err(CodecError::UnexpectedParameters(verb));
        }

        let mut params = Vec::with_capacity(keys.len());
        let mut rest = body;
        for (i, key) in keys.iter().enumerate() {
            let missing = || CodecError::MissingParameter {
                verb,
                key: key.to_string(),
            };
            rest = rest
                .strip_prefix(*key)
                .and_then(|r| r.strip_prefix(KEY_VALUE_DELIMITER))
                .ok_or_else(missing)?;

            let end = match keys.get(i + 1) {
                Some(next) => {
                    let marker = format!("{next}{KEY_VALUE_DELIMITER}");
                    rest.find(&marker).ok_or_else(|| CodecError::MissingParameter {
                        verb,
                        key: next.to_string(),
                    })?
                }
                None => rest.len(),
            };
            params.push((key.to_string(), rest[..end].to_string()));
            rest = &rest[end..];
        }

        Ok(Self { verb, params })
    }

    fn bare(verb: Verb) -> Self {
        Self {
            verb,
            params: Vec::new(),
        }
    }

    /// Decode the controller's reply to this command.
    pub fn decode_response(&self, payload: &[u8]) -> Result<Response, CodecError> {
        decode_response(self.verb, payload)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Decode a response payload for `verb`.
///
/// Controllers pad notification values with NULs, so trailing NULs and
/// whitespace are ignored.
pub fn decode_response(verb: Verb, payload: &[u8]) -> Result<Response, CodecError> {
    let text = std::str::from_utf8(payload).map_err(|e| CodecError::InvalidUtf8 {
        valid_up_to: e.valid_up_to(),
    })?;
    let text = text.trim_end_matches(|c: char| c == '\0' || c.is_whitespace());
    let text = text.trim_start();

    match verb {
        Verb::GetSabers if text.starts_with('[') => parse_saber_list(text).map(Response::Sabers),
        Verb::GetSabers => Ok(Response::Text(text.to_string())),
        Verb::SaveSettings => {
            let lower = text.to_ascii_lowercase();
            if lower.is_empty() || lower == "ok" || lower == "ack" {
                Ok(Response::Ack)
            } else if lower.starts_with("err") {
                Ok(Response::Rejected(text.to_string()))
            } else {
                Ok(Response::Text(text.to_string()))
            }
        }
    }
}

fn parse_saber_list(text: &str) -> Result<Vec<SaberEntry>, CodecError> {
    let values: Vec<serde_json::Value> =
        serde_json::from_str(text).map_err(|e| CodecError::MalformedList(e.to_string()))?;

    values
        .into_iter()
        .map(|value| {
            let address = match &value {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Object(map) => map
                    .get("ip")
                    .or_else(|| map.get("address"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                _ => None,
            };
            address
                .map(|address| SaberEntry { address })
                .ok_or_else(|| CodecError::MalformedList(format!("unexpected entry {value}")))
        })
        .collect()
}
