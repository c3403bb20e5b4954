//! Topic grammar
//!
//! Internal topics have the fixed shape `channels.<channel>[.<subtopic>]`
//! where the subtopic is dot-separated. `channels.>` denotes all channels.
//! Device-facing MQTT topics use `/` instead of `.`, `+` instead of `*` and
//! `#` instead of `>`.

use crate::utils::error::{Error, Result};

pub type SubscriberId = String;

/// Root prefix shared by every internal topic.
pub const CHANNELS_PREFIX: &str = "channels";

/// Subject matching every channel.
pub const ALL_CHANNELS: &str = "channels.>";

const SEPARATOR: char = '.';
const SINGLE_WILDCARD: &str = "*";
const MULTI_WILDCARD: &str = ">";

/// Builds the topic a message for `channel`/`subtopic` is published on.
///
/// The subtopic is normalized first; wildcard segments are rejected since a
/// published message must name a concrete topic.
pub fn build_topic(channel: &str, subtopic: &str) -> Result<String> {
    let subtopic = normalize_subtopic(subtopic)?;
    if has_wildcard(&subtopic) {
        return Err(Error::MalformedSubtopic);
    }
    join(channel, &subtopic)
}

/// Builds a topic to subscribe on. Unlike [`build_topic`], single-character
/// `*`/`>` segments are kept as wildcards.
pub fn subscription_topic(channel: &str, subtopic: &str) -> Result<String> {
    let subtopic = normalize_subtopic(subtopic)?;
    join(channel, &subtopic)
}

fn join(channel: &str, subtopic: &str) -> Result<String> {
    if channel.is_empty() {
        return Err(Error::EmptyTopic);
    }
    if channel.contains(SEPARATOR) {
        return Err(Error::MalformedTopic);
    }
    if subtopic.is_empty() {
        Ok(format!("{CHANNELS_PREFIX}.{channel}"))
    } else {
        Ok(format!("{CHANNELS_PREFIX}.{channel}.{subtopic}"))
    }
}

/// Splits an internal topic into its channel and subtopic.
pub fn parse_topic(topic: &str) -> Result<(String, String)> {
    let rest = topic
        .strip_prefix(CHANNELS_PREFIX)
        .and_then(|rest| rest.strip_prefix(SEPARATOR))
        .ok_or(Error::MalformedTopic)?;

    let (channel, subtopic) = rest.split_once(SEPARATOR).unwrap_or((rest, ""));
    if channel.is_empty() {
        return Err(Error::MalformedTopic);
    }
    Ok((channel.to_string(), normalize_subtopic(subtopic)?))
}

/// Normalizes a raw subtopic: URL-unescapes it, turns `/` into `.`, drops
/// empty segments and rejects segments that embed a wildcard marker.
pub fn normalize_subtopic(subtopic: &str) -> Result<String> {
    if subtopic.is_empty() {
        return Ok(String::new());
    }

    let decoded = urlencoding::decode(subtopic).map_err(|_| Error::MalformedSubtopic)?;
    let replaced = decoded.replace('/', ".");

    let mut segments = Vec::new();
    for seg in replaced.split(SEPARATOR) {
        if seg.is_empty() {
            continue;
        }
        if seg.len() > 1 && (seg.contains('*') || seg.contains('>')) {
            return Err(Error::MalformedSubtopic);
        }
        segments.push(seg);
    }
    Ok(segments.join("."))
}

/// Reports whether `subject` is matched by `pattern` under NATS wildcard
/// rules: `*` matches exactly one segment, a trailing `>` matches one or
/// more segments.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split(SEPARATOR);
    let mut sub = subject.split(SEPARATOR);

    loop {
        match (pat.next(), sub.next()) {
            (Some(MULTI_WILDCARD), Some(_)) => return pat.next().is_none(),
            (Some(SINGLE_WILDCARD), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Whether the topic carries any wildcard segment.
pub fn has_wildcard(topic: &str) -> bool {
    topic
        .split(SEPARATOR)
        .any(|seg| seg == SINGLE_WILDCARD || seg == MULTI_WILDCARD)
}

/// Translates an internal topic to MQTT topic syntax.
pub fn to_mqtt(topic: &str) -> String {
    topic
        .split(SEPARATOR)
        .map(|seg| match seg {
            SINGLE_WILDCARD => "+",
            MULTI_WILDCARD => "#",
            other => other,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Translates an MQTT topic (filter) to internal topic syntax.
pub fn from_mqtt(topic: &str) -> String {
    topic
        .split('/')
        .filter(|seg| !seg.is_empty())
        .map(|seg| match seg {
            "+" => SINGLE_WILDCARD,
            "#" => MULTI_WILDCARD,
            other => other,
        })
        .collect::<Vec<_>>()
        .join(".")
}
