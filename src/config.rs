//! Parsers for command-line values: declared sensors, sites and durations.

use crate::decoder::SensorKind;
use crate::mac_address::{MacAddress, canonical_id};
use std::time::Duration;

/// A sensor declared on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorDecl {
    /// Canonical uppercase address
    pub id: String,
    pub kind: SensorKind,
    pub name: Option<String>,
}

/// A remote site or peer declared on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteDecl {
    pub name: String,
    pub url: String,
}

/// Parse a sensor declaration in the format "MAC=KIND[:NAME]".
///
/// # Example
/// ```
/// use sitewatch::config::parse_sensor;
/// use sitewatch::decoder::SensorKind;
///
/// let sensor = parse_sensor("aa:bb:cc:dd:ee:ff=ruuvi:Sauna").unwrap();
/// assert_eq!(sensor.id, "AA:BB:CC:DD:EE:FF");
/// assert_eq!(sensor.kind, SensorKind::Ruuvi);
/// assert_eq!(sensor.name.as_deref(), Some("Sauna"));
/// ```
pub fn parse_sensor(src: &str) -> Result<SensorDecl, String> {
    let (address, rest) = src
        .split_once('=')
        .ok_or("invalid sensor: expected format MAC=KIND[:NAME]")?;

    let mac: MacAddress = address
        .trim()
        .parse()
        .map_err(|e| format!("invalid sensor address '{}': {}", address, e))?;

    let (kind, name) = match rest.split_once(':') {
        Some((kind, name)) => (kind, Some(name.trim())),
        None => (rest, None),
    };
    let kind: SensorKind = kind.trim().parse()?;

    Ok(SensorDecl {
        id: canonical_id(&mac.to_string()),
        kind,
        name: name.filter(|n| !n.is_empty()).map(str::to_string),
    })
}

/// Parse a site in the format "NAME=URL".
///
/// # Example
/// ```
/// use sitewatch::config::parse_site;
///
/// let site = parse_site("cabin=http://cabin.local:8080").unwrap();
/// assert_eq!(site.name, "cabin");
/// assert_eq!(site.url, "http://cabin.local:8080");
/// ```
pub fn parse_site(src: &str) -> Result<SiteDecl, String> {
    let (name, url) = src
        .split_once('=')
        .ok_or_else(|| "invalid site: expected format NAME=URL".to_string())?;
    let (name, url) = (name.trim(), url.trim());

    if name.is_empty() {
        return Err("invalid site: empty name".into());
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(format!(
            "invalid site URL '{url}': expected http:// or https://"
        ));
    }

    Ok(SiteDecl {
        name: name.to_string(),
        url: url.to_string(),
    })
}

/// Parse a duration from a human-readable string.
///
/// Supports the following suffixes:
/// - `s` or no suffix: seconds
/// - `m`: minutes
/// - `h`: hours
/// - `ms`: milliseconds
///
/// # Examples
/// ```
/// use sitewatch::config::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
/// assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
/// assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();

    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    let (num, unit_millis, unit) = if let Some(num) = src.strip_suffix("ms") {
        (num, 1, "milliseconds")
    } else if let Some(num) = src.strip_suffix('h') {
        (num, 3_600_000, "hours")
    } else if let Some(num) = src.strip_suffix('m') {
        (num, 60_000, "minutes")
    } else if let Some(num) = src.strip_suffix('s') {
        (num, 1_000, "seconds")
    } else {
        (src, 1_000, "duration")
    };

    let value: u64 = num
        .trim()
        .parse()
        .map_err(|_| format!("invalid {}: {}", unit, num))?;
    value
        .checked_mul(unit_millis)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("duration too large: {}", src))
}
