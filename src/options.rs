// src/options.rs
//
// Option resolution: merge caller parameters onto the configured defaults.
//
// Every recognised parameter maps to exactly one TransformSpec field. Absent or
// empty values keep the default; anything present is validated strictly and
// rejected with InvalidOption before any network work is attempted.

use crate::error::{PixboxError, Result};
use crate::ops::{Anchor, Background, Filter, Mode, OutputFormat, Rect, TransformSpec};
use std::collections::HashMap;
use std::str::FromStr;

pub const PARAM_WIDTH: &str = "w";
pub const PARAM_HEIGHT: &str = "h";
pub const PARAM_MODE: &str = "mode";
pub const PARAM_FILTER: &str = "filter";
pub const PARAM_FORMAT: &str = "fmt";
pub const PARAM_QUALITY: &str = "quality";
pub const PARAM_OPTIMIZE: &str = "optimize";
pub const PARAM_BACKGROUND: &str = "bg";
pub const PARAM_POSITION: &str = "pos";
pub const PARAM_DEGREES: &str = "deg";
pub const PARAM_EXPAND: &str = "expand";
pub const PARAM_RECT: &str = "rect";

/// Raw request parameters, already percent-decoded.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawParams {
    values: HashMap<String, String>,
}

impl RawParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an `application/x-www-form-urlencoded` query string.
    /// The first occurrence of a repeated key wins.
    pub fn from_query(query: &str) -> Self {
        let mut params = Self::new();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            params
                .values
                .entry(key.into_owned())
                .or_insert_with(|| value.into_owned());
        }
        params
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Insert only when the caller did not supply the key.
    pub fn insert_default(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.values.entry(key.into()).or_insert_with(|| value.into());
        self
    }

    /// Non-empty value for `key`. Empty strings are treated as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RawParams {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut params = RawParams::new();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}

/// Merge `raw` onto `defaults` and validate the result.
pub fn resolve(raw: &RawParams, defaults: &TransformSpec) -> Result<TransformSpec> {
    let mut spec = defaults.clone();

    if let Some(v) = raw.get(PARAM_WIDTH) {
        spec.width = Some(parse_dimension(PARAM_WIDTH, v)?);
    }
    if let Some(v) = raw.get(PARAM_HEIGHT) {
        spec.height = Some(parse_dimension(PARAM_HEIGHT, v)?);
    }
    if let Some(v) = raw.get(PARAM_MODE) {
        spec.mode = Mode::from_str(v)?;
    }
    if let Some(v) = raw.get(PARAM_FILTER) {
        spec.filter = Filter::from_str(v)?;
    }
    if let Some(v) = raw.get(PARAM_FORMAT) {
        spec.format = Some(OutputFormat::from_str(v)?);
    }
    if let Some(v) = raw.get(PARAM_QUALITY) {
        spec.quality = parse_quality(v)?;
    }
    if let Some(v) = raw.get(PARAM_OPTIMIZE) {
        spec.optimize = parse_bool(PARAM_OPTIMIZE, v)?;
    }
    if let Some(v) = raw.get(PARAM_BACKGROUND) {
        spec.background = Background::from_str(v)?;
    }
    if let Some(v) = raw.get(PARAM_POSITION) {
        spec.position = Some(Anchor::from_str(v)?);
    }
    if let Some(v) = raw.get(PARAM_DEGREES) {
        spec.degrees = parse_degrees(v)?;
    }
    if let Some(v) = raw.get(PARAM_EXPAND) {
        spec.expand = parse_bool(PARAM_EXPAND, v)?;
    }
    if let Some(v) = raw.get(PARAM_RECT) {
        spec.rect = Some(Rect::from_str(v)?);
    }

    validate(&spec)?;
    Ok(spec)
}

/// Cross-field checks on a merged spec.
pub fn validate(spec: &TransformSpec) -> Result<()> {
    if !(1..=100).contains(&spec.quality) {
        return Err(PixboxError::invalid_option(
            PARAM_QUALITY,
            spec.quality.to_string(),
            "Expected an integer between 1 and 100",
        ));
    }
    if spec.mode.requires_target_box() && spec.width.is_none() && spec.height.is_none() {
        return Err(PixboxError::missing_dimension(spec.mode.as_str()));
    }
    if spec.mode == Mode::Region && spec.rect.is_none() {
        return Err(PixboxError::invalid_option(
            PARAM_RECT,
            "",
            "Region mode requires rect=x,y,w,h",
        ));
    }
    Ok(())
}

fn parse_dimension(field: &'static str, value: &str) -> Result<u32> {
    value.parse::<u32>().map_err(|_| {
        PixboxError::invalid_option(field, value.to_string(), "Expected a non-negative integer")
    })
}

fn parse_quality(value: &str) -> Result<u8> {
    let invalid = || {
        PixboxError::invalid_option(
            PARAM_QUALITY,
            value.to_string(),
            "Expected an integer between 1 and 100",
        )
    };
    let quality = value.parse::<u32>().map_err(|_| invalid())?;
    if !(1..=100).contains(&quality) {
        return Err(invalid());
    }
    u8::try_from(quality).map_err(|_| invalid())
}

fn parse_degrees(value: &str) -> Result<u32> {
    let degrees = value.parse::<i64>().map_err(|_| {
        PixboxError::invalid_option(
            PARAM_DEGREES,
            value.to_string(),
            "Expected an integer number of degrees",
        )
    })?;
    // rem_euclid keeps the result in 0..360, which always fits
    Ok(degrees.rem_euclid(360) as u32)
}

pub(crate) fn parse_bool(field: &'static str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(PixboxError::invalid_option(
            field,
            value.to_string(),
            "Expected 1/0, true/false or yes/no",
        )),
    }
}
