/// HTML extraction for the appliance pages
///
/// The appliance UI is scraped by element ids and classes:
/// - generation page: `#g_d_1_capacity`, `#g_d_1_title`, `#u_capacity`
/// - consumption page: parallel `.c_value` / `.c_device` lists
/// - environment page: parallel `.num_ond` / `.num_shitudo` / `.txt_name` lists
use log::warn;
use scraper::{ElementRef, Html, Selector};

use crate::models::Entry;

/// Sentinel the climate readings start from; values at or above it are not published
pub const NOT_AVAILABLE: i64 = 999;

// Icon glyph that stands for the decimal point
const DECIMAL_GLYPH: char = 't';

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct PageError(String);

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationPage {
    /// Current generation in W, never negative
    pub watts: i64,
    pub title: String,
    /// Aggregate consumption as shown by the appliance, in kW
    pub total_kw: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsagePage {
    /// Non-zero entries in page order
    pub entries: Vec<Entry>,
    /// A zero entry (or an empty page) was seen, later pages are known empty
    pub last: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClimateReading {
    /// Position on the page, used to build the device key
    pub index: usize,
    /// Tenths of a degree Celsius
    pub tenths: i64,
    /// Relative humidity %
    pub humidity: i64,
    pub name: String,
}

fn selector(css: &'static str) -> Result<Selector, PageError> {
    Selector::parse(css).map_err(|e| PageError(format!("selector {}: {}", css, e)))
}

fn document(body: &[u8]) -> Html {
    Html::parse_document(&String::from_utf8_lossy(body))
}

fn text_of(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn first_text(html: &Html, css: &'static str) -> Result<Option<String>, PageError> {
    let selector = selector(css)?;
    Ok(html.select(&selector).next().map(text_of))
}

/// Numeric part of a value rendered with one trailing unit character
///
/// `None` when the text is empty or starts with a minus sign, which the
/// appliance uses for "no value".
fn value_part(text: &str) -> Option<&str> {
    if text.is_empty() || text.starts_with('-') {
        return None;
    }
    let mut chars = text.chars();
    chars.next_back();
    Some(chars.as_str())
}

pub fn parse_generation_page(body: &[u8]) -> Result<GenerationPage, PageError> {
    let html = document(body);

    let watts = first_text(&html, "div#g_d_1_capacity")?
        .as_deref()
        .and_then(value_part)
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(0)
        .max(0);

    let title = first_text(&html, "div#g_d_1_title")?
        .ok_or_else(|| PageError("generation title missing".to_string()))?;

    let total = first_text(&html, "div#u_capacity")?
        .ok_or_else(|| PageError("consumption total missing".to_string()))?;
    let total_kw = if total.is_empty() || total.starts_with('-') {
        0.0
    } else {
        total
            .parse::<f64>()
            .map_err(|e| PageError(format!("consumption total '{}': {}", total, e)))?
    };

    Ok(GenerationPage {
        watts,
        title,
        total_kw,
    })
}

pub fn parse_usage_page(body: &[u8]) -> Result<UsagePage, PageError> {
    let html = document(body);
    let values = selector("div.c_value")?;
    let devices = selector("div.c_device")?;

    let mut entries = Vec::new();
    let mut pairs = 0;
    let mut hit_zero = false;
    for (value, device) in html.select(&values).zip(html.select(&devices)) {
        pairs += 1;
        let text = text_of(value);
        let watts = match value_part(&text) {
            Some(v) => v
                .parse::<i64>()
                .map_err(|e| PageError(format!("consumption value '{}': {}", text, e)))?,
            None => 0,
        };
        if watts == 0 {
            hit_zero = true;
            break;
        }
        entries.push(Entry(watts, text_of(device)));
    }

    Ok(UsagePage {
        entries,
        last: hit_zero || pairs == 0,
    })
}

/// Read a number rendered as a run of font icons
///
/// Each icon is a child element with exactly two attributes; the last
/// character of the second attribute's value is the glyph. Any glyph other
/// than a digit or the decimal marker invalidates the whole run.
fn icon_number(element: ElementRef<'_>) -> Option<f64> {
    let mut digits = String::new();
    for child in element.children().filter_map(ElementRef::wrap) {
        let attrs: Vec<(&str, &str)> = child.value().attrs().collect();
        if attrs.len() != 2 {
            continue;
        }
        match attrs[1].1.chars().last() {
            Some(c) if c.is_ascii_digit() => digits.push(c),
            Some(DECIMAL_GLYPH) => digits.push('.'),
            _ => return None,
        }
    }
    digits.parse().ok()
}

pub fn parse_environment_page(body: &[u8]) -> Result<Vec<ClimateReading>, PageError> {
    let html = document(body);
    let temperatures: Vec<ElementRef<'_>> = html.select(&selector("div.num_ond")?).collect();
    let humidities: Vec<ElementRef<'_>> = html.select(&selector("div.num_shitudo")?).collect();
    let names: Vec<ElementRef<'_>> = html.select(&selector("div.txt_name")?).collect();

    if temperatures.len() != humidities.len() || temperatures.len() != names.len() {
        warn!(
            "Environment lists differ: {}/{}/{}",
            temperatures.len(),
            humidities.len(),
            names.len()
        );
        return Ok(Vec::new());
    }

    let mut readings = Vec::new();
    for (index, ((temperature, humidity), name)) in temperatures
        .into_iter()
        .zip(humidities)
        .zip(names)
        .enumerate()
    {
        let tenths = icon_number(temperature)
            .map(|t| (t * 10.0).round() as i64)
            .unwrap_or(NOT_AVAILABLE);
        let humidity = icon_number(humidity)
            .map(|h| h.trunc() as i64)
            .unwrap_or(NOT_AVAILABLE);
        if tenths < NOT_AVAILABLE && humidity < NOT_AVAILABLE {
            readings.push(ClimateReading {
                index,
                tenths,
                humidity,
                name: text_of(name),
            });
        }
    }
    Ok(readings)
}
