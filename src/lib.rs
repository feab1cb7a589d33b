//! A Rust library for downloading and reassembling media content described by a DASH MPD
//! manifest, as used for on-demand replay of TV content and video streaming services.
//!
//! In [MPEG-DASH](https://en.wikipedia.org/wiki/Dynamic_Adaptive_Streaming_over_HTTP) streaming,
//! an XML manifest — the Media Presentation Description — lists every track of a presentation
//! and how its media segments are addressed. Players read it to decide which variant of each
//! track to request; this crate reads it to pull a whole presentation down to disk.
//!
//! This library fetches an MPD manifest over HTTP, selects one representation per eligible
//! adaptation set (honoring content-type and language filters), resolves every segment URL under
//! the three DASH addressing schemes (SegmentBase, SegmentList, SegmentTemplate), downloads all
//! segments in parallel on a small worker pool, reassembles per-track byte streams (with
//! ISO-BMFF-aware extraction of WebVTT and TTML subtitle tracks), and finally hands the tracks to
//! ffmpeg to produce a single media container.
//!
//! ## DASH features supported
//!
//! - VOD (static) stream manifests
//! - Multi-period content
//! - Segment addressing via SegmentBase, SegmentList, SegmentTemplate@duration and
//!   SegmentTemplate with SegmentTimeline (both `$Number$` and `$Time$` based)
//! - Subtitles: WebVTT (`wvtt`) and TTML (`stpp`) streams in fragmented MP4 containers
//!
//! ## Limitations / unsupported features
//!
//! - Dynamic MPD manifests, as used for live streaming/OTT TV
//! - Encrypted content using DRM such as Encrypted Media Extensions (EME)
//! - Byte-range addressing (SegmentBase@indexRange partial requests)

#![allow(non_snake_case)]

pub mod bmff;
pub mod fetch;
mod ffmpeg;
pub mod reassemble;
pub mod segment;
pub mod ttml;
pub mod vtt;
pub mod worker;

use serde::{de, Deserialize, Serialize, Serializer};
use serde_with::skip_serializing_none;
use std::time::Duration;

/// Errors produced while downloading and reassembling DASH media content.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum MpdGrabError {
    /// Network or HTTP failure while retrieving the manifest. Terminal for the run.
    #[error("fetching manifest: {0}")]
    ManifestFetch(String),
    /// XML decode failure or schema violation in the manifest. Terminal for the run.
    #[error("parsing manifest: {0}")]
    ManifestParse(String),
    /// A manifest we refuse to process (dynamic/live presentations).
    #[error("unsupported manifest: {0}")]
    UnsupportedManifest(String),
    /// Segment addressing could not be resolved for an adaptation set (conflicting schemes,
    /// missing template attributes). Terminal for that track only.
    #[error("resolving segments: {0}")]
    Resolution(String),
    /// Per-segment HTTP or I/O failure, recorded on the failing job.
    #[error("fetching segment: {0}")]
    SegmentFetch(String),
    /// Reassembly failure for one track (missing segment files, unparsable sort key).
    #[error("reassembling track: {0}")]
    Reassembly(String),
    /// Malformed ISO-BMFF content in a text track.
    #[error("parsing ISO-BMFF box: {0}")]
    BoxParse(String),
    /// The external muxer is missing or exited with an error.
    #[error("muxing: {0}")]
    Mux(String),
    #[error("invalid Duration: {0}")]
    InvalidDuration(String),
    #[error("I/O error {1}")]
    Io(#[source] std::io::Error, String),
}

// Seconds per date-part unit of an xs:duration. Months and years have no exact length, so like
// most DASH clients we settle for 30-day months and 365-day years.
fn date_unit_secs(designator: char) -> Option<u64> {
    match designator {
        'Y' => Some(365 * 24 * 3600),
        'M' => Some(30 * 24 * 3600),
        'W' => Some(7 * 24 * 3600),
        'D' => Some(24 * 3600),
        _ => None,
    }
}

fn time_unit_secs(designator: char) -> Option<u64> {
    match designator {
        'H' => Some(3600),
        'M' => Some(60),
        'S' => Some(1),
        _ => None,
    }
}

// Parse an xs:duration string such as "PT1M30.5S" or "P2DT3H", as defined by
// https://www.w3.org/TR/xmlschema-2/#duration: a 'P', a run of date fields, then an optional 'T'
// introducing the time fields. Every field is a number followed by its unit designator ('M'
// meaning months before the 'T' and minutes after it). A fraction is only accepted on the
// seconds field, and a leading '-' is rejected outright since std::time::Duration cannot hold
// negative spans.
fn parse_xs_duration(value: &str) -> Result<Duration, MpdGrabError> {
    let invalid = || MpdGrabError::InvalidDuration(value.to_string());
    if value.starts_with('-') {
        return Err(MpdGrabError::InvalidDuration(format!("negative duration {value}")));
    }
    let body = value
        .strip_prefix('+')
        .unwrap_or(value)
        .strip_prefix('P')
        .ok_or_else(invalid)?;

    let mut secs: u64 = 0;
    let mut nanos: u32 = 0;
    let mut fields = 0usize;
    let mut in_time = false;
    let mut chars = body.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c == 'T' {
            if in_time {
                return Err(invalid());
            }
            in_time = true;
            chars.next();
            continue;
        }
        let mut number = String::new();
        while let Some(&d) = chars.peek() {
            if d.is_ascii_digit() || d == '.' || d == ',' {
                number.push(d);
                chars.next();
            } else {
                break;
            }
        }
        let designator = chars.next().ok_or_else(invalid)?;
        if number.is_empty() {
            return Err(invalid());
        }
        if in_time && designator == 'S' {
            let number = number.replace(',', ".");
            let (whole, fraction) = match number.split_once('.') {
                Some((w, f)) => (w, f),
                None => (number.as_str(), ""),
            };
            secs += whole.parse::<u64>().map_err(|_| invalid())?;
            if !fraction.is_empty() {
                // at most nanosecond precision
                let fraction = &fraction[..fraction.len().min(9)];
                let scale = 10u32.pow(9 - fraction.len() as u32);
                nanos = fraction.parse::<u32>().map_err(|_| invalid())? * scale;
            }
        } else {
            let unit = if in_time {
                time_unit_secs(designator)
            } else {
                date_unit_secs(designator)
            }
            .ok_or_else(invalid)?;
            secs += number.parse::<u64>().map_err(|_| invalid())? * unit;
        }
        fields += 1;
    }
    if fields == 0 {
        return Err(invalid());
    }
    Ok(Duration::new(secs, nanos))
}

// serde adapter for optional xs:duration attributes. An absent attribute is fine; one that is
// present but malformed is a manifest error.
fn deserialize_xs_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: de::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer).unwrap_or(None);
    match raw {
        Some(text) => parse_xs_duration(&text).map(Some).map_err(de::Error::custom),
        None => Ok(None),
    }
}

// Durations serialize back in hours/minutes/seconds form ("PT1H2M3.25S"). Leading zero fields
// are dropped and the fraction loses its trailing zeros, so short durations stay short
// ("PT30S").
fn serialize_xs_duration<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let Some(d) = value else {
        // not reached in practice: skip_serializing_none drops the attribute instead
        return serializer.serialize_none();
    };
    let total = d.as_secs();
    let (hours, minutes, secs) = (total / 3600, (total / 60) % 60, total % 60);
    let mut out = String::from("PT");
    if hours > 0 {
        out.push_str(&format!("{hours}H"));
    }
    if minutes > 0 || hours > 0 {
        out.push_str(&format!("{minutes}M"));
    }
    out.push_str(&secs.to_string());
    if d.subsec_nanos() > 0 {
        let fraction = format!("{:09}", d.subsec_nanos());
        out.push('.');
        out.push_str(fraction.trim_end_matches('0'));
    }
    out.push('S');
    serializer.serialize_str(&out)
}


/// One run of equal-length segments within a `SegmentTimeline`.
#[skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct S {
    /// Time at which this segment run starts, in timescale units. Resets the running timeline
    /// position when present.
    #[serde(rename = "@t")]
    pub t: Option<u64>,
    /// Duration of each segment in the run, in timescale units.
    #[serde(rename = "@d")]
    pub d: u64,
    /// How many additional segments repeat after the first one (zero when absent).
    #[serde(rename = "@r")]
    pub r: Option<u64>,
}

/// An explicit timeline of segment runs, consumed by `$Time$`- and `$Number$`-addressed
/// templates.
#[skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SegmentTimeline {
    #[serde(rename = "S")]
    pub segments: Vec<S>,
}

/// Points at the initialization segment that precedes the media segments of a Representation.
#[skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Initialization {
    #[serde(rename = "@sourceURL")]
    pub sourceURL: Option<String>,
    #[serde(rename = "@range")]
    pub range: Option<String>,
}

/// URL templates from which segment addresses are generated, by substituting `$Number$`,
/// `$Time$`, `$RepresentationID$` and `$Bandwidth$` identifiers.
#[skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SegmentTemplate {
    #[serde(rename = "@initialization")]
    pub initialization: Option<String>,
    #[serde(rename = "@media")]
    pub media: Option<String>,
    pub SegmentTimeline: Option<SegmentTimeline>,
    #[serde(rename = "@startNumber")]
    pub startNumber: Option<u64>,
    // note: DASH says this is an unsigned int, not an xs:duration. In practice, some manifests
    // use a floating point value.
    #[serde(rename = "@duration")]
    pub duration: Option<f64>,
    #[serde(rename = "@timescale")]
    pub timescale: Option<u64>,
    #[serde(rename = "@presentationTimeOffset")]
    pub presentationTimeOffset: Option<u64>,
}

/// A URL prefix for segments and other resources. May appear at every level of the manifest
/// tree; each level's entry resolves against its parent's, down to the Representation.
#[skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct BaseURL {
    #[serde(rename = "$text")]
    pub base: String,
    /// Groups BaseURL alternates that point at the same service, typically one CDN.
    #[serde(rename = "@serviceLocation")]
    pub serviceLocation: Option<String>,
}

/// Specifies segment information for a Representation addressed as a single media file.
#[skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SegmentBase {
    #[serde(rename = "Initialization")]
    pub initialization: Option<Initialization>,
    #[serde(rename = "@timescale")]
    pub timescale: Option<u64>,
    #[serde(rename = "@indexRange")]
    pub indexRange: Option<String>,
    #[serde(rename = "@presentationTimeOffset")]
    pub presentationTimeOffset: Option<u64>,
}

/// One explicit segment reference within a `SegmentList`.
#[skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SegmentURL {
    #[serde(rename = "@media")]
    pub media: Option<String>,
    #[serde(rename = "@mediaRange")]
    pub mediaRange: Option<String>,
}

/// An explicit enumeration of the segments making up a Representation.
#[skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SegmentList {
    #[serde(rename = "@duration")]
    pub duration: Option<u64>,
    #[serde(rename = "@timescale")]
    pub timescale: Option<u64>,
    #[serde(rename = "Initialization")]
    pub initialization: Option<Initialization>,
    #[serde(rename = "SegmentURL")]
    pub segment_urls: Vec<SegmentURL>,
}

/// One concrete encoding of a track: a bitrate/resolution variant. An adaptation set usually
/// offers several so the player can pick the one its bandwidth supports.
#[skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Representation {
    #[serde(rename = "@id")]
    pub id: Option<String>,
    pub BaseURL: Vec<BaseURL>,
    // @mimeType is mandatory on paper but missing from plenty of real manifests
    #[serde(rename = "@mimeType")]
    pub mimeType: Option<String>,
    /// Codec string in RFC 6381 form (eg. "mp4a.40.2").
    #[serde(rename = "@codecs")]
    pub codecs: Option<String>,
    #[serde(rename = "@contentType")]
    pub contentType: Option<String>,
    /// Language tag in RFC 5646 form.
    #[serde(rename = "@lang")]
    pub lang: Option<String>,
    /// Average bandwidth of this variant, in bits per second.
    #[serde(rename = "@bandwidth")]
    pub bandwidth: Option<u64>,
    #[serde(rename = "@audioSamplingRate")]
    pub audioSamplingRate: Option<u64>,
    #[serde(rename = "@width")]
    pub width: Option<u64>,
    #[serde(rename = "@height")]
    pub height: Option<u64>,
    pub SegmentTemplate: Option<SegmentTemplate>,
    pub SegmentBase: Option<SegmentBase>,
    pub SegmentList: Option<SegmentList>,
}

/// A group of interchangeable Representations for one content class — separate audio languages,
/// for instance, usually each get an AdaptationSet of their own.
#[skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AdaptationSet {
    #[serde(rename = "@id")]
    pub id: Option<String>,
    pub BaseURL: Vec<BaseURL>,
    #[serde(rename = "@group")]
    pub group: Option<i64>,
    // e.g. "audio", "video", "text"
    #[serde(rename = "@contentType")]
    pub contentType: Option<String>,
    /// Language tag in RFC 5646 form.
    #[serde(rename = "@lang")]
    pub lang: Option<String>,
    // eg "video/mp4"
    #[serde(rename = "@mimeType")]
    pub mimeType: Option<String>,
    /// Codec string in RFC 6381 form (eg. "avc1.4D400C").
    #[serde(rename = "@codecs")]
    pub codecs: Option<String>,
    #[serde(rename = "@audioSamplingRate")]
    pub audioSamplingRate: Option<u64>,
    #[serde(rename = "@width")]
    pub width: Option<u64>,
    #[serde(rename = "@height")]
    pub height: Option<u64>,
    /// A SegmentTemplate here specifies common values inherited by the child Representations.
    pub SegmentTemplate: Option<SegmentTemplate>,
    #[serde(rename = "Representation")]
    pub representations: Vec<Representation>,
}

/// A time-bounded slice of the presentation. Most manifests have one; chaptered or ad-spliced
/// content carries several in sequence.
#[skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Period {
    #[serde(rename = "@id")]
    pub id: Option<String>,
    pub BaseURL: Vec<BaseURL>,
    // note: DASH says that this is an xs:duration, not an unsigned int as for other
    // "duration" fields
    #[serde(deserialize_with = "deserialize_xs_duration", default)]
    #[serde(serialize_with = "serialize_xs_duration")]
    #[serde(rename = "@duration")]
    pub duration: Option<Duration>,
    #[serde(rename = "AdaptationSet")]
    pub adaptations: Vec<AdaptationSet>,
}

/// The root node of a parsed DASH MPD manifest.
#[skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct MPD {
    #[serde(rename = "@id")]
    pub id: Option<String>,
    /// "static" for on-demand content; "dynamic" marks a live presentation whose segments appear
    /// over time.
    #[serde(rename = "@type")]
    pub mpdtype: Option<String>,
    #[serde(rename = "@xmlns")]
    pub xmlns: Option<String>,
    #[serde(rename = "@profiles")]
    pub profiles: Option<String>,
    /// How much buffer a client is expected to hold to play back without stalling.
    #[serde(deserialize_with = "deserialize_xs_duration", default)]
    #[serde(serialize_with = "serialize_xs_duration")]
    #[serde(rename = "@minBufferTime")]
    pub minBufferTime: Option<Duration>,
    #[serde(deserialize_with = "deserialize_xs_duration", default)]
    #[serde(serialize_with = "serialize_xs_duration")]
    #[serde(rename = "@mediaPresentationDuration")]
    pub mediaPresentationDuration: Option<Duration>,
    /// There may be several BaseURLs, for redundancy (for example multiple CDNs). Only the first
    /// is used; failover between alternates is not implemented.
    #[serde(rename = "BaseURL")]
    pub base_url: Vec<BaseURL>,
    #[serde(rename = "Period", default)]
    pub periods: Vec<Period>,
}

impl std::fmt::Display for MPD {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let xml = quick_xml::se::to_string(self).map_err(|_| std::fmt::Error)?;
        write!(f, "{xml}")
    }
}

/// Parse an MPD manifest, provided as an XML string, returning an `MPD` node.
pub fn parse(xml: &str) -> Result<MPD, MpdGrabError> {
    let mpd: Result<MPD, quick_xml::DeError> = quick_xml::de::from_str(xml);
    match mpd {
        Ok(mpd) => Ok(mpd),
        Err(e) => Err(MpdGrabError::ManifestParse(e.to_string())),
    }
}

/// The class of media content carried by an adaptation set or representation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    Video,
    Audio,
    Text,
    #[default]
    Unknown,
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ContentType::Video => "video",
            ContentType::Audio => "audio",
            ContentType::Text => "text",
            ContentType::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

impl ContentType {
    fn from_attribute(ct: &str) -> ContentType {
        match ct.to_lowercase().as_str() {
            "video" => ContentType::Video,
            "audio" => ContentType::Audio,
            "text" => ContentType::Text,
            _ => ContentType::Unknown,
        }
    }

    // A mimeType like "video/mp4" or "application/ttml+xml". Subtitle MIME types declare text
    // content even when the stream is carried in an mp4 container.
    fn from_mime(mime: &str) -> ContentType {
        let m = mime.to_lowercase();
        if m.eq("text/vtt") || m.eq("application/ttml+xml") || m.eq("application/x-sami") {
            return ContentType::Text;
        }
        if m.starts_with("video/") {
            return ContentType::Video;
        }
        if m.starts_with("audio/") {
            return ContentType::Audio;
        }
        if m.starts_with("text/") {
            return ContentType::Text;
        }
        ContentType::Unknown
    }
}

impl Representation {
    /// The content class this Representation declares through its own attributes, `Unknown` when
    /// neither `@contentType` nor `@mimeType` is informative.
    pub fn content_type_hint(&self) -> ContentType {
        if let Some(ct) = &self.contentType {
            let ct = ContentType::from_attribute(ct);
            if ct != ContentType::Unknown {
                return ct;
            }
        }
        // We can have a Representation with mimeType="video/mp4" and codecs="wvtt", which means
        // WebVTT in a (possibly fragmented) MP4 container.
        if self.codecs.as_deref().is_some_and(is_subtitle_codec) {
            return ContentType::Text;
        }
        if let Some(mime) = &self.mimeType {
            return ContentType::from_mime(mime);
        }
        ContentType::Unknown
    }

    // A Representation is described by exactly one addressing scheme; declaring several of
    // SegmentBase/SegmentList/SegmentTemplate is a manifest authoring error.
    pub(crate) fn addressing_scheme_count(&self) -> usize {
        usize::from(self.SegmentBase.is_some())
            + usize::from(self.SegmentList.is_some())
            + usize::from(self.SegmentTemplate.is_some())
    }
}

impl AdaptationSet {
    /// The effective content class of this adaptation set: the explicit `@contentType` when
    /// present, otherwise inferred from `@mimeType`, otherwise the unique class declared by the
    /// child Representations.
    pub fn effective_content_type(&self) -> ContentType {
        if let Some(ct) = &self.contentType {
            let ct = ContentType::from_attribute(ct);
            if ct != ContentType::Unknown {
                return ct;
            }
        }
        if self.codecs.as_deref().is_some_and(is_subtitle_codec) {
            return ContentType::Text;
        }
        if let Some(mime) = &self.mimeType {
            let ct = ContentType::from_mime(mime);
            if ct != ContentType::Unknown {
                return ct;
            }
        }
        unique_child_content_type(&self.representations).unwrap_or_default()
    }
}

// The single content class declared across all Representations, or None when the children
// disagree or declare nothing.
pub(crate) fn unique_child_content_type(representations: &[Representation]) -> Option<ContentType> {
    let mut found: Option<ContentType> = None;
    for r in representations {
        match r.content_type_hint() {
            ContentType::Unknown => (),
            ct => match found {
                Some(prev) if prev != ct => return None,
                _ => found = Some(ct),
            },
        }
    }
    found
}

fn is_subtitle_codec(c: &str) -> bool {
    c == "wvtt" ||
    c == "c608" ||
    c == "stpp" ||
    c.starts_with("stpp.")
}

/// A track that was downloaded and reassembled, ready to be muxed into the output container.
#[derive(Debug, Clone)]
pub struct OutputTrack {
    pub representation_id: String,
    pub language: String,
    pub codec: String,
    pub sample_rate: Option<u64>,
    pub path: std::path::PathBuf,
    pub media_type: ContentType,
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xs_duration_parsing() {
        let d = parse_xs_duration("PT1M30.5S").unwrap();
        assert_eq!(d.as_millis(), 90_500);
        let d = parse_xs_duration("PT72H").unwrap();
        assert_eq!(d.as_secs(), 72 * 3600);
        let d = parse_xs_duration("P1DT2H").unwrap();
        assert_eq!(d.as_secs(), 26 * 3600);
        // a comma decimal separator is tolerated
        let d = parse_xs_duration("PT0H0M30,030S").unwrap();
        assert_eq!(d.as_millis(), 30_030);
        assert!(parse_xs_duration("-PT5S").is_err());
        assert!(parse_xs_duration("1h30m").is_err());
        // fractions are only valid on the seconds field
        assert!(parse_xs_duration("P0.5Y").is_err());
        assert!(parse_xs_duration("P").is_err());
    }

    #[test]
    fn test_content_type_inference() {
        let a = AdaptationSet {
            mimeType: Some("audio/mp4".to_string()),
            ..Default::default()
        };
        assert_eq!(a.effective_content_type(), ContentType::Audio);

        // a subtitle codec in an mp4 container is text, not video
        let a = AdaptationSet {
            mimeType: Some("video/mp4".to_string()),
            codecs: Some("wvtt".to_string()),
            ..Default::default()
        };
        assert_eq!(a.effective_content_type(), ContentType::Text);

        // no attributes on the set itself: the unique child class wins
        let a = AdaptationSet {
            representations: vec![
                Representation { mimeType: Some("video/mp4".to_string()), ..Default::default() },
                Representation { contentType: Some("video".to_string()), ..Default::default() },
            ],
            ..Default::default()
        };
        assert_eq!(a.effective_content_type(), ContentType::Video);

        // children disagree: refuse to guess
        let a = AdaptationSet {
            representations: vec![
                Representation { mimeType: Some("video/mp4".to_string()), ..Default::default() },
                Representation { mimeType: Some("audio/mp4".to_string()), ..Default::default() },
            ],
            ..Default::default()
        };
        assert_eq!(a.effective_content_type(), ContentType::Unknown);
    }
}
