//! Resolution of segment URLs for a selected Representation.
//!
//! Covers the three DASH addressing schemes: a single media file described by a `SegmentBase` (or
//! by a bare `BaseURL`), an explicit `SegmentList`, and `SegmentTemplate` expansion driven either
//! by `@duration` ($Number$-based) or by a `SegmentTimeline` ($Number$ or $Time$ based).

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;
use url::Url;

use crate::{BaseURL, ContentType, MpdGrabError, Representation, SegmentTemplate, SegmentTimeline};

pub(crate) fn is_absolute_url(s: &str) -> bool {
    ["http://", "https://", "file://"].iter().any(|scheme| s.starts_with(scheme))
}

/// Resolve the first `BaseURL` of a sequence against a parent URL, per RFC 3986.
///
/// An empty sequence (or an empty URI) yields a copy of the parent; an absolute URI replaces the
/// parent; a relative URI is joined to it. Subsequent `BaseURL` entries describe failover
/// alternates (multiple CDNs) which we deliberately don't implement.
pub fn resolve_base(parent: &Url, bases: &[BaseURL]) -> Result<Url, MpdGrabError> {
    match bases.first() {
        None => Ok(parent.clone()),
        Some(bu) if bu.base.is_empty() => Ok(parent.clone()),
        Some(bu) => resolve_href(parent, &bu.base),
    }
}

/// Resolve a single URI reference (possibly relative, possibly absolute) against a parent URL.
pub fn resolve_href(parent: &Url, href: &str) -> Result<Url, MpdGrabError> {
    if href.is_empty() {
        return Ok(parent.clone());
    }
    if is_absolute_url(href) {
        return Url::parse(href)
            .map_err(|e| MpdGrabError::Resolution(format!("parsing URL {href}: {e}")));
    }
    parent.join(href)
        .map_err(|e| MpdGrabError::Resolution(format!("joining {href} with base URL: {e}")))
}

/// Select the best Representation of an adaptation set for the given content class.
///
/// Video prefers the largest `@width`, falling back to the largest `@bandwidth` when no candidate
/// declares a width. Audio and text prefer the largest `@bandwidth`. When nothing is comparable
/// the last Representation in document order wins. For an unknown content class we only choose
/// when all children agree on a single inferable class.
pub fn select_representation(
    content_type: ContentType,
    representations: &[Representation],
) -> Option<&Representation> {
    if representations.is_empty() {
        return None;
    }
    match content_type {
        ContentType::Video => {
            if representations.iter().any(|r| r.width.is_some()) {
                representations.iter().max_by_key(|r| r.width.unwrap_or(0))
            } else if representations.iter().any(|r| r.bandwidth.is_some()) {
                representations.iter().max_by_key(|r| r.bandwidth.unwrap_or(0))
            } else {
                representations.last()
            }
        },
        ContentType::Audio | ContentType::Text => {
            if representations.iter().any(|r| r.bandwidth.is_some()) {
                representations.iter().max_by_key(|r| r.bandwidth.unwrap_or(0))
            } else {
                representations.last()
            }
        },
        ContentType::Unknown => {
            match crate::unique_child_content_type(representations) {
                Some(ct) if ct != ContentType::Unknown =>
                    select_representation(ct, representations),
                _ => None,
            }
        },
    }
}

/// How the segments of a Representation are addressed. The three schemes are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentScheme {
    /// The whole track is a single media file (SegmentBase, or a bare BaseURL).
    SingleFile,
    /// Segments are enumerated explicitly by SegmentURL elements.
    List,
    /// Segment URLs are generated from a SegmentTemplate.
    Template,
}

/// Classify the addressing scheme of a Representation, enforcing the DASH invariant that a
/// Representation is described by exactly one scheme.
pub fn classify_scheme(
    representation: &Representation,
    inherited_template: Option<&SegmentTemplate>,
) -> Result<SegmentScheme, MpdGrabError> {
    if representation.addressing_scheme_count() > 1 {
        return Err(MpdGrabError::Resolution(format!(
            "Representation {} declares more than one of SegmentBase/SegmentList/SegmentTemplate",
            representation.id.as_deref().unwrap_or("?"))));
    }
    if representation.SegmentBase.is_some() {
        return Ok(SegmentScheme::SingleFile);
    }
    if let Some(sl) = &representation.SegmentList {
        if !sl.segment_urls.is_empty() {
            return Ok(SegmentScheme::List);
        }
    }
    if representation.SegmentTemplate.is_some() || inherited_template.is_some() {
        return Ok(SegmentScheme::Template);
    }
    if !representation.BaseURL.is_empty() {
        return Ok(SegmentScheme::SingleFile);
    }
    Err(MpdGrabError::Resolution(format!(
        "no addressing scheme on Representation {}",
        representation.id.as_deref().unwrap_or("?"))))
}

// The SegmentTemplate visible from a Representation: its own template fields override those
// inherited from the AdaptationSet. Inheritance is resolved here, by value, so the model keeps no
// child-to-parent edges.
fn effective_template(
    representation: &Representation,
    inherited: Option<&SegmentTemplate>,
) -> Option<SegmentTemplate> {
    match (&representation.SegmentTemplate, inherited) {
        (None, None) => None,
        (Some(own), None) => Some(own.clone()),
        (None, Some(st)) => Some(st.clone()),
        (Some(own), Some(st)) => Some(SegmentTemplate {
            initialization: own.initialization.clone().or_else(|| st.initialization.clone()),
            media: own.media.clone().or_else(|| st.media.clone()),
            SegmentTimeline: own.SegmentTimeline.clone().or_else(|| st.SegmentTimeline.clone()),
            startNumber: own.startNumber.or(st.startNumber),
            duration: own.duration.or(st.duration),
            timescale: own.timescale.or(st.timescale),
            presentationTimeOffset: own.presentationTimeOffset.or(st.presentationTimeOffset),
        }),
    }
}

// The four identifiers DASH allows in a URL template, in their bare ($Number$) and
// width-formatted ($Number%06d$) forms. DASH-IF restricts the format suffix to %0[width]d, so
// one pattern covers everything.
static TEMPLATE_IDENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(RepresentationID|Number|Time|Bandwidth)(?:%0(\d+)d)?\$").unwrap()
});

// Substitute every identifier that has a bound value; anything unbound or unrecognized is left
// in the template untouched.
fn substitute_identifiers(template: &str, params: &HashMap<&str, String>) -> String {
    TEMPLATE_IDENT
        .replace_all(template, |caps: &regex::Captures| {
            let Some(value) = params.get(&caps[1]) else {
                return caps[0].to_string();
            };
            match caps.get(2) {
                Some(w) => {
                    let width = w.as_str().parse::<usize>().unwrap_or(0);
                    format!("{value:0>width$}")
                },
                None => value.clone(),
            }
        })
        .into_owned()
}

// "$$" is an escape sequence for a literal "$". Splitting on it first means escaped dollars can
// never combine with surrounding text to form an identifier.
pub(crate) fn resolve_url_template(template: &str, params: &HashMap<&str, String>) -> String {
    template
        .split("$$")
        .map(|part| substitute_identifiers(part, params))
        .collect::<Vec<String>>()
        .join("$")
}

// Expand a SegmentTimeline into the sequence of $Time$ values.
//
// The running position starts at the first <S>'s @t (default 0). Each <S> emits at the running
// position, then @r repeats each advanced by @d. A later <S> with an explicit @t resets the
// position; without one it advances by its own @d before emitting.
fn timeline_times(timeline: &SegmentTimeline) -> Vec<u64> {
    let mut times = Vec::new();
    let mut current: u64 = 0;
    for (i, s) in timeline.segments.iter().enumerate() {
        if let Some(t) = s.t {
            current = t;
        } else if i > 0 {
            current += s.d;
        }
        times.push(current);
        for _ in 0..s.r.unwrap_or(0) {
            current += s.d;
            times.push(current);
        }
    }
    times
}

/// Enumerate the absolute URL of every segment of `representation`, in download order.
///
/// `base_url` must already be resolved down the manifest → Period → AdaptationSet →
/// Representation chain. For template addressing the initialization segment (when declared) comes
/// first.
pub fn enumerate_segment_urls(
    representation: &Representation,
    inherited_template: Option<&SegmentTemplate>,
    base_url: &Url,
) -> Result<Vec<Url>, MpdGrabError> {
    match classify_scheme(representation, inherited_template)? {
        SegmentScheme::SingleFile => Ok(vec![base_url.clone()]),
        SegmentScheme::List => {
            let sl = representation.SegmentList.as_ref().expect("classified as List");
            let mut urls = Vec::with_capacity(sl.segment_urls.len());
            for su in &sl.segment_urls {
                if let Some(m) = &su.media {
                    urls.push(resolve_href(base_url, m)?);
                }
            }
            Ok(urls)
        },
        SegmentScheme::Template => {
            let template = effective_template(representation, inherited_template)
                .expect("classified as Template");
            expand_template(representation, &template, base_url)
        },
    }
}

fn expand_template(
    representation: &Representation,
    template: &SegmentTemplate,
    base_url: &Url,
) -> Result<Vec<Url>, MpdGrabError> {
    let rid = representation.id.as_deref().ok_or_else(|| {
        MpdGrabError::Resolution("missing @id on templated Representation".to_string())
    })?;
    let mut dict = HashMap::from([("RepresentationID", rid.to_string())]);
    if let Some(b) = representation.bandwidth {
        dict.insert("Bandwidth", b.to_string());
    }

    let mut urls = Vec::new();
    if let Some(init) = &template.initialization {
        let path = resolve_url_template(init, &dict);
        urls.push(resolve_href(base_url, &path)?);
    }
    let Some(media) = &template.media else {
        return Ok(urls);
    };
    let time_based = media.contains("$Time$") || media.contains("$Time%");
    let number_based = media.contains("$Number$") || media.contains("$Number%");
    if time_based && number_based {
        return Err(MpdGrabError::Resolution(
            "media template mixes $Number$ and $Time$".to_string()));
    }

    if time_based {
        let timeline = template.SegmentTimeline.as_ref().ok_or_else(|| {
            MpdGrabError::Resolution("$Time$ template without a SegmentTimeline".to_string())
        })?;
        for t in timeline_times(timeline) {
            let mut dict = dict.clone();
            dict.insert("Time", t.to_string());
            let path = resolve_url_template(media, &dict);
            urls.push(resolve_href(base_url, &path)?);
        }
    } else if number_based {
        let count = segment_count(template)?;
        let start = template.startNumber.unwrap_or(1);
        for number in start..start + count {
            let mut dict = dict.clone();
            dict.insert("Number", number.to_string());
            let path = resolve_url_template(media, &dict);
            urls.push(resolve_href(base_url, &path)?);
        }
    } else {
        // no per-segment identifier: the media attribute names a single URL
        let path = resolve_url_template(media, &dict);
        urls.push(resolve_href(base_url, &path)?);
    }
    Ok(urls)
}

// The number of media segments described by a template: the timeline length when a
// SegmentTimeline is present, otherwise ⌈duration/timescale⌉.
fn segment_count(template: &SegmentTemplate) -> Result<u64, MpdGrabError> {
    if let Some(timeline) = &template.SegmentTimeline {
        return Ok(timeline_times(timeline).len() as u64);
    }
    match (template.duration, template.timescale) {
        (Some(d), Some(ts)) if ts > 0 => Ok((d / ts as f64).ceil() as u64),
        _ => Err(MpdGrabError::Resolution(
            "cannot count segments: no SegmentTimeline and no duration+timescale".to_string())),
    }
}
