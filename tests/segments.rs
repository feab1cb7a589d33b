// Tests for segment URL resolution and enumeration across the three addressing schemes.

use mpdgrab::segment::{
    classify_scheme, enumerate_segment_urls, resolve_base, resolve_href, SegmentScheme,
};
use mpdgrab::{
    BaseURL, MpdGrabError, Representation, SegmentBase, SegmentList, SegmentTemplate,
    SegmentTimeline, SegmentURL, S,
};
use pretty_assertions::assert_eq;
use url::Url;

fn base(s: &str) -> BaseURL {
    BaseURL { base: s.to_string(), ..Default::default() }
}

fn parent() -> Url {
    Url::parse("https://cdn.example.com/streams/show/manifest.mpd").unwrap()
}

#[test]
fn test_resolve_base_rules() {
    let p = parent();
    // an empty sequence yields a value-equal copy of the parent
    let resolved = resolve_base(&p, &[]).unwrap();
    assert_eq!(resolved, p);

    // an absolute child replaces the parent
    let resolved = resolve_base(&p, &[base("https://other.example.net/x/")]).unwrap();
    assert_eq!(resolved.as_str(), "https://other.example.net/x/");

    // a relative child resolves against the parent per RFC 3986
    let resolved = resolve_base(&p, &[base("media/")]).unwrap();
    assert_eq!(resolved.as_str(), "https://cdn.example.com/streams/show/media/");

    // only the first of several BaseURLs is used
    let resolved = resolve_base(&p, &[base("cdn1/"), base("cdn2/")]).unwrap();
    assert_eq!(resolved.as_str(), "https://cdn.example.com/streams/show/cdn1/");
}

#[test]
fn test_resolve_href_rules() {
    let p = parent();
    assert_eq!(resolve_href(&p, "").unwrap(), p);
    assert_eq!(resolve_href(&p, "seg.m4s").unwrap().as_str(),
               "https://cdn.example.com/streams/show/seg.m4s");
    assert_eq!(resolve_href(&p, "/root.m4s").unwrap().as_str(),
               "https://cdn.example.com/root.m4s");
    assert_eq!(resolve_href(&p, "https://abs.example.org/a.m4s").unwrap().as_str(),
               "https://abs.example.org/a.m4s");
}

#[test]
fn test_scheme_classification() {
    let rep = Representation {
        SegmentBase: Some(SegmentBase::default()),
        ..Default::default()
    };
    assert_eq!(classify_scheme(&rep, None).unwrap(), SegmentScheme::SingleFile);

    let rep = Representation {
        SegmentList: Some(SegmentList {
            segment_urls: vec![SegmentURL { media: Some("s1.m4s".to_string()), ..Default::default() }],
            ..Default::default()
        }),
        ..Default::default()
    };
    assert_eq!(classify_scheme(&rep, None).unwrap(), SegmentScheme::List);

    let rep = Representation {
        SegmentTemplate: Some(SegmentTemplate::default()),
        ..Default::default()
    };
    assert_eq!(classify_scheme(&rep, None).unwrap(), SegmentScheme::Template);

    // a template inherited from the AdaptationSet also classifies as Template
    let rep = Representation::default();
    let inherited = SegmentTemplate::default();
    assert_eq!(classify_scheme(&rep, Some(&inherited)).unwrap(), SegmentScheme::Template);

    // BaseURL only: a single media file
    let rep = Representation { BaseURL: vec![base("audio.mp4")], ..Default::default() };
    assert_eq!(classify_scheme(&rep, None).unwrap(), SegmentScheme::SingleFile);

    // nothing at all: refuse
    let rep = Representation::default();
    assert!(matches!(classify_scheme(&rep, None), Err(MpdGrabError::Resolution(_))));
}

#[test]
fn test_scheme_exclusivity_enforced() {
    let rep = Representation {
        SegmentBase: Some(SegmentBase::default()),
        SegmentTemplate: Some(SegmentTemplate::default()),
        ..Default::default()
    };
    assert!(matches!(classify_scheme(&rep, None), Err(MpdGrabError::Resolution(_))));

    let rep = Representation {
        SegmentList: Some(SegmentList::default()),
        SegmentBase: Some(SegmentBase::default()),
        ..Default::default()
    };
    assert!(matches!(classify_scheme(&rep, None), Err(MpdGrabError::Resolution(_))));
}

#[test]
fn test_single_file_enumeration() {
    let rep = Representation {
        id: Some("a1".to_string()),
        BaseURL: vec![base("audio.mp4")],
        SegmentBase: Some(SegmentBase::default()),
        ..Default::default()
    };
    // the caller resolves the representation's BaseURL into the chain before enumerating
    let rep_base = resolve_base(&parent(), &rep.BaseURL).unwrap();
    let urls = enumerate_segment_urls(&rep, None, &rep_base).unwrap();
    assert_eq!(urls.len(), 1);
    assert_eq!(urls[0].as_str(), "https://cdn.example.com/streams/show/audio.mp4");
}

#[test]
fn test_list_enumeration_preserves_document_order() {
    let rep = Representation {
        id: Some("a1".to_string()),
        SegmentList: Some(SegmentList {
            segment_urls: vec![
                SegmentURL { media: Some("seg-3.m4s".to_string()), ..Default::default() },
                SegmentURL { media: Some("seg-1.m4s".to_string()), ..Default::default() },
                SegmentURL { media: Some("seg-2.m4s".to_string()), ..Default::default() },
            ],
            ..Default::default()
        }),
        ..Default::default()
    };
    let urls = enumerate_segment_urls(&rep, None, &parent()).unwrap();
    let names: Vec<&str> = urls.iter().map(|u| u.path_segments().unwrap().next_back().unwrap()).collect();
    assert_eq!(names, vec!["seg-3.m4s", "seg-1.m4s", "seg-2.m4s"]);
}

#[test]
fn test_number_template_cardinality() {
    // ⌈95232/48000⌉ = 2 segments, numbered from startNumber
    let rep = Representation {
        id: Some("v1".to_string()),
        bandwidth: Some(1_000_000),
        SegmentTemplate: Some(SegmentTemplate {
            media: Some("v_$Number$.m4s".to_string()),
            startNumber: Some(1),
            duration: Some(95232.0),
            timescale: Some(48000),
            ..Default::default()
        }),
        ..Default::default()
    };
    let urls = enumerate_segment_urls(&rep, None, &parent()).unwrap();
    let names: Vec<&str> = urls.iter().map(|u| u.path_segments().unwrap().next_back().unwrap()).collect();
    assert_eq!(names, vec!["v_1.m4s", "v_2.m4s"]);
}

#[test]
fn test_template_initialization_comes_first() {
    let rep = Representation {
        id: Some("v1".to_string()),
        SegmentTemplate: Some(SegmentTemplate {
            initialization: Some("$RepresentationID$/init.mp4".to_string()),
            media: Some("$RepresentationID$/s_$Number$.m4s".to_string()),
            startNumber: Some(5),
            duration: Some(10.0),
            timescale: Some(10),
            ..Default::default()
        }),
        ..Default::default()
    };
    let urls = enumerate_segment_urls(&rep, None, &parent()).unwrap();
    assert_eq!(urls.len(), 2);
    assert_eq!(urls[0].as_str(), "https://cdn.example.com/streams/show/v1/init.mp4");
    assert_eq!(urls[1].as_str(), "https://cdn.example.com/streams/show/v1/s_5.m4s");
}

#[test]
fn test_time_template_walk() {
    let rep = Representation {
        id: Some("a1".to_string()),
        SegmentTemplate: Some(SegmentTemplate {
            media: Some("a_$Time$.m4s".to_string()),
            SegmentTimeline: Some(SegmentTimeline {
                segments: vec![
                    S { t: Some(0), d: 96256, r: Some(2) },
                    S { t: None, d: 95232, r: None },
                ],
            }),
            ..Default::default()
        }),
        ..Default::default()
    };
    let urls = enumerate_segment_urls(&rep, None, &parent()).unwrap();
    let names: Vec<&str> = urls.iter().map(|u| u.path_segments().unwrap().next_back().unwrap()).collect();
    assert_eq!(names, vec!["a_0.m4s", "a_96256.m4s", "a_192512.m4s", "a_287744.m4s"]);
}

#[test]
fn test_time_template_with_width() {
    // a width-formatted $Time%08d$ expands through the same timeline walk as bare $Time$
    let rep = Representation {
        id: Some("a1".to_string()),
        SegmentTemplate: Some(SegmentTemplate {
            media: Some("a_$Time%08d$.m4s".to_string()),
            SegmentTimeline: Some(SegmentTimeline {
                segments: vec![
                    S { t: Some(0), d: 96256, r: Some(1) },
                    S { t: None, d: 95232, r: None },
                ],
            }),
            ..Default::default()
        }),
        ..Default::default()
    };
    let urls = enumerate_segment_urls(&rep, None, &parent()).unwrap();
    let names: Vec<&str> = urls.iter().map(|u| u.path_segments().unwrap().next_back().unwrap()).collect();
    assert_eq!(names, vec!["a_00000000.m4s", "a_00096256.m4s", "a_00191488.m4s"]);
}

#[test]
fn test_number_driven_by_timeline_size() {
    let rep = Representation {
        id: Some("v1".to_string()),
        SegmentTemplate: Some(SegmentTemplate {
            media: Some("s_$Number$.m4s".to_string()),
            startNumber: Some(10),
            SegmentTimeline: Some(SegmentTimeline {
                segments: vec![S { t: Some(0), d: 100, r: Some(2) }],
            }),
            ..Default::default()
        }),
        ..Default::default()
    };
    let urls = enumerate_segment_urls(&rep, None, &parent()).unwrap();
    let names: Vec<&str> = urls.iter().map(|u| u.path_segments().unwrap().next_back().unwrap()).collect();
    assert_eq!(names, vec!["s_10.m4s", "s_11.m4s", "s_12.m4s"]);
}

#[test]
fn test_bandwidth_and_dollar_escape() {
    let rep = Representation {
        id: Some("v1".to_string()),
        bandwidth: Some(1_980_081),
        SegmentTemplate: Some(SegmentTemplate {
            media: Some("$$$Bandwidth$/s_$Number$.m4s".to_string()),
            startNumber: Some(1),
            duration: Some(1.0),
            timescale: Some(1),
            ..Default::default()
        }),
        ..Default::default()
    };
    let urls = enumerate_segment_urls(&rep, None, &parent()).unwrap();
    assert_eq!(urls.len(), 1);
    assert!(urls[0].as_str().ends_with("$1980081/s_1.m4s"));
}

#[test]
fn test_number_and_time_are_mutually_exclusive() {
    let rep = Representation {
        id: Some("v1".to_string()),
        SegmentTemplate: Some(SegmentTemplate {
            media: Some("s_$Number$_$Time$.m4s".to_string()),
            SegmentTimeline: Some(SegmentTimeline {
                segments: vec![S { t: Some(0), d: 100, r: None }],
            }),
            ..Default::default()
        }),
        ..Default::default()
    };
    assert!(matches!(enumerate_segment_urls(&rep, None, &parent()),
                     Err(MpdGrabError::Resolution(_))));
}

#[test]
fn test_missing_duration_is_a_resolution_error() {
    // no SegmentTimeline and no usable duration+timescale: the segment count is undefined
    let rep = Representation {
        id: Some("v1".to_string()),
        SegmentTemplate: Some(SegmentTemplate {
            media: Some("s_$Number$.m4s".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    };
    assert!(matches!(enumerate_segment_urls(&rep, None, &parent()),
                     Err(MpdGrabError::Resolution(_))));
}

#[test]
fn test_inherited_template_is_overridden_by_own_fields() {
    let inherited = SegmentTemplate {
        media: Some("base_$Number$.m4s".to_string()),
        startNumber: Some(1),
        duration: Some(2.0),
        timescale: Some(1),
        ..Default::default()
    };
    // the representation only overrides the media attribute
    let rep = Representation {
        id: Some("v1".to_string()),
        SegmentTemplate: Some(SegmentTemplate {
            media: Some("own_$Number$.m4s".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    };
    let urls = enumerate_segment_urls(&rep, Some(&inherited), &parent()).unwrap();
    let names: Vec<&str> = urls.iter().map(|u| u.path_segments().unwrap().next_back().unwrap()).collect();
    assert_eq!(names, vec!["own_1.m4s", "own_2.m4s"]);
}

#[test]
fn test_expansion_is_idempotent() {
    let rep = Representation {
        id: Some("a1".to_string()),
        SegmentTemplate: Some(SegmentTemplate {
            media: Some("a_$Time$.m4s".to_string()),
            SegmentTimeline: Some(SegmentTimeline {
                segments: vec![
                    S { t: Some(0), d: 100, r: Some(2) },
                    S { t: None, d: 50, r: None },
                ],
            }),
            ..Default::default()
        }),
        ..Default::default()
    };
    let first = enumerate_segment_urls(&rep, None, &parent()).unwrap();
    let second = enumerate_segment_urls(&rep, None, &parent()).unwrap();
    assert_eq!(first, second);
}
