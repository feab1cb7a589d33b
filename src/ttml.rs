//! Parsing, merging and serializing TTML (Timed Text Markup Language) subtitle documents.
//!
//! TTML fragments extracted from `stpp` tracks are parsed into a [`TtmlDocument`], merged into a
//! single document, and written back out (or converted to WebVTT for muxers that don't accept
//! TTML). Style attributes are namespace-qualified (`tts:color` and friends) and we must keep the
//! attributes we don't understand, so the document is read and written with quick-xml's event
//! API rather than through serde.
//!
//! The TTML specification is at <https://www.w3.org/TR/ttml2/>.

use std::io;
use std::io::Write;
use std::path::Path;

use fs_err as fs;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::{NsReader, Writer};

use crate::MpdGrabError;

const NS_TTML: &str = "http://www.w3.org/ns/ttml";
const NS_TTS: &str = "http://www.w3.org/ns/ttml#styling";
const NS_TTP: &str = "http://www.w3.org/ns/ttml#parameter";
const NS_TTM: &str = "http://www.w3.org/ns/ttml#metadata";
const NS_XML: &str = "http://www.w3.org/XML/1998/namespace";

/// An attribute with its resolved namespace, kept verbatim so unknown styling properties survive
/// a parse/emit round trip.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NsAttr {
    pub namespace: Option<String>,
    pub name: String,
    pub value: String,
}

/// A `<style>` element: an open set of namespace-qualified attributes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Style {
    pub attrs: Vec<NsAttr>,
}

impl Style {
    /// The value of the attribute with the given local name, whatever its namespace.
    pub fn get_attr(&self, local: &str) -> Option<&str> {
        self.attrs.iter().find(|a| a.name == local).map(|a| a.value.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Styling {
    pub styles: Vec<Style>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    pub title: String,
    pub description: String,
    pub copyright: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Region {
    pub id: String,
    pub style: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Layout {
    pub regions: Vec<Region>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Head {
    pub metadata: Metadata,
    pub styling: Styling,
    pub layout: Layout,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Span {
    pub text: String,
    pub color: String,
    pub text_align: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Paragraph {
    pub begin: String,
    pub end: String,
    pub region: String,
    pub id: String,
    pub role: String,
    pub spans: Vec<Span>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Division {
    pub region: String,
    pub paragraphs: Vec<Paragraph>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Body {
    pub divisions: Vec<Division>,
}

/// A parsed TTML document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TtmlDocument {
    /// Root attributes other than the namespace bindings and `xml:lang`, kept for re-emission
    /// (eg `ttp:timeBase`).
    pub attrs: Vec<NsAttr>,
    pub lang: Option<String>,
    pub head: Head,
    pub body: Body,
}

fn parse_error(e: impl std::fmt::Display) -> MpdGrabError {
    MpdGrabError::Reassembly(format!("parsing TTML: {e}"))
}

fn write_error(e: impl std::fmt::Display) -> MpdGrabError {
    MpdGrabError::Io(io::Error::other(e.to_string()), "writing TTML".to_string())
}

type AttrList = Vec<NsAttr>;

fn element_attrs(
    reader: &NsReader<&[u8]>,
    e: &BytesStart,
) -> Result<AttrList, MpdGrabError> {
    let mut attrs = Vec::new();
    for attr in e.attributes().with_checks(false) {
        let attr = attr.map_err(parse_error)?;
        // namespace declarations are bindings, not data
        if attr.key.as_ref() == b"xmlns" || attr.key.as_ref().starts_with(b"xmlns:") {
            continue;
        }
        let (res, local) = reader.resolve_attribute(attr.key);
        let namespace = match res {
            ResolveResult::Bound(Namespace(ns)) => {
                Some(String::from_utf8_lossy(ns).into_owned())
            },
            _ => None,
        };
        let name = String::from_utf8_lossy(local.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(parse_error)?.into_owned();
        attrs.push(NsAttr { namespace, name, value });
    }
    Ok(attrs)
}

fn attr_value(attrs: &[NsAttr], local: &str) -> String {
    attrs.iter().find(|a| a.name == local).map(|a| a.value.clone()).unwrap_or_default()
}

/// Parse a TTML document from raw bytes.
pub fn parse(data: &[u8]) -> Result<TtmlDocument, MpdGrabError> {
    let mut reader = NsReader::from_reader(data);
    reader.config_mut().trim_text(false);

    let mut doc = TtmlDocument::default();
    // local-name path from the root down to the current element
    let mut path: Vec<String> = Vec::new();
    let mut current_division: Option<Division> = None;
    let mut current_paragraph: Option<Paragraph> = None;
    let mut current_span: Option<Span> = None;

    loop {
        match reader.read_resolved_event().map_err(parse_error)? {
            (_, Event::Eof) => break,
            (_, ev @ (Event::Start(_) | Event::Empty(_))) => {
                let is_empty = matches!(ev, Event::Empty(_));
                let e = match &ev {
                    Event::Start(e) | Event::Empty(e) => e,
                    _ => unreachable!(),
                };
                let (_, local) = reader.resolve_element(e.name());
                let local = String::from_utf8_lossy(local.as_ref()).into_owned();
                let attrs = element_attrs(&reader, e)?;
                match local.as_str() {
                    "tt" => {
                        for attr in &attrs {
                            if attr.name == "lang" {
                                if !attr.value.is_empty() {
                                    doc.lang = Some(attr.value.clone());
                                }
                            } else {
                                doc.attrs.push(attr.clone());
                            }
                        }
                    },
                    "style" if path.last().is_some_and(|p| p == "styling") => {
                        doc.head.styling.styles.push(Style { attrs: attrs.clone() });
                    },
                    "region" if path.last().is_some_and(|p| p == "layout") => {
                        doc.head.layout.regions.push(Region {
                            id: attr_value(&attrs, "id"),
                            style: attr_value(&attrs, "style"),
                        });
                    },
                    "div" => {
                        current_division = Some(Division {
                            region: attr_value(&attrs, "region"),
                            paragraphs: Vec::new(),
                        });
                    },
                    "p" if current_division.is_some() => {
                        current_paragraph = Some(Paragraph {
                            begin: attr_value(&attrs, "begin"),
                            end: attr_value(&attrs, "end"),
                            region: attr_value(&attrs, "region"),
                            id: attr_value(&attrs, "id"),
                            role: attr_value(&attrs, "role"),
                            spans: Vec::new(),
                        });
                    },
                    "span" if current_paragraph.is_some() => {
                        current_span = Some(Span {
                            text: String::new(),
                            color: attr_value(&attrs, "color"),
                            text_align: attr_value(&attrs, "textAlign"),
                        });
                    },
                    "br" => {
                        if let Some(span) = current_span.as_mut() {
                            span.text.push('\n');
                        }
                    },
                    _ => (),
                }
                if is_empty {
                    // a self-closed element opens and closes in one event
                    match local.as_str() {
                        "span" => {
                            if let (Some(span), Some(p)) = (current_span.take(), current_paragraph.as_mut()) {
                                p.spans.push(span);
                            }
                        },
                        "p" => {
                            if let (Some(p), Some(d)) = (current_paragraph.take(), current_division.as_mut()) {
                                d.paragraphs.push(p);
                            }
                        },
                        "div" => {
                            if let Some(d) = current_division.take() {
                                doc.body.divisions.push(d);
                            }
                        },
                        _ => (),
                    }
                } else {
                    path.push(local);
                }
            },
            (_, Event::End(_)) => {
                let local = path.pop().unwrap_or_default();
                match local.as_str() {
                    "span" => {
                        if let (Some(span), Some(p)) = (current_span.take(), current_paragraph.as_mut()) {
                            p.spans.push(span);
                        }
                    },
                    "p" => {
                        if let (Some(p), Some(d)) = (current_paragraph.take(), current_division.as_mut()) {
                            d.paragraphs.push(p);
                        }
                    },
                    "div" => {
                        if let Some(d) = current_division.take() {
                            doc.body.divisions.push(d);
                        }
                    },
                    _ => (),
                }
            },
            (_, Event::Text(t)) => {
                let text = t.unescape().map_err(parse_error)?;
                if let Some(span) = current_span.as_mut() {
                    span.text.push_str(&text);
                } else {
                    match path.last().map(String::as_str) {
                        Some("title") => doc.head.metadata.title.push_str(text.trim()),
                        Some("desc") => doc.head.metadata.description.push_str(text.trim()),
                        Some("copyright") => doc.head.metadata.copyright.push_str(text.trim()),
                        _ => (),
                    }
                }
            },
            _ => (),
        }
    }
    Ok(doc)
}

impl TtmlDocument {
    /// Parse a TTML document from a file on disk.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<TtmlDocument, MpdGrabError> {
        let data = fs::read(path.as_ref())
            .map_err(|e| MpdGrabError::Io(e, format!("reading {}", path.as_ref().display())))?;
        parse(&data)
    }

    /// Merge another document into this one.
    ///
    /// Metadata fields concatenate with a single space, but only when the incoming value is
    /// non-empty and differs. The second document's first division appends its paragraphs to this
    /// document's first division. Timestamps are not realigned: the caller must ensure the second
    /// fragment's paragraph timing follows on from the first.
    pub fn merge(&mut self, other: TtmlDocument) {
        merge_metadata(&mut self.head.metadata.title, &other.head.metadata.title);
        merge_metadata(&mut self.head.metadata.description, &other.head.metadata.description);
        merge_metadata(&mut self.head.metadata.copyright, &other.head.metadata.copyright);
        if self.lang.is_none() {
            self.lang = other.lang.clone();
        }
        if self.head.styling.styles.is_empty() {
            self.head.styling = other.head.styling;
        }
        if self.head.layout.regions.is_empty() {
            self.head.layout = other.head.layout;
        }
        if self.body.divisions.is_empty() {
            self.body.divisions = other.body.divisions;
            return;
        }
        let Some(first) = other.body.divisions.into_iter().next() else {
            return;
        };
        self.body.divisions[0].paragraphs.extend(first.paragraphs);
    }

    /// Parse `data` as TTML and merge it into this document.
    pub fn merge_from_data(&mut self, data: &[u8]) -> Result<(), MpdGrabError> {
        let other = parse(data)?;
        self.merge(other);
        Ok(())
    }

    /// Serialize the document as TTML. The `<tt>` namespace bindings are emitted in a fixed
    /// order and style attributes keep their namespace prefix.
    pub fn write<W: Write>(&self, w: W) -> Result<(), MpdGrabError> {
        let mut writer = Writer::new_with_indent(w, b' ', 2);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(write_error)?;

        let mut tt = BytesStart::new("tt");
        tt.push_attribute(("xmlns", NS_TTML));
        tt.push_attribute(("xmlns:tts", NS_TTS));
        tt.push_attribute(("xmlns:ttp", NS_TTP));
        tt.push_attribute(("xmlns:ttm", NS_TTM));
        for attr in &self.attrs {
            tt.push_attribute((prefixed_name(attr).as_str(), attr.value.as_str()));
        }
        if let Some(lang) = &self.lang {
            tt.push_attribute(("xml:lang", lang.as_str()));
        }
        writer.write_event(Event::Start(tt)).map_err(write_error)?;

        self.write_head(&mut writer)?;
        self.write_body(&mut writer)?;

        writer.write_event(Event::End(BytesEnd::new("tt"))).map_err(write_error)?;
        Ok(())
    }

    fn write_head<W: Write>(&self, writer: &mut Writer<W>) -> Result<(), MpdGrabError> {
        writer.write_event(Event::Start(BytesStart::new("head"))).map_err(write_error)?;

        writer.write_event(Event::Start(BytesStart::new("metadata"))).map_err(write_error)?;
        for (tag, value) in [("title", &self.head.metadata.title),
                             ("desc", &self.head.metadata.description),
                             ("copyright", &self.head.metadata.copyright)] {
            writer.write_event(Event::Start(BytesStart::new(tag))).map_err(write_error)?;
            writer.write_event(Event::Text(BytesText::new(value))).map_err(write_error)?;
            writer.write_event(Event::End(BytesEnd::new(tag))).map_err(write_error)?;
        }
        writer.write_event(Event::End(BytesEnd::new("metadata"))).map_err(write_error)?;

        writer.write_event(Event::Start(BytesStart::new("styling"))).map_err(write_error)?;
        for style in &self.head.styling.styles {
            let mut el = BytesStart::new("style");
            for attr in &style.attrs {
                el.push_attribute((prefixed_name(attr).as_str(), attr.value.as_str()));
            }
            writer.write_event(Event::Empty(el)).map_err(write_error)?;
        }
        writer.write_event(Event::End(BytesEnd::new("styling"))).map_err(write_error)?;

        writer.write_event(Event::Start(BytesStart::new("layout"))).map_err(write_error)?;
        for region in &self.head.layout.regions {
            let mut el = BytesStart::new("region");
            if !region.style.is_empty() {
                el.push_attribute(("style", region.style.as_str()));
            }
            if !region.id.is_empty() {
                el.push_attribute(("xml:id", region.id.as_str()));
            }
            writer.write_event(Event::Empty(el)).map_err(write_error)?;
        }
        writer.write_event(Event::End(BytesEnd::new("layout"))).map_err(write_error)?;

        writer.write_event(Event::End(BytesEnd::new("head"))).map_err(write_error)?;
        Ok(())
    }

    fn write_body<W: Write>(&self, writer: &mut Writer<W>) -> Result<(), MpdGrabError> {
        writer.write_event(Event::Start(BytesStart::new("body"))).map_err(write_error)?;
        for division in &self.body.divisions {
            let mut el = BytesStart::new("div");
            if !division.region.is_empty() {
                el.push_attribute(("region", division.region.as_str()));
            }
            writer.write_event(Event::Start(el)).map_err(write_error)?;
            for p in &division.paragraphs {
                let mut el = BytesStart::new("p");
                if !p.id.is_empty() {
                    el.push_attribute(("xml:id", p.id.as_str()));
                }
                if !p.role.is_empty() {
                    el.push_attribute(("ttm:role", p.role.as_str()));
                }
                if !p.begin.is_empty() {
                    el.push_attribute(("begin", p.begin.as_str()));
                }
                if !p.end.is_empty() {
                    el.push_attribute(("end", p.end.as_str()));
                }
                if !p.region.is_empty() {
                    el.push_attribute(("region", p.region.as_str()));
                }
                writer.write_event(Event::Start(el)).map_err(write_error)?;
                for span in &p.spans {
                    let mut el = BytesStart::new("span");
                    if !span.color.is_empty() {
                        el.push_attribute(("tts:color", span.color.as_str()));
                    }
                    if !span.text_align.is_empty() {
                        el.push_attribute(("tts:textAlign", span.text_align.as_str()));
                    }
                    writer.write_event(Event::Start(el)).map_err(write_error)?;
                    let text = format!("\n{}\n", span.text.trim());
                    writer.write_event(Event::Text(BytesText::new(&text))).map_err(write_error)?;
                    writer.write_event(Event::End(BytesEnd::new("span"))).map_err(write_error)?;
                }
                writer.write_event(Event::End(BytesEnd::new("p"))).map_err(write_error)?;
            }
            writer.write_event(Event::End(BytesEnd::new("div"))).map_err(write_error)?;
        }
        writer.write_event(Event::End(BytesEnd::new("body"))).map_err(write_error)?;
        Ok(())
    }

    /// Serialize the document to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), MpdGrabError> {
        let f = fs::File::create(path.as_ref())
            .map_err(|e| MpdGrabError::Io(e, format!("creating {}", path.as_ref().display())))?;
        self.write(io::BufWriter::new(f))
    }

    /// Convert the document to WebVTT.
    ///
    /// A lone style becomes the default `::cue` rule; named styles additionally get a
    /// `::cue(<id>)` rule each. A division with a region emits the region name before its cues.
    pub fn to_vtt<W: Write>(&self, w: &mut W) -> Result<(), MpdGrabError> {
        let io = |e: io::Error| MpdGrabError::Io(e, "writing WebVTT".to_string());
        w.write_all(b"WEBVTT\n\n").map_err(io)?;

        let mut rules = Vec::new();
        if self.head.styling.styles.len() == 1 {
            let props = webvtt_style_properties(&self.head.styling.styles[0]);
            if !props.is_empty() {
                rules.push(format!("::cue {{ {props} }}"));
            }
        }
        for style in &self.head.styling.styles {
            let Some(id) = style.get_attr("id") else { continue };
            let props = webvtt_style_properties(style);
            if !props.is_empty() {
                rules.push(format!("::cue({id}) {{ {props} }}"));
            }
        }
        if !rules.is_empty() {
            w.write_all(b"STYLE\n").map_err(io)?;
            for rule in rules {
                w.write_all(rule.as_bytes()).map_err(io)?;
                w.write_all(b"\n").map_err(io)?;
            }
            w.write_all(b"\n").map_err(io)?;
        }

        for division in &self.body.divisions {
            if !division.region.is_empty() {
                w.write_all(division.region.as_bytes()).map_err(io)?;
                w.write_all(b"\n").map_err(io)?;
            }
            for p in &division.paragraphs {
                let mut cue = format!("{} --> {}\n", p.begin, p.end);
                for span in &p.spans {
                    cue.push_str(span.text.trim());
                    cue.push('\n');
                }
                cue.push('\n');
                w.write_all(cue.as_bytes()).map_err(io)?;
            }
        }
        Ok(())
    }

    /// Convert the document to WebVTT and save it to a file.
    pub fn save_as_vtt<P: AsRef<Path>>(&self, path: P) -> Result<(), MpdGrabError> {
        let f = fs::File::create(path.as_ref())
            .map_err(|e| MpdGrabError::Io(e, format!("creating {}", path.as_ref().display())))?;
        let mut w = io::BufWriter::new(f);
        self.to_vtt(&mut w)
    }
}

fn merge_metadata(ours: &mut String, theirs: &str) {
    if !theirs.is_empty() && ours != theirs {
        if ours.is_empty() {
            ours.push_str(theirs);
        } else {
            ours.push(' ');
            ours.push_str(theirs);
        }
    }
}

// Restore the conventional prefix of a namespaced attribute on output.
fn prefixed_name(attr: &NsAttr) -> String {
    match attr.namespace.as_deref() {
        Some(NS_TTS) => format!("tts:{}", attr.name),
        Some(NS_TTM) => format!("ttm:{}", attr.name),
        Some(NS_TTP) => format!("ttp:{}", attr.name),
        Some(NS_XML) => format!("xml:{}", attr.name),
        _ => attr.name.clone(),
    }
}

// The CSS declarations of a style, eg "color: yellow; text-align: center".
fn webvtt_style_properties(style: &Style) -> String {
    let mut props = Vec::new();
    for attr in &style.attrs {
        if let Some(css) = css_property(&attr.name) {
            props.push(format!("{css}: {}", attr.value));
        }
    }
    props.join("; ")
}

// TTML styling attribute names and the WebVTT (CSS) properties they translate to.
fn css_property(ttml_name: &str) -> Option<&'static str> {
    Some(match ttml_name {
        "color" => "color",
        "fontFamily" => "font-family",
        "fontSize" => "font-size",
        "fontWeight" => "font-weight",
        "fontStyle" => "font-style",
        "backgroundColor" => "background-color",
        "opacity" => "opacity",
        "direction" => "direction",
        "unicodeBidi" => "unicode-bidi",
        "writingMode" => "writing-mode",
        "textAlign" => "text-align",
        "textDecoration" => "text-decoration",
        "textShadow" => "text-shadow",
        "textTransform" => "text-transform",
        "lineHeight" => "line-height",
        "letterSpacing" => "letter-spacing",
        "wordSpacing" => "word-spacing",
        "whiteSpace" => "white-space",
        "wordBreak" => "word-break",
        "wordWrap" => "word-wrap",
        "overflowWrap" => "overflow-wrap",
        "hyphens" => "hyphens",
        "border" => "border",
        "borderColor" => "border-color",
        "borderStyle" => "border-style",
        "borderWidth" => "border-width",
        "borderRadius" => "border-radius",
        _ => return None,
    })
}
