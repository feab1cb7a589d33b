//! Extraction of WebVTT cues from fragmented MP4 subtitle tracks.
//!
//! Cue payloads live in `mdat` as a sequence of `vttc` boxes (with `payl`, optional `iden` and
//! `sttg` children); empty cues are `vtte` boxes. Timing is not stored with the payloads: it is
//! reconstructed from the enclosing fragment's `tfdt` base decode time and the per-sample
//! durations and composition offsets of the `trun` box, scaled by the track timescale.

use std::io::{Read, Seek, SeekFrom};

use tracing::debug;

use crate::bmff::{self, BoxInfo, Trun};
use crate::MpdGrabError;

const VTTC: bmff::FourCC = *b"vttc";
const PAYL: bmff::FourCC = *b"payl";
const IDEN: bmff::FourCC = *b"iden";
const STTG: bmff::FourCC = *b"sttg";

const BOX_HEADER_SIZE: u64 = 8;

/// One subtitle cue with its resolved timing, in seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct Cue {
    pub start: f64,
    pub end: f64,
    pub id: Option<String>,
    pub settings: Option<String>,
    pub text: String,
}

impl Cue {
    /// Render the cue in WebVTT file syntax, blank-line terminated.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(id) = &self.id {
            out.push_str(id);
            out.push('\n');
        }
        out.push_str(&webvtt_time_string(self.start));
        out.push_str(" --> ");
        out.push_str(&webvtt_time_string(self.end));
        if let Some(settings) = &self.settings {
            out.push(' ');
            out.push_str(settings);
        }
        out.push('\n');
        out.push_str(&self.text);
        out.push_str("\n\n");
        out
    }
}

/// Format a time in seconds as `HH:MM:SS.mmm`, the WebVTT timestamp syntax.
pub fn webvtt_time_string(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).floor() as u64;
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms / 60_000) % 60;
    let secs = (total_ms / 1000) % 60;
    let millis = total_ms % 1000;
    format!("{hours:02}:{minutes:02}:{secs:02}.{millis:03}")
}

/// The first line of an extracted subtitle file.
pub fn track_header(track_id: u32, language: &str) -> String {
    format!("WEBVTT - TrackID: {track_id} - Language: {language}\n\n")
}

/// Timing state of the movie fragment enclosing an `mdat`, gathered from `tfdt`, `tfhd` and
/// `trun`.
#[derive(Debug, Clone, Default)]
pub struct FragmentTiming {
    pub base_time: u64,
    pub default_sample_duration: u32,
    pub trun: Trun,
}

fn ioerr(e: std::io::Error, doing: &str) -> MpdGrabError {
    MpdGrabError::Io(e, doing.to_string())
}

fn read_payload<R: Read + Seek>(r: &mut R, info: &BoxInfo) -> Result<Vec<u8>, MpdGrabError> {
    r.seek(SeekFrom::Start(info.payload_offset()))
        .map_err(|e| ioerr(e, "seeking to box payload"))?;
    let mut buf = vec![0u8; info.payload_size() as usize];
    r.read_exact(&mut buf).map_err(|e| ioerr(e, "reading box payload"))?;
    Ok(buf)
}

fn read_payload_string<R: Read + Seek>(
    r: &mut R,
    info: &BoxInfo,
) -> Result<String, MpdGrabError> {
    let raw = read_payload(r, info)?;
    Ok(String::from_utf8_lossy(&raw).trim_end_matches('\0').to_string())
}

// A vttc box carries one cue: a required payl (the text), an optional iden (cue id) and an
// optional sttg (cue settings).
fn parse_vttc<R: Read + Seek>(
    r: &mut R,
    vttc: &BoxInfo,
    start: f64,
    end: f64,
) -> Result<Option<Cue>, MpdGrabError> {
    let payls = bmff::extract(r, vttc, &[PAYL])?;
    let Some(payl) = payls.first() else {
        debug!("vttc box without a payl child, dropping cue");
        return Ok(None);
    };
    let text = read_payload_string(r, payl)?;
    let id = match bmff::extract(r, vttc, &[IDEN])?.first() {
        Some(info) => Some(read_payload_string(r, info)?),
        None => None,
    };
    let settings = match bmff::extract(r, vttc, &[STTG])?.first() {
        Some(info) => Some(read_payload_string(r, info)?),
        None => None,
    };
    Ok(Some(Cue { start, end, id, settings, text }))
}

/// Walk the samples of one fragment and collect the cues carried by its `mdat`.
///
/// The cue clock starts at the fragment's base decode time and advances by each sample's
/// duration; a sample's composition offset shifts only its own start. Times are converted to
/// seconds with the track timescale when one is known.
pub fn extract_mdat_cues<R: Read + Seek>(
    r: &mut R,
    mdat: &BoxInfo,
    timing: &FragmentTiming,
    timescale: u32,
) -> Result<Vec<Cue>, MpdGrabError> {
    let mut cues = Vec::new();
    let payload_end = mdat.offset + mdat.size;
    let mut pos = mdat.payload_offset();
    let mut current_time = timing.base_time as i64;

    for (i, entry) in timing.trun.entries.iter().enumerate() {
        let mut duration = entry.sample_duration;
        if duration == 0 {
            duration = timing.default_sample_duration;
        }
        let start = current_time + timing.trun.sample_composition_time_offset(i);
        let end = start + i64::from(duration);
        current_time += i64::from(duration);

        let (start_secs, end_secs) = if timescale > 0 {
            (start as f64 / f64::from(timescale), end as f64 / f64::from(timescale))
        } else {
            (start as f64, end as f64)
        };

        // A sample can carry several cue boxes; its declared size bounds how much of the mdat
        // belongs to it.
        let sample_size = u64::from(entry.sample_size);
        let mut consumed = 0u64;
        while sample_size > BOX_HEADER_SIZE
            && consumed < sample_size
            && pos + BOX_HEADER_SIZE <= payload_end
        {
            r.seek(SeekFrom::Start(pos)).map_err(|e| ioerr(e, "seeking in mdat"))?;
            let size = u64::from(bmff::read_u32(r)?);
            let mut kind = [0u8; 4];
            r.read_exact(&mut kind).map_err(|e| ioerr(e, "reading mdat box type"))?;
            if size < BOX_HEADER_SIZE || pos + size > payload_end {
                return Err(MpdGrabError::BoxParse(format!(
                    "cue box {} with impossible size {size}",
                    String::from_utf8_lossy(&kind))));
            }
            if kind == VTTC {
                let info = BoxInfo { offset: pos, size, header_size: 8, kind };
                if let Some(cue) = parse_vttc(r, &info, start_secs, end_secs)? {
                    cues.push(cue);
                }
            } else {
                // vtte (an empty cue) or anything else: skip the payload
                debug!("skipping {} box, {} => {}",
                       String::from_utf8_lossy(&kind),
                       webvtt_time_string(start_secs),
                       webvtt_time_string(end_secs));
            }
            pos += size;
            consumed += size;
        }
    }
    Ok(cues)
}
