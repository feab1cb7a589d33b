//! Reassembly of downloaded segment files into per-track media files.
//!
//! Segments land on disk named `<prefix>_seg_<index>` and may complete in any order; ordering is
//! re-established here by sorting on the numeric suffix. Audio and video tracks are plain
//! concatenations of their segments. Text tracks are fragmented MP4 streams that must be taken
//! apart: the `moov` of the initialization segment tells us the track id, language, timescale
//! and sample format (`wvtt` or `stpp`), each `moof` carries the fragment timing, and the cue or
//! document payloads sit in `mdat`.

use std::io;
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};

use fs_err as fs;
use tracing::{debug, info};

use crate::bmff::{self, Trun};
use crate::ttml::TtmlDocument;
use crate::vtt::{self, Cue, FragmentTiming};
use crate::{ContentType, MpdGrabError};

/// The separator between a track's file prefix and the segment index.
pub const SEGMENT_SUFFIX: &str = "_seg_";

/// Reassemble the segments downloaded for one track.
///
/// `temp_prefix` is the per-track path prefix: the segment files are
/// `<temp_prefix>_seg_<index>` with a decimal index. The number of files found must equal
/// `nbr_segments`. Segment files are deleted as they are consumed.
pub fn reassemble_file(
    temp_prefix: &Path,
    out_path: &Path,
    nbr_segments: usize,
    content_type: ContentType,
) -> Result<(), MpdGrabError> {
    let files = segment_files(temp_prefix)?;
    if files.len() != nbr_segments {
        return Err(MpdGrabError::Reassembly(format!(
            "expected {nbr_segments} segment files for {}, found {}",
            temp_prefix.display(), files.len())));
    }
    if content_type == ContentType::Text {
        reassemble_text(&files, out_path)
    } else {
        concatenate(&files, out_path)
    }
}

// The segment files belonging to a track prefix, sorted by the integer after the last
// occurrence of the suffix.
fn segment_files(temp_prefix: &Path) -> Result<Vec<PathBuf>, MpdGrabError> {
    let dir = temp_prefix.parent().ok_or_else(|| {
        MpdGrabError::Reassembly(format!("no parent directory for {}", temp_prefix.display()))
    })?;
    let base = temp_prefix.file_name().ok_or_else(|| {
        MpdGrabError::Reassembly(format!("no file name in {}", temp_prefix.display()))
    })?;
    let needle = format!("{}{SEGMENT_SUFFIX}", base.to_string_lossy());

    let mut indexed = Vec::new();
    let entries = fs::read_dir(dir)
        .map_err(|e| MpdGrabError::Io(e, format!("listing {}", dir.display())))?;
    for entry in entries {
        let entry = entry.map_err(|e| MpdGrabError::Io(e, "reading directory entry".to_string()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(&needle) {
            continue;
        }
        let suffix_at = name.rfind(SEGMENT_SUFFIX).expect("prefix match implies suffix");
        let index_str = &name[suffix_at + SEGMENT_SUFFIX.len()..];
        let index: u64 = index_str.parse().map_err(|_| {
            MpdGrabError::Reassembly(format!("unparsable segment index in {name}"))
        })?;
        indexed.push((index, entry.path()));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, p)| p).collect())
}

// Binary tracks: stream every segment into the output in order, deleting inputs as we go.
fn concatenate(files: &[PathBuf], out_path: &Path) -> Result<(), MpdGrabError> {
    let out = fs::File::create(out_path)
        .map_err(|e| MpdGrabError::Io(e, format!("creating {}", out_path.display())))?;
    let mut out = io::BufWriter::new(out);
    for path in files {
        {
            let mut input = fs::File::open(path)
                .map_err(|e| MpdGrabError::Io(e, format!("opening {}", path.display())))?;
            io::copy(&mut input, &mut out)
                .map_err(|e| MpdGrabError::Io(e, format!("copying {}", path.display())))?;
            // input dropped here, before the file is unlinked
        }
        fs::remove_file(path)
            .map_err(|e| MpdGrabError::Io(e, format!("removing {}", path.display())))?;
    }
    out.flush()
        .map_err(|e| MpdGrabError::Io(e, format!("flushing {}", out_path.display())))?;
    Ok(())
}

#[derive(Default)]
struct TextTrackState {
    track_id: u32,
    language: String,
    timescale: u32,
    saw_vtt: bool,
    saw_stpp: bool,
    timing: FragmentTiming,
    cues: Vec<Cue>,
    ttml: Option<TtmlDocument>,
}

fn reassemble_text(files: &[PathBuf], out_path: &Path) -> Result<(), MpdGrabError> {
    let mut state = TextTrackState::default();
    for path in files {
        {
            let mut input = fs::File::open(path)
                .map_err(|e| MpdGrabError::Io(e, format!("opening {}", path.display())))?;
            debug!("scanning text fragment {}", path.display());
            scan_fragment(&mut input, &mut state)?;
            // input dropped here, before the file is unlinked
        }
        fs::remove_file(path)
            .map_err(|e| MpdGrabError::Io(e, format!("removing {}", path.display())))?;
    }

    if state.saw_vtt {
        info!("track {} ({}): extracted {} WebVTT cues",
              state.track_id, state.language, state.cues.len());
        let out = fs::File::create(out_path)
            .map_err(|e| MpdGrabError::Io(e, format!("creating {}", out_path.display())))?;
        let mut out = io::BufWriter::new(out);
        out.write_all(vtt::track_header(state.track_id, &state.language).as_bytes())
            .map_err(|e| MpdGrabError::Io(e, format!("writing {}", out_path.display())))?;
        for cue in &state.cues {
            out.write_all(cue.render().as_bytes())
                .map_err(|e| MpdGrabError::Io(e, format!("writing {}", out_path.display())))?;
        }
        out.flush()
            .map_err(|e| MpdGrabError::Io(e, format!("flushing {}", out_path.display())))?;
        return Ok(());
    }
    if let Some(doc) = &state.ttml {
        info!("track {} ({}): assembled TTML document", state.track_id, state.language);
        return doc.save(out_path);
    }
    Err(MpdGrabError::Reassembly(
        "text track carries neither wvtt cues nor an stpp document".to_string()))
}

fn scan_fragment<R: Read + Seek>(
    r: &mut R,
    state: &mut TextTrackState,
) -> Result<(), MpdGrabError> {
    for info in bmff::read_boxes(r)? {
        match info.kind {
            bmff::MOOV => {
                let tkhds = bmff::extract(r, &info, &[bmff::TRAK, bmff::TKHD])?;
                let tkhd_info = tkhds.first().ok_or_else(|| {
                    MpdGrabError::BoxParse("tkhd box not found".to_string())
                })?;
                state.track_id = bmff::parse_tkhd(r, tkhd_info)?.track_id;

                let mdhds = bmff::extract(r, &info, &[bmff::TRAK, bmff::MDIA, bmff::MDHD])?;
                let mdhd_info = mdhds.first().ok_or_else(|| {
                    MpdGrabError::BoxParse("mdhd box not found".to_string())
                })?;
                let mdhd = bmff::parse_mdhd(r, mdhd_info)?;
                if mdhd.timescale != 0 {
                    state.timescale = mdhd.timescale;
                }
                if !mdhd.language.is_empty() {
                    state.language = mdhd.language;
                }
                debug!("text track {} language {} timescale {}",
                       state.track_id, state.language, state.timescale);

                let stsds = bmff::extract(
                    r, &info,
                    &[bmff::TRAK, bmff::MDIA, bmff::MINF, bmff::STBL, bmff::STSD])?;
                let stsd_info = stsds.first().ok_or_else(|| {
                    MpdGrabError::BoxParse("stsd box not found".to_string())
                })?;
                if bmff::stsd_has_format(r, stsd_info, bmff::WVTT)? {
                    state.saw_vtt = true;
                }
                if bmff::stsd_has_format(r, stsd_info, bmff::STPP)? {
                    state.saw_stpp = true;
                }
            },
            bmff::MOOF => {
                let tfdts = bmff::extract(r, &info, &[bmff::TRAF, bmff::TFDT])?;
                let tfdt_info = tfdts.first().ok_or_else(|| {
                    MpdGrabError::BoxParse("tfdt box not found".to_string())
                })?;
                let tfdt = bmff::parse_tfdt(r, tfdt_info)?;

                let tfhds = bmff::extract(r, &info, &[bmff::TRAF, bmff::TFHD])?;
                let tfhd_info = tfhds.first().ok_or_else(|| {
                    MpdGrabError::BoxParse("tfhd box not found".to_string())
                })?;
                let tfhd = bmff::parse_tfhd(r, tfhd_info)?;

                let truns = bmff::extract(r, &info, &[bmff::TRAF, bmff::TRUN])?;
                let trun = match truns.first() {
                    Some(trun_info) => bmff::parse_trun(r, trun_info)?,
                    None => Trun::default(),
                };
                state.timing = FragmentTiming {
                    base_time: tfdt.base_media_decode_time,
                    default_sample_duration: tfhd.default_sample_duration,
                    trun,
                };
            },
            bmff::MDAT => {
                if state.saw_vtt {
                    let cues = vtt::extract_mdat_cues(r, &info, &state.timing, state.timescale)?;
                    state.cues.extend(cues);
                } else if state.saw_stpp {
                    r.seek(io::SeekFrom::Start(info.payload_offset()))
                        .map_err(|e| MpdGrabError::Io(e, "seeking to mdat".to_string()))?;
                    let mut data = vec![0u8; info.payload_size() as usize];
                    r.read_exact(&mut data)
                        .map_err(|e| MpdGrabError::Io(e, "reading mdat".to_string()))?;
                    match state.ttml.as_mut() {
                        None => state.ttml = Some(crate::ttml::parse(&data)?),
                        Some(doc) => doc.merge_from_data(&data)?,
                    }
                }
            },
            _ => (),
        }
    }
    Ok(())
}
