//! A streaming reader for the ISO Base Media File Format (MP4) box structure.
//!
//! Fragmented MP4 subtitle tracks carry their metadata in `moov` (track header, media header,
//! sample description) and their timing in `moof` (`tfdt`/`tfhd`/`trun`), with the cue payloads
//! in `mdat`. This module knows how to locate boxes by path and decode the handful of payloads
//! the subtitle extractor needs; everything else is skipped by size.
//!
//! Box framing: each box starts with a u32 size and a four-character type. A size of 1 is
//! followed by a u64 largesize; a size of 0 extends the box to the end of the enclosing space.

use std::io::{Read, Seek, SeekFrom};

use crate::MpdGrabError;

/// A four-character box type code.
pub type FourCC = [u8; 4];

pub const MOOV: FourCC = *b"moov";
pub const TRAK: FourCC = *b"trak";
pub const TKHD: FourCC = *b"tkhd";
pub const MDIA: FourCC = *b"mdia";
pub const MDHD: FourCC = *b"mdhd";
pub const MINF: FourCC = *b"minf";
pub const STBL: FourCC = *b"stbl";
pub const STSD: FourCC = *b"stsd";
pub const MOOF: FourCC = *b"moof";
pub const TRAF: FourCC = *b"traf";
pub const TFDT: FourCC = *b"tfdt";
pub const TFHD: FourCC = *b"tfhd";
pub const TRUN: FourCC = *b"trun";
pub const MDAT: FourCC = *b"mdat";
pub const WVTT: FourCC = *b"wvtt";
pub const STPP: FourCC = *b"stpp";

/// Location and framing of one box within the underlying reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxInfo {
    /// Offset of the box header from the start of the reader.
    pub offset: u64,
    /// Total box size, header included.
    pub size: u64,
    /// 8 for a compact header, 16 when a largesize field follows.
    pub header_size: u8,
    pub kind: FourCC,
}

impl BoxInfo {
    pub fn payload_offset(&self) -> u64 {
        self.offset + u64::from(self.header_size)
    }

    pub fn payload_size(&self) -> u64 {
        self.size - u64::from(self.header_size)
    }
}

fn ioerr(e: std::io::Error, doing: &str) -> MpdGrabError {
    MpdGrabError::Io(e, doing.to_string())
}

pub(crate) fn read_u8<R: Read>(r: &mut R) -> Result<u8, MpdGrabError> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf).map_err(|e| ioerr(e, "reading box byte"))?;
    Ok(buf[0])
}

pub(crate) fn read_u16<R: Read>(r: &mut R) -> Result<u16, MpdGrabError> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf).map_err(|e| ioerr(e, "reading box u16"))?;
    Ok(u16::from_be_bytes(buf))
}

pub(crate) fn read_u32<R: Read>(r: &mut R) -> Result<u32, MpdGrabError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).map_err(|e| ioerr(e, "reading box u32"))?;
    Ok(u32::from_be_bytes(buf))
}

pub(crate) fn read_u64<R: Read>(r: &mut R) -> Result<u64, MpdGrabError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).map_err(|e| ioerr(e, "reading box u64"))?;
    Ok(u64::from_be_bytes(buf))
}

// version byte + 24-bit flags, the common prefix of every "full box"
fn read_fullbox_header<R: Read>(r: &mut R) -> Result<(u8, u32), MpdGrabError> {
    let version = read_u8(r)?;
    let mut flags = 0u32;
    for _ in 0..3 {
        flags = (flags << 8) | u32::from(read_u8(r)?);
    }
    Ok((version, flags))
}

// Read the box starting at `offset`, which must lie within [offset, end). Returns None when
// fewer than a header's worth of bytes remain.
fn read_box_at<R: Read + Seek>(
    r: &mut R,
    offset: u64,
    end: u64,
) -> Result<Option<BoxInfo>, MpdGrabError> {
    if offset + 8 > end {
        return Ok(None);
    }
    r.seek(SeekFrom::Start(offset)).map_err(|e| ioerr(e, "seeking to box"))?;
    let size32 = read_u32(r)?;
    let mut kind = [0u8; 4];
    r.read_exact(&mut kind).map_err(|e| ioerr(e, "reading box type"))?;
    let (size, header_size) = match size32 {
        0 => (end - offset, 8u8),
        1 => (read_u64(r)?, 16u8),
        s => (u64::from(s), 8u8),
    };
    if size < u64::from(header_size) || offset + size > end {
        return Err(MpdGrabError::BoxParse(format!(
            "box {} at offset {offset} has impossible size {size}",
            String::from_utf8_lossy(&kind))));
    }
    Ok(Some(BoxInfo { offset, size, header_size, kind }))
}

/// Enumerate the top-level boxes of the reader, in file order.
pub fn read_boxes<R: Read + Seek>(r: &mut R) -> Result<Vec<BoxInfo>, MpdGrabError> {
    let end = r.seek(SeekFrom::End(0)).map_err(|e| ioerr(e, "measuring file"))?;
    let mut boxes = Vec::new();
    let mut offset = 0;
    while let Some(info) = read_box_at(r, offset, end)? {
        offset = info.offset + info.size;
        boxes.push(info);
    }
    Ok(boxes)
}

// Child boxes of a sample description box start after its entry count; plain containers hold
// children directly.
fn child_base(kind: &FourCC) -> u64 {
    if *kind == STSD { 8 } else { 0 }
}

// Enumerate the direct children of `parent`.
fn children<R: Read + Seek>(
    r: &mut R,
    parent: &BoxInfo,
) -> Result<Vec<BoxInfo>, MpdGrabError> {
    let end = parent.offset + parent.size;
    let mut offset = parent.payload_offset() + child_base(&parent.kind);
    let mut boxes = Vec::new();
    while let Some(info) = read_box_at(r, offset, end)? {
        offset = info.offset + info.size;
        boxes.push(info);
    }
    Ok(boxes)
}

/// Locate the boxes reached from `parent` by descending through `path`, depth first. Every
/// matching leaf is returned; intermediate path elements must be container boxes.
pub fn extract<R: Read + Seek>(
    r: &mut R,
    parent: &BoxInfo,
    path: &[FourCC],
) -> Result<Vec<BoxInfo>, MpdGrabError> {
    let Some((head, rest)) = path.split_first() else {
        return Ok(vec![*parent]);
    };
    let mut found = Vec::new();
    for child in children(r, parent)? {
        if child.kind == *head {
            if rest.is_empty() {
                found.push(child);
            } else {
                found.extend(extract(r, &child, rest)?);
            }
        }
    }
    Ok(found)
}

/// Track header payload.
#[derive(Debug, Clone, Copy)]
pub struct Tkhd {
    pub track_id: u32,
}

pub fn parse_tkhd<R: Read + Seek>(r: &mut R, info: &BoxInfo) -> Result<Tkhd, MpdGrabError> {
    r.seek(SeekFrom::Start(info.payload_offset())).map_err(|e| ioerr(e, "seeking to tkhd"))?;
    let (version, _flags) = read_fullbox_header(r)?;
    // creation_time and modification_time, 32 or 64 bits each
    let skip = if version == 1 { 16 } else { 8 };
    r.seek(SeekFrom::Current(skip)).map_err(|e| ioerr(e, "skipping tkhd times"))?;
    let track_id = read_u32(r)?;
    Ok(Tkhd { track_id })
}

/// Media header payload: the track timescale and its ISO-639-2 language.
#[derive(Debug, Clone)]
pub struct Mdhd {
    pub timescale: u32,
    pub language: String,
}

pub fn parse_mdhd<R: Read + Seek>(r: &mut R, info: &BoxInfo) -> Result<Mdhd, MpdGrabError> {
    r.seek(SeekFrom::Start(info.payload_offset())).map_err(|e| ioerr(e, "seeking to mdhd"))?;
    let (version, _flags) = read_fullbox_header(r)?;
    let timescale;
    if version == 1 {
        r.seek(SeekFrom::Current(16)).map_err(|e| ioerr(e, "skipping mdhd times"))?;
        timescale = read_u32(r)?;
        let _duration = read_u64(r)?;
    } else {
        r.seek(SeekFrom::Current(8)).map_err(|e| ioerr(e, "skipping mdhd times"))?;
        timescale = read_u32(r)?;
        let _duration = read_u32(r)?;
    }
    // Three 5-bit fields, each an ISO-639-2 letter offset by 0x60.
    let packed = read_u16(r)?;
    let lang = [
        ((packed >> 10) & 0x1f) as u8 + 0x60,
        ((packed >> 5) & 0x1f) as u8 + 0x60,
        (packed & 0x1f) as u8 + 0x60,
    ];
    let language = String::from_utf8_lossy(&lang).to_string();
    Ok(Mdhd { timescale, language })
}

/// Track fragment decode-time payload.
#[derive(Debug, Clone, Copy)]
pub struct Tfdt {
    pub base_media_decode_time: u64,
}

pub fn parse_tfdt<R: Read + Seek>(r: &mut R, info: &BoxInfo) -> Result<Tfdt, MpdGrabError> {
    r.seek(SeekFrom::Start(info.payload_offset())).map_err(|e| ioerr(e, "seeking to tfdt"))?;
    let (version, _flags) = read_fullbox_header(r)?;
    let base_media_decode_time = match version {
        0 => u64::from(read_u32(r)?),
        1 => read_u64(r)?,
        v => return Err(MpdGrabError::BoxParse(format!("tfdt version {v} (only 0 and 1 exist)"))),
    };
    Ok(Tfdt { base_media_decode_time })
}

/// Track fragment header payload. Only the default sample duration matters to us.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tfhd {
    pub track_id: u32,
    pub default_sample_duration: u32,
}

pub fn parse_tfhd<R: Read + Seek>(r: &mut R, info: &BoxInfo) -> Result<Tfhd, MpdGrabError> {
    r.seek(SeekFrom::Start(info.payload_offset())).map_err(|e| ioerr(e, "seeking to tfhd"))?;
    let (_version, flags) = read_fullbox_header(r)?;
    let track_id = read_u32(r)?;
    if flags & 0x000001 != 0 {
        let _base_data_offset = read_u64(r)?;
    }
    if flags & 0x000002 != 0 {
        let _sample_description_index = read_u32(r)?;
    }
    let mut default_sample_duration = 0;
    if flags & 0x000008 != 0 {
        default_sample_duration = read_u32(r)?;
    }
    Ok(Tfhd { track_id, default_sample_duration })
}

/// One sample description from a `trun` box.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrunEntry {
    pub sample_duration: u32,
    pub sample_size: u32,
    pub sample_composition_time_offset: i64,
}

/// Track fragment run payload: per-sample durations, sizes and composition offsets.
#[derive(Debug, Clone, Default)]
pub struct Trun {
    pub entries: Vec<TrunEntry>,
}

impl Trun {
    /// The composition time offset of sample `i`, zero when absent.
    pub fn sample_composition_time_offset(&self, i: usize) -> i64 {
        self.entries.get(i).map_or(0, |e| e.sample_composition_time_offset)
    }
}

pub fn parse_trun<R: Read + Seek>(r: &mut R, info: &BoxInfo) -> Result<Trun, MpdGrabError> {
    r.seek(SeekFrom::Start(info.payload_offset())).map_err(|e| ioerr(e, "seeking to trun"))?;
    let (version, flags) = read_fullbox_header(r)?;
    let sample_count = read_u32(r)?;
    if flags & 0x000001 != 0 {
        let _data_offset = read_u32(r)?;
    }
    if flags & 0x000004 != 0 {
        let _first_sample_flags = read_u32(r)?;
    }
    let mut entries = Vec::with_capacity(sample_count as usize);
    for _ in 0..sample_count {
        let mut entry = TrunEntry::default();
        if flags & 0x000100 != 0 {
            entry.sample_duration = read_u32(r)?;
        }
        if flags & 0x000200 != 0 {
            entry.sample_size = read_u32(r)?;
        }
        if flags & 0x000400 != 0 {
            let _sample_flags = read_u32(r)?;
        }
        if flags & 0x000800 != 0 {
            let raw = read_u32(r)?;
            // version 0 offsets are unsigned, version 1 are signed
            entry.sample_composition_time_offset = if version == 0 {
                i64::from(raw)
            } else {
                i64::from(raw as i32)
            };
        }
        entries.push(entry);
    }
    Ok(Trun { entries })
}

/// Does this `stsd` box declare one of the given sample entry formats?
pub fn stsd_has_format<R: Read + Seek>(
    r: &mut R,
    stsd: &BoxInfo,
    format: FourCC,
) -> Result<bool, MpdGrabError> {
    Ok(children(r, stsd)?.iter().any(|c| c.kind == format))
}
