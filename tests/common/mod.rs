// Shared code for our test harness. Not every test binary uses every helper.
#![allow(dead_code)]

use std::sync::Once;

static TRACING_INIT: Once = Once::new();

pub fn setup_logging() {
    use tracing_subscriber::EnvFilter;

    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .compact()
            .with_target(false)
            .with_env_filter(EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,reqwest=warn,hyper=warn")))
            .init();
    });
}

// ---- minimal fragmented-MP4 construction -------------------------------------------------
//
// Just enough of the ISO-BMFF structure to feed the subtitle extraction path: an init segment
// with moov/trak/mdia metadata and a media segment with moof timing plus an mdat carrying the
// payloads.

pub fn mp4_box(kind: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut b = Vec::with_capacity(8 + payload.len());
    b.extend_from_slice(&(8 + payload.len() as u32).to_be_bytes());
    b.extend_from_slice(kind);
    b.extend_from_slice(payload);
    b
}

pub fn full_box(kind: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut p = Vec::with_capacity(4 + payload.len());
    p.push(version);
    p.extend_from_slice(&flags.to_be_bytes()[1..]);
    p.extend_from_slice(payload);
    mp4_box(kind, &p)
}

fn tkhd(track_id: u32) -> Vec<u8> {
    let mut p = vec![0u8; 8]; // creation_time + modification_time
    p.extend_from_slice(&track_id.to_be_bytes());
    full_box(b"tkhd", 0, 0, &p)
}

fn mdhd(timescale: u32, lang: &[u8; 3]) -> Vec<u8> {
    let packed: u16 = (u16::from(lang[0] - 0x60) << 10)
        | (u16::from(lang[1] - 0x60) << 5)
        | u16::from(lang[2] - 0x60);
    let mut p = vec![0u8; 8]; // creation_time + modification_time
    p.extend_from_slice(&timescale.to_be_bytes());
    p.extend_from_slice(&0u32.to_be_bytes()); // duration
    p.extend_from_slice(&packed.to_be_bytes());
    p.extend_from_slice(&0u16.to_be_bytes()); // pre_defined
    full_box(b"mdhd", 0, 0, &p)
}

fn stsd(sample_entry_format: &[u8; 4]) -> Vec<u8> {
    let entry = mp4_box(sample_entry_format, &[0u8; 8]);
    let mut p = Vec::new();
    p.extend_from_slice(&1u32.to_be_bytes()); // entry_count
    p.extend_from_slice(&entry);
    full_box(b"stsd", 0, 0, &p)
}

/// An initialization segment declaring one text track with the given sample entry format
/// (`b"wvtt"` or `b"stpp"`).
pub fn text_init_segment(track_id: u32, timescale: u32, lang: &[u8; 3],
                         sample_entry_format: &[u8; 4]) -> Vec<u8> {
    let stbl = mp4_box(b"stbl", &stsd(sample_entry_format));
    let minf = mp4_box(b"minf", &stbl);
    let mut mdia_payload = mdhd(timescale, lang);
    mdia_payload.extend(minf);
    let mdia = mp4_box(b"mdia", &mdia_payload);
    let mut trak_payload = tkhd(track_id);
    trak_payload.extend(mdia);
    let trak = mp4_box(b"trak", &trak_payload);
    mp4_box(b"moov", &trak)
}

/// A movie fragment: `moof` with tfdt/tfhd/trun timing for the given samples, followed by an
/// `mdat` with the raw payload. `samples` holds (duration, size) pairs; a zero duration defers
/// to `default_sample_duration` from the tfhd.
pub fn text_media_segment(base_time: u64, default_sample_duration: u32,
                          samples: &[(u32, u32)], mdat_payload: &[u8]) -> Vec<u8> {
    let tfdt = {
        let mut p = Vec::new();
        p.extend_from_slice(&base_time.to_be_bytes());
        full_box(b"tfdt", 1, 0, &p)
    };
    let tfhd = if default_sample_duration != 0 {
        let mut p = Vec::new();
        p.extend_from_slice(&1u32.to_be_bytes());
        p.extend_from_slice(&default_sample_duration.to_be_bytes());
        // default-sample-duration-present
        full_box(b"tfhd", 0, 0x000008, &p)
    } else {
        // track_id only, no optional fields
        full_box(b"tfhd", 0, 0, &1u32.to_be_bytes())
    };
    let trun = {
        let mut p = Vec::new();
        p.extend_from_slice(&(samples.len() as u32).to_be_bytes());
        for (duration, size) in samples {
            p.extend_from_slice(&duration.to_be_bytes());
            p.extend_from_slice(&size.to_be_bytes());
        }
        // flags: sample-duration-present | sample-size-present
        full_box(b"trun", 0, 0x000300, &p)
    };
    let mut traf_payload = tfdt;
    traf_payload.extend(tfhd);
    traf_payload.extend(trun);
    let traf = mp4_box(b"traf", &traf_payload);
    let moof = mp4_box(b"moof", &traf);

    let mut out = moof;
    out.extend(mp4_box(b"mdat", mdat_payload));
    out
}

/// A `vttc` cue box carrying one `payl` child.
pub fn vttc_cue(text: &str) -> Vec<u8> {
    let payl = mp4_box(b"payl", text.as_bytes());
    mp4_box(b"vttc", &payl)
}
