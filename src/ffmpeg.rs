//! Muxing of the reassembled tracks into a single container, using ffmpeg as a subprocess.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

use fs_err as fs;
use tracing::{info, warn};

use crate::ttml::TtmlDocument;
use crate::{MpdGrabError, OutputTrack};

// Locate the ffmpeg binary on PATH. We refuse to go further without it rather than producing an
// unplayable pile of track files.
pub(crate) fn find_ffmpeg() -> Result<PathBuf, MpdGrabError> {
    let exe = if cfg!(windows) { "ffmpeg.exe" } else { "ffmpeg" };
    let path_var = env::var_os("PATH")
        .ok_or_else(|| MpdGrabError::Mux("PATH is not set".to_string()))?;
    for dir in env::split_paths(&path_var) {
        let candidate = dir.join(exe);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(MpdGrabError::Mux(
        "ffmpeg wasn't found on PATH; it is required to mux the downloaded tracks".to_string()))
}

// Moving from the temporary directory to the output location may cross filesystems, where a
// rename fails with EXDEV.
fn move_file(from: &Path, to: &Path) -> Result<(), MpdGrabError> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)
        .map_err(|e| MpdGrabError::Io(e, format!("copying {} to {}", from.display(), to.display())))?;
    fs::remove_file(from)
        .map_err(|e| MpdGrabError::Io(e, format!("removing {}", from.display())))?;
    Ok(())
}

fn tail_of(output: &[u8]) -> String {
    let text = String::from_utf8_lossy(output);
    let text = text.trim();
    match text.char_indices().nth_back(800) {
        Some((idx, _)) => text[idx..].to_string(),
        None => text.to_string(),
    }
}

/// Mux the reassembled audio, video and text tracks into `out_path`.
///
/// Stream indices count across audio, then video, then text tracks. TTML subtitles aren't
/// accepted by ffmpeg, so they are converted to WebVTT first; the TTML document itself is kept
/// next to the output file. On success the audio and video temp files are deleted; subtitle
/// files stay beside the output.
pub(crate) fn mux(
    out_path: &Path,
    audio_tracks: &[OutputTrack],
    video_tracks: &[OutputTrack],
    text_tracks: &[OutputTrack],
) -> Result<(), MpdGrabError> {
    let ffmpeg_path = find_ffmpeg()?;

    // -y overwrites without asking
    let mut args: Vec<String> = vec!["-y".to_string()];
    let mut map_args: Vec<String> = Vec::new();
    let mut track_nbr = 0;

    for track in audio_tracks {
        if track.path.exists() {
            args.push("-i".to_string());
            args.push(track.path.display().to_string());
            map_args.push("-map".to_string());
            map_args.push(format!("{track_nbr}:a"));
            track_nbr += 1;
        }
    }
    for track in video_tracks {
        if track.path.exists() {
            args.push("-i".to_string());
            args.push(track.path.display().to_string());
            map_args.push("-map".to_string());
            map_args.push(format!("{track_nbr}:v"));
            track_nbr += 1;
        }
    }
    for track in text_tracks {
        if !track.path.exists() {
            continue;
        }
        let out_no_ext = out_path.with_extension("");

        if track.path.extension().is_some_and(|e| e == "ttml") {
            info!("TTML subtitles found; ffmpeg doesn't accept them, converting to WebVTT");
            let vtt_path = out_no_ext.with_extension("vtt");
            let doc = match TtmlDocument::open(&track.path) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!("error parsing {} as TTML: {e}", track.path.display());
                    continue;
                },
            };
            if let Err(e) = doc.save_as_vtt(&vtt_path) {
                warn!("error converting {} from TTML to WebVTT: {e}", track.path.display());
                continue;
            }
            args.push("-i".to_string());
            args.push(vtt_path.display().to_string());
            map_args.push("-map".to_string());
            map_args.push(format!("{track_nbr}:s"));
            track_nbr += 1;

            // keep the original document next to the output
            let ttml_path = out_no_ext.with_extension("ttml");
            if let Err(e) = move_file(&track.path, &ttml_path) {
                warn!("couldn't keep TTML document at {}: {e}", ttml_path.display());
            }
            continue;
        }

        // provide a copy of the subtitle file even though it's embedded in the container
        let ext = track.path.extension().and_then(|e| e.to_str()).unwrap_or("vtt");
        let sub_path = out_no_ext.with_extension(ext);
        if let Err(e) = move_file(&track.path, &sub_path) {
            warn!("couldn't move subtitle file to {}: {e}", sub_path.display());
            continue;
        }
        args.push("-i".to_string());
        args.push(sub_path.display().to_string());
        map_args.push("-map".to_string());
        map_args.push(format!("{track_nbr}:s"));
        track_nbr += 1;
    }

    if track_nbr == 0 {
        return Err(MpdGrabError::Mux("no tracks found, nothing to mux".to_string()));
    }

    args.extend(map_args);
    args.push("-vcodec".to_string());
    args.push("copy".to_string());
    args.push("-acodec".to_string());
    args.push("copy".to_string());
    args.push("-scodec".to_string());
    args.push("copy".to_string());
    args.push(out_path.display().to_string());

    info!("running ffmpeg {}", args.join(" "));
    let output = Command::new(&ffmpeg_path)
        .args(&args)
        .output()
        .map_err(|e| MpdGrabError::Io(e, "spawning ffmpeg subprocess".to_string()))?;
    if !output.status.success() {
        return Err(MpdGrabError::Mux(format!(
            "ffmpeg exited with {}: {}", output.status, tail_of(&output.stderr))));
    }

    for track in audio_tracks.iter().chain(video_tracks) {
        if track.path.exists() {
            if let Err(e) = fs::remove_file(&track.path) {
                warn!("couldn't delete temp file {}, please delete manually: {e}",
                      track.path.display());
            }
        }
    }
    Ok(())
}
