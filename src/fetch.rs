//! Support for downloading content from DASH MPD media streams.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::time::Duration;

use fs_err as fs;
use tracing::{debug, info, warn};
use url::Url;

use crate::ffmpeg::mux;
use crate::reassemble::{reassemble_file, SEGMENT_SUFFIX};
use crate::segment::{enumerate_segment_urls, resolve_base, select_representation};
use crate::worker::{HttpClient, SegmentJob, SegmentOutcome, WorkerPool};
use crate::{parse, AdaptationSet, ContentType, MpdGrabError, OutputTrack, Representation};

/// The default number of parallel segment fetch workers.
const DEFAULT_WORKERS: usize = 4;

/// The MpdDownloader allows the download of streaming media content from a DASH MPD manifest.
/// This involves fetching the manifest file, parsing it, selecting the best representation of
/// every eligible adaptation set, downloading all their segments on a worker pool, reassembling
/// the per-track files, then muxing the tracks with ffmpeg to produce a single output file.
///
/// Example
/// ```rust,no_run
/// use mpdgrab::fetch::MpdDownloader;
///
/// let url = "https://storage.googleapis.com/shaka-demo-assets/heliocentrism/heliocentrism.mpd";
/// MpdDownloader::new(url)
///     .limit_languages(vec!["en".to_string()])
///     .download_to("heliocentrism.mp4")
///     .unwrap();
/// ```
pub struct MpdDownloader {
    mpd_url: String,
    output_path: Option<PathBuf>,
    http_client: Option<HttpClient>,
    fetch_audio: bool,
    fetch_video: bool,
    fetch_subtitles: bool,
    language_filter: Vec<String>,
    worker_count: usize,
    keep_tracks: bool,
    verbosity: u8,
}

impl MpdDownloader {
    /// Create an `MpdDownloader` for the specified DASH manifest URL `mpd_url`.
    pub fn new(mpd_url: &str) -> MpdDownloader {
        MpdDownloader {
            mpd_url: String::from(mpd_url),
            output_path: None,
            http_client: None,
            fetch_audio: true,
            fetch_video: true,
            fetch_subtitles: true,
            language_filter: Vec::new(),
            worker_count: DEFAULT_WORKERS,
            keep_tracks: false,
            verbosity: 0,
        }
    }

    /// Use a caller-supplied reqwest Client instead of the default one, for proxies, custom
    /// user agents, different timeouts and the like.
    pub fn with_http_client(mut self, client: HttpClient) -> MpdDownloader {
        self.http_client = Some(client);
        self
    }

    /// Whether audio adaptation sets are downloaded (enabled by default).
    pub fn fetch_audio(mut self, value: bool) -> MpdDownloader {
        self.fetch_audio = value;
        self
    }

    /// Whether video adaptation sets are downloaded (enabled by default).
    pub fn fetch_video(mut self, value: bool) -> MpdDownloader {
        self.fetch_video = value;
        self
    }

    /// Whether subtitle adaptation sets are downloaded (enabled by default).
    pub fn fetch_subtitles(mut self, value: bool) -> MpdDownloader {
        self.fetch_subtitles = value;
        self
    }

    /// Only download tracks whose declared language is one of `langs`. Tracks with no language,
    /// an empty one, or `und` (undetermined) always pass the filter.
    pub fn limit_languages(mut self, langs: Vec<String>) -> MpdDownloader {
        self.language_filter = langs.into_iter().map(|l| l.trim().to_string()).collect();
        self
    }

    /// The number of parallel segment download workers. The pool configuration is fixed once the
    /// download starts.
    pub fn worker_count(mut self, count: usize) -> MpdDownloader {
        self.worker_count = count.max(1);
        self
    }

    /// Skip the final ffmpeg mux and leave the reassembled per-track files next to the output
    /// path, named `<output stem>-<representation id>.<ext>`.
    pub fn keep_tracks(mut self) -> MpdDownloader {
        self.keep_tracks = true;
        self
    }

    /// Set the verbosity level of the download process. Level 0 logs errors and warnings only;
    /// higher levels describe selection and addressing decisions.
    pub fn verbosity(mut self, level: u8) -> MpdDownloader {
        self.verbosity = level;
        self
    }

    /// Run the download, writing the muxed result to `out` (overwritten if it exists).
    pub fn download_to<P: Into<PathBuf>>(mut self, out: P) -> Result<(), MpdGrabError> {
        self.output_path = Some(out.into());
        if self.http_client.is_none() {
            let client = reqwest::blocking::Client::builder()
                .timeout(Duration::new(10, 0))
                .gzip(true)
                .build()
                .map_err(|e| MpdGrabError::ManifestFetch(format!("building HTTP client: {e}")))?;
            self.http_client = Some(client);
        }
        fetch_mpd(self)
    }

    /// Download to a file in the current working directory, deriving its name from the manifest
    /// URL, and return the corresponding path.
    pub fn download(mut self) -> Result<PathBuf, MpdGrabError> {
        let cwd = env::current_dir()
            .map_err(|e| MpdGrabError::Io(e, "obtaining current dir".to_string()))?;
        let outpath = cwd.join(generate_filename_from_url(&self.mpd_url));
        self.output_path = Some(outpath.clone());
        if self.http_client.is_none() {
            let client = reqwest::blocking::Client::builder()
                .timeout(Duration::new(10, 0))
                .gzip(true)
                .build()
                .map_err(|e| MpdGrabError::ManifestFetch(format!("building HTTP client: {e}")))?;
            self.http_client = Some(client);
        }
        fetch_mpd(self)?;
        Ok(outpath)
    }
}

/// Derive an output file name from a manifest URL: scheme, "www." and the ".mpd" suffix go,
/// whatever remains is sanitised into a usable file name.
pub fn generate_filename_from_url(url: &str) -> PathBuf {
    let trimmed = url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_start_matches("www.");
    let trimmed = trimmed.strip_suffix(".mpd").unwrap_or(trimmed);
    PathBuf::from(sanitise_file_name::sanitise(trimmed) + ".mp4")
}

// A dispatched track waiting for its segments: everything needed to join the downloads,
// reassemble, and describe the result.
struct TrackPlan {
    name: String,
    content_type: ContentType,
    representation_id: String,
    language: String,
    codec: String,
    sample_rate: Option<u64>,
    prefix: PathBuf,
    extension: &'static str,
    segment_count: usize,
    done_rx: Receiver<SegmentOutcome>,
}

fn fetch_mpd(downloader: MpdDownloader) -> Result<(), MpdGrabError> {
    let client = downloader.http_client.clone().expect("HTTP client is set by download entry points");
    let tmpdir = tempfile::Builder::new()
        .prefix("mpdgrab")
        .tempdir()
        .map_err(|e| MpdGrabError::Io(e, "creating temporary directory".to_string()))?;
    let pool = WorkerPool::launch(client, downloader.worker_count);
    let result = run_pipeline(&downloader, &pool, tmpdir.path());
    pool.close();
    result
}

fn run_pipeline(
    downloader: &MpdDownloader,
    pool: &WorkerPool,
    tmpdir: &Path,
) -> Result<(), MpdGrabError> {
    let output_path = downloader.output_path.as_ref().expect("output path is set by download entry points");
    info!("fetching DASH manifest {}", downloader.mpd_url);
    let manifest_path = tmpdir.join("manifest.mpd");
    pool.fetch_manifest(&downloader.mpd_url, &manifest_path)?;
    let xml = fs::read_to_string(&manifest_path)
        .map_err(|e| MpdGrabError::Io(e, "reading downloaded manifest".to_string()))?;
    let mpd = parse(&xml)?;
    // the manifest file has served its purpose
    let _ = fs::remove_file(&manifest_path);

    if mpd.mpdtype.as_deref() == Some("dynamic") {
        return Err(MpdGrabError::UnsupportedManifest(
            "dynamic MPD manifests (live streams) are not supported".to_string()));
    }

    let manifest_url = Url::parse(&downloader.mpd_url)
        .map_err(|e| MpdGrabError::ManifestFetch(format!("invalid manifest URL: {e}")))?;
    let toplevel_base = resolve_base(&manifest_url, &mpd.base_url)?;

    let mut plans: Vec<TrackPlan> = Vec::new();
    let mut track_errors: Vec<(String, MpdGrabError)> = Vec::new();
    let mut eligible = 0usize;

    if downloader.verbosity > 0 {
        info!("manifest has {} Periods", mpd.periods.len());
    }
    for (period_idx, period) in mpd.periods.iter().enumerate() {
        let period_base = match resolve_base(&toplevel_base, &period.BaseURL) {
            Ok(u) => u,
            Err(e) => {
                warn!("skipping Period {period_idx}: {e}");
                track_errors.push((format!("period {period_idx}"), e));
                continue;
            },
        };
        for (adapt_idx, adaptation) in period.adaptations.iter().enumerate() {
            let track_label = format!("p{period_idx}a{adapt_idx}");
            match plan_adaptation(downloader, adaptation, &period_base, tmpdir, &track_label, pool) {
                Ok(Some(plan)) => {
                    eligible += 1;
                    plans.push(plan);
                },
                Ok(None) => (),
                Err(e) => {
                    warn!("skipping adaptation set {track_label}: {e}");
                    track_errors.push((track_label, e));
                },
            }
        }
    }

    // every track is dispatched; now join them one by one and reassemble
    let mut audio_tracks = Vec::new();
    let mut video_tracks = Vec::new();
    let mut text_tracks = Vec::new();
    for plan in plans {
        match finish_track(&plan) {
            Ok(track) => match track.media_type {
                ContentType::Audio => audio_tracks.push(track),
                ContentType::Video => video_tracks.push(track),
                ContentType::Text => text_tracks.push(track),
                ContentType::Unknown => (),
            },
            Err(e) => {
                warn!("track {} failed: {e}", plan.name);
                track_errors.push((plan.name, e));
            },
        }
    }

    let succeeded = audio_tracks.len() + video_tracks.len() + text_tracks.len();
    if succeeded == 0 {
        if let Some((_, e)) = track_errors.into_iter().next() {
            return Err(e);
        }
        if eligible == 0 {
            return Err(MpdGrabError::Resolution(
                "no adaptation sets matched the requested filters".to_string()));
        }
        return Err(MpdGrabError::SegmentFetch(
            "no tracks were successfully downloaded".to_string()));
    }
    for (name, e) in &track_errors {
        warn!("continuing without {name}: {e}");
    }

    if downloader.keep_tracks {
        return keep_track_files(output_path, &audio_tracks, &video_tracks, &text_tracks);
    }
    mux(output_path, &audio_tracks, &video_tracks, &text_tracks)?;
    info!("wrote {}", output_path.display());
    Ok(())
}

// Decide whether an adaptation set is wanted and, if so, enumerate and dispatch its segment
// downloads. Returns Ok(None) when the set is filtered out.
fn plan_adaptation(
    downloader: &MpdDownloader,
    adaptation: &AdaptationSet,
    period_base: &Url,
    tmpdir: &Path,
    track_label: &str,
    pool: &WorkerPool,
) -> Result<Option<TrackPlan>, MpdGrabError> {
    let content_type = adaptation.effective_content_type();
    if content_type == ContentType::Unknown {
        warn!("can't determine the content type of adaptation set {track_label}, skipping");
        return Ok(None);
    }
    let wanted = match content_type {
        ContentType::Audio => downloader.fetch_audio,
        ContentType::Video => downloader.fetch_video,
        ContentType::Text => downloader.fetch_subtitles,
        ContentType::Unknown => false,
    };
    if !wanted {
        return Ok(None);
    }
    // The language filter is inclusive: a stream with no declared language or an undetermined
    // one is never filtered away.
    if !downloader.language_filter.is_empty() {
        if let Some(lang) = &adaptation.lang {
            if !lang.is_empty()
                && lang != "und"
                && !downloader.language_filter.iter().any(|l| l == lang)
            {
                debug!("language {lang} not in the requested set, skipping {track_label}");
                return Ok(None);
            }
        }
    }

    let Some(representation) = select_representation(content_type, &adaptation.representations)
    else {
        return Err(MpdGrabError::Resolution(
            "no representation could be selected".to_string()));
    };
    if downloader.verbosity > 0 {
        info!("selected {} representation {} (bandwidth {})",
              content_type,
              representation.id.as_deref().unwrap_or("?"),
              representation.bandwidth.unwrap_or(0));
    }

    let adaptation_base = resolve_base(period_base, &adaptation.BaseURL)?;
    let representation_base = resolve_base(&adaptation_base, &representation.BaseURL)?;
    let urls = enumerate_segment_urls(
        representation,
        adaptation.SegmentTemplate.as_ref(),
        &representation_base,
    )?;
    if urls.is_empty() {
        return Err(MpdGrabError::Resolution("no segment URLs were produced".to_string()));
    }

    let representation_id = representation.id.clone()
        .unwrap_or_else(|| track_label.to_string());
    let name = sanitise_file_name::sanitise(&format!("{track_label}-{representation_id}"));
    let prefix = tmpdir.join(&name);
    let language = adaptation.lang.clone()
        .or_else(|| representation.lang.clone())
        .unwrap_or_else(|| "und".to_string());
    let codec = representation.codecs.clone()
        .or_else(|| adaptation.codecs.clone())
        .unwrap_or_default();
    let sample_rate = representation.audioSamplingRate.or(adaptation.audioSamplingRate);
    let extension = guessed_extension(content_type, &codec, representation, adaptation);

    let total = urls.len();
    let (done_tx, done_rx) = mpsc::channel();
    let mut jobs = Vec::with_capacity(total);
    for (pos, url) in urls.into_iter().enumerate() {
        let mut path = prefix.clone().into_os_string();
        path.push(format!("{SEGMENT_SUFFIX}{pos}"));
        jobs.push(SegmentJob {
            class: content_type,
            url,
            path: PathBuf::from(path),
            pos,
            total,
            done: done_tx.clone(),
        });
    }
    // every job holds a clone of the sender; dropping ours lets the receiver see the end of the
    // track once all jobs have reported
    drop(done_tx);
    pool.dispatch(jobs)?;

    Ok(Some(TrackPlan {
        name,
        content_type,
        representation_id,
        language,
        codec,
        sample_rate,
        prefix,
        extension,
        segment_count: total,
        done_rx,
    }))
}

// Wait for every segment of the track, then reassemble them into the track file.
fn finish_track(plan: &TrackPlan) -> Result<OutputTrack, MpdGrabError> {
    let mut first_error: Option<MpdGrabError> = None;
    let mut completed = 0usize;
    for outcome in plan.done_rx.iter() {
        completed += 1;
        if let Some(e) = outcome.error {
            warn!("segment {} of {} failed: {e}", outcome.pos + 1, plan.name);
            if first_error.is_none() {
                first_error = Some(e);
            }
        }
        if completed == plan.segment_count {
            break;
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }
    if completed != plan.segment_count {
        return Err(MpdGrabError::SegmentFetch(format!(
            "only {completed} of {} segments of {} were attempted",
            plan.segment_count, plan.name)));
    }

    let mut track_path = plan.prefix.clone();
    track_path.set_extension(plan.extension);
    reassemble_file(&plan.prefix, &track_path, plan.segment_count, plan.content_type)?;
    Ok(OutputTrack {
        representation_id: plan.representation_id.clone(),
        language: plan.language.clone(),
        codec: plan.codec.clone(),
        sample_rate: plan.sample_rate,
        path: track_path,
        media_type: plan.content_type,
    })
}

// Without probing the media content we take the container extension from the declared codec,
// falling back to mp4 which is what DASH almost always carries.
fn guessed_extension(
    content_type: ContentType,
    codec: &str,
    representation: &Representation,
    adaptation: &AdaptationSet,
) -> &'static str {
    if content_type == ContentType::Text {
        let mime = representation.mimeType.as_deref()
            .or(adaptation.mimeType.as_deref())
            .unwrap_or("");
        if codec.starts_with("stpp") || mime.eq("application/ttml+xml") {
            return "ttml";
        }
        return "vtt";
    }
    if codec.contains("mp3") {
        "mp3"
    } else if codec.contains("vorbis") {
        "ogg"
    } else if codec.contains("opus") {
        "opus"
    } else if codec.contains("vp9") || codec.contains("vp09") || codec.contains("vp8") {
        "webm"
    } else {
        "mp4"
    }
}

// The keep-tracks mode: move the reassembled files next to the output path instead of muxing.
fn keep_track_files(
    output_path: &Path,
    audio: &[OutputTrack],
    video: &[OutputTrack],
    text: &[OutputTrack],
) -> Result<(), MpdGrabError> {
    let stem = output_path.with_extension("");
    for track in audio.iter().chain(video).chain(text) {
        let ext = track.path.extension().and_then(|e| e.to_str()).unwrap_or("mp4");
        let mut dest = stem.clone().into_os_string();
        dest.push(format!("-{}.{ext}", sanitise_file_name::sanitise(&track.representation_id)));
        let dest = PathBuf::from(dest);
        let data = fs::read(&track.path)
            .map_err(|e| MpdGrabError::Io(e, format!("reading {}", track.path.display())))?;
        fs::write(&dest, data)
            .map_err(|e| MpdGrabError::Io(e, format!("writing {}", dest.display())))?;
        info!("kept {} track at {}", track.media_type, dest.display());
    }
    Ok(())
}
