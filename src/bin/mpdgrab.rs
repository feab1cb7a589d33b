//! Command-line frontend for the mpdgrab library.

use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use mpdgrab::fetch::MpdDownloader;

#[derive(Parser, Debug)]
#[command(name = "mpdgrab", version,
          about = "Download the tracks of a DASH MPD stream and remux them with ffmpeg")]
struct Cli {
    /// URL of the mpeg-dash manifest to download.
    #[arg(long)]
    url: Option<String>,

    /// The manifest URL can also be passed as a positional argument.
    #[arg(value_name = "URL", hide = true)]
    url_arg: Option<String>,

    /// The name of the output file, without the extension.
    #[arg(long, default_value = "downloaded_video")]
    output: String,

    /// Download only the audio tracks.
    #[arg(long)]
    audio_only: bool,

    /// Download only the video tracks.
    #[arg(long)]
    video_only: bool,

    /// Download only the text tracks.
    #[arg(long)]
    text_only: bool,

    /// Download only the tracks for the specified languages (comma separated).
    #[arg(long, value_name = "LANGS")]
    langs_only: Option<String>,

    /// Set debug mode.
    #[arg(long)]
    debug: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.debug {
        "mpdgrab=debug,info"
    } else {
        "mpdgrab=info,warn"
    };
    tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_env_filter(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();

    let Some(url) = cli.url.or(cli.url_arg) else {
        eprintln!("You have to pass the URL of an mpd manifest.");
        return ExitCode::from(2);
    };

    let mut downloader = MpdDownloader::new(&url)
        .verbosity(if cli.debug { 2 } else { 1 });
    if cli.audio_only {
        downloader = downloader.fetch_video(false).fetch_subtitles(false);
    } else if cli.video_only {
        downloader = downloader.fetch_audio(false).fetch_subtitles(false);
    } else if cli.text_only {
        downloader = downloader.fetch_audio(false).fetch_video(false);
    }
    if let Some(langs) = &cli.langs_only {
        let langs: Vec<String> = langs
            .split(',')
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        downloader = downloader.limit_languages(langs);
    }

    let out = format!("{}.mp4", cli.output);
    match downloader.download_to(&out) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("failed to download {url}: {e}");
            ExitCode::from(1)
        },
    }
}
