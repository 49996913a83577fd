//! Frame Capture Module
//!
//! Captures three representative stills (start, middle, end) from an
//! inspection video using the ffmpeg-next crate, and manages the transient
//! directory the stills are written to.

use anyhow::{anyhow, Context};
use ffmpeg::format::context::Input;
use ffmpeg::format::{input, Pixel};
use ffmpeg::media::Type;
use ffmpeg::software::scaling::{flag::Flags, Context as ScalingContext};
use ffmpeg::util::frame::video::Video;
use ffmpeg::Rational;
use ffmpeg_next as ffmpeg;
use image::{ImageBuffer, ImageOutputFormat, Rgb};
use log::{debug, info, warn};
use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};

use crate::error::{IngestError, Result};

/// Positional suffixes of the three captures, in placement order.
pub const CAPTURE_SUFFIXES: [&str; 3] = ["start", "middle", "end"];

/// Distance from either end of the clip at which the outer stills are
/// taken; the very first and last frames are often blank or blurred.
const EDGE_OFFSET_SECS: f64 = 2.0;

const CAPTURE_JPEG_QUALITY: u8 = 90;

/// FFmpeg's internal time unit (microseconds) per second.
const AV_TIME_BASE: f64 = 1_000_000.0;

type RgbFrame = ImageBuffer<Rgb<u8>, Vec<u8>>;

/// Picks the capture times for a clip of `duration` seconds.
pub fn capture_timestamps(duration: f64) -> [f64; 3] {
    [
        EDGE_OFFSET_SECS,
        duration / 2.0,
        (duration - EDGE_OFFSET_SECS).max(EDGE_OFFSET_SECS),
    ]
}

/// Deterministic capture filename: a hash of the video path plus the
/// positional suffix, so no two videos or positions collide.
pub fn capture_file_name(video: &Path, suffix: &str) -> String {
    let digest = md5::compute(video.to_string_lossy().as_bytes());
    let hash = format!("{:x}", digest);
    format!("capture_{}_{}.jpg", &hash[..8], suffix)
}

/// Produces still images from a video into a capture directory.
pub trait FrameExtractor {
    /// Returns the paths of the stills that were captured, in
    /// start/middle/end order. Frames that cannot be decoded are left out,
    /// so fewer than three paths may come back.
    fn extract(&mut self, video: &Path, capture_dir: &Path) -> Result<Vec<PathBuf>>;
}

impl<T: FrameExtractor + ?Sized> FrameExtractor for &mut T {
    fn extract(&mut self, video: &Path, capture_dir: &Path) -> Result<Vec<PathBuf>> {
        (**self).extract(video, capture_dir)
    }
}

/// Metadata needed to place the capture times.
#[derive(Debug, Clone, Copy)]
pub struct VideoInfo {
    pub frame_count: u64,
    pub fps: f64,
}

impl VideoInfo {
    pub fn duration(&self) -> f64 {
        self.frame_count as f64 / self.fps
    }
}

/// [`FrameExtractor`] backed by the platform's FFmpeg decoders.
pub struct FfmpegFrameExtractor;

impl FfmpegFrameExtractor {
    pub fn new() -> anyhow::Result<Self> {
        ffmpeg::init().context("Failed to initialize FFmpeg")?;
        ffmpeg::log::set_level(ffmpeg::log::Level::Quiet);
        Ok(Self)
    }
}

impl FrameExtractor for FfmpegFrameExtractor {
    fn extract(&mut self, video: &Path, capture_dir: &Path) -> Result<Vec<PathBuf>> {
        let failure = |e: anyhow::Error| IngestError::Extraction {
            video: video.to_path_buf(),
            reason: format!("{:#}", e),
        };

        let info = probe_video(video).map_err(failure)?;
        let times = capture_timestamps(info.duration());
        debug!(
            "{:?}: {} frames at {:.2} fps ({:.1}s), capturing at {:?}",
            video,
            info.frame_count,
            info.fps,
            info.duration(),
            times
        );

        let grabbed = grab_frames_at(video, &times, info.fps).map_err(failure)?;

        let mut captured = Vec::with_capacity(CAPTURE_SUFFIXES.len());
        for ((suffix, time), frame) in CAPTURE_SUFFIXES.iter().zip(times).zip(grabbed) {
            let Some(frame) = frame else {
                warn!("Frame capture failed at {:.1}s in {:?}", time, video);
                continue;
            };
            let path = capture_dir.join(capture_file_name(video, suffix));
            match save_jpeg(&frame, &path) {
                Ok(()) => {
                    debug!("Captured {:?}", path);
                    captured.push(path);
                }
                Err(e) => warn!("Failed to save frame {:?}: {:#}", path, e),
            }
        }

        info!("Captured {} of 3 frames from {:?}", captured.len(), video);
        Ok(captured)
    }
}

/// Reads frame count and frame rate from the container metadata.
///
/// The count comes from the stream when the container records it and is
/// otherwise estimated from duration and average frame rate, so it can be an
/// estimate for variable frame rate videos.
pub fn probe_video(path: &Path) -> anyhow::Result<VideoInfo> {
    let ictx = input(path).context("Failed to open video file")?;
    let stream = ictx
        .streams()
        .best(Type::Video)
        .ok_or_else(|| anyhow!("Could not find video stream in file"))?;

    let mut frame_rate = stream.avg_frame_rate();
    if frame_rate.numerator() <= 0 || frame_rate.denominator() <= 0 {
        frame_rate = stream.rate();
    }
    if frame_rate.numerator() <= 0 || frame_rate.denominator() <= 0 {
        return Err(anyhow!("Could not determine frame rate"));
    }
    let fps = f64::from(frame_rate);

    let frames = stream.frames();
    if frames > 0 {
        return Ok(VideoInfo {
            frame_count: frames as u64,
            fps,
        });
    }

    // Duration is in AV_TIME_BASE units (microseconds).
    let duration = ictx.duration();
    if duration > 0 {
        let duration_secs = duration as f64 / 1_000_000.0;
        return Ok(VideoInfo {
            frame_count: (duration_secs * fps).round() as u64,
            fps,
        });
    }

    Err(anyhow!("Could not determine frame count from video metadata"))
}

/// Grabs one RGB image per capture time. Each time is reached by seeking to
/// the keyframe before it and decoding forward to the first frame at or
/// after it; a time past the last frame yields the last frame. A time that
/// cannot be reached yields `None`.
fn grab_frames_at(path: &Path, times: &[f64], fps: f64) -> anyhow::Result<Vec<Option<RgbFrame>>> {
    let mut ictx = input(path).context("Failed to open input file")?;
    let (video_stream_index, time_base, mut decoder) = {
        let stream = ictx
            .streams()
            .best(Type::Video)
            .context("Could not find video stream")?;
        let context_decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .context("Failed to create decoder context")?;
        let decoder = context_decoder
            .decoder()
            .video()
            .context("Failed to create video decoder")?;
        (stream.index(), stream.time_base(), decoder)
    };

    let mut scaler = ScalingContext::get(
        decoder.format(),
        decoder.width(),
        decoder.height(),
        Pixel::RGB24,
        decoder.width(),
        decoder.height(),
        Flags::BILINEAR,
    )
    .context("Failed to create scaler")?;

    // Half a frame of slack so rounding in the timestamps cannot skip a frame.
    let slack = 0.5 / fps;
    let mut frames = Vec::with_capacity(times.len());
    for &time in times {
        let position = (time * AV_TIME_BASE) as i64;
        if let Err(e) = ictx.seek(position, ..position) {
            warn!("Seek to {:.1}s failed in {:?}: {}", time, path, e);
            frames.push(None);
            continue;
        }
        decoder.flush();
        let target = FrameTarget {
            stream_index: video_stream_index,
            time_base,
            seconds: time - slack,
        };
        frames.push(decode_until(&mut ictx, &mut decoder, &mut scaler, &target)?);
    }
    Ok(frames)
}

struct FrameTarget {
    stream_index: usize,
    time_base: Rational,
    seconds: f64,
}

/// Decodes from the current position until a frame reaches the target time.
fn decode_until(
    ictx: &mut Input,
    decoder: &mut ffmpeg::decoder::Video,
    scaler: &mut ScalingContext,
    target: &FrameTarget,
) -> anyhow::Result<Option<RgbFrame>> {
    let mut decoded = Video::empty();
    let mut previous = Video::empty();
    let mut have_previous = false;

    for (stream, packet) in ictx.packets() {
        if stream.index() != target.stream_index {
            continue;
        }
        if decoder.send_packet(&packet).is_err() {
            // A corrupt packet loses its frames; later ones may still decode.
            continue;
        }
        while decoder.receive_frame(&mut decoded).is_ok() {
            if reaches(decoded.timestamp().or(decoded.pts()), target.time_base, target.seconds) {
                return to_rgb_image(scaler, &decoded).map(Some);
            }
            std::mem::swap(&mut decoded, &mut previous);
            have_previous = true;
        }
    }

    if decoder.send_eof().is_ok() {
        while decoder.receive_frame(&mut decoded).is_ok() {
            if reaches(decoded.timestamp().or(decoded.pts()), target.time_base, target.seconds) {
                return to_rgb_image(scaler, &decoded).map(Some);
            }
            std::mem::swap(&mut decoded, &mut previous);
            have_previous = true;
        }
    }

    if have_previous {
        to_rgb_image(scaler, &previous).map(Some)
    } else {
        Ok(None)
    }
}

/// Whether a frame stamped `pts` (in `time_base` units) is at or past
/// `seconds`. Frames without a timestamp are taken as they come.
fn reaches(pts: Option<i64>, time_base: Rational, seconds: f64) -> bool {
    match pts {
        Some(pts) => pts as f64 * f64::from(time_base) >= seconds,
        None => true,
    }
}

/// Converts a decoded frame to a packed RGB image, dropping row padding.
fn to_rgb_image(scaler: &mut ScalingContext, decoded: &Video) -> anyhow::Result<RgbFrame> {
    let mut rgb_frame = Video::empty();
    scaler.run(decoded, &mut rgb_frame).context("Scaler failed")?;

    let frame_data = rgb_frame.data(0);
    let width = rgb_frame.width() as usize;
    let height = rgb_frame.height() as usize;
    let stride = rgb_frame.stride(0);

    if stride == 0 {
        return Err(anyhow!("Invalid frame stride"));
    }

    let mut pixels = Vec::with_capacity(width * height * 3);
    for y in 0..height {
        let start_index = y * stride;
        let end_index = start_index + (width * 3);
        if end_index > frame_data.len() {
            return Err(anyhow!("Frame data is smaller than expected"));
        }
        pixels.extend_from_slice(&frame_data[start_index..end_index]);
    }

    ImageBuffer::from_vec(width as u32, height as u32, pixels)
        .context("Failed to create image buffer from frame data")
}

fn save_jpeg(frame: &RgbFrame, path: &Path) -> anyhow::Result<()> {
    let mut encoded = Vec::new();
    frame
        .write_to(
            &mut Cursor::new(&mut encoded),
            ImageOutputFormat::Jpeg(CAPTURE_JPEG_QUALITY),
        )
        .context("Failed to encode JPEG")?;
    fs::write(path, encoded).with_context(|| format!("Failed to write {:?}", path))?;
    Ok(())
}

/// Scoped directory for capture artifacts.
///
/// A directory this guard creates is removed with everything in it. A
/// directory that already existed is left in place and only the captures
/// registered with [`CaptureDir::track`] are deleted from it.
pub struct CaptureDir {
    path: PathBuf,
    created: bool,
    tracked: Vec<PathBuf>,
}

impl CaptureDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            created: false,
            tracked: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates the directory if it does not exist yet.
    pub fn ensure(&mut self) -> Result<&Path> {
        if !self.created && !self.path.is_dir() {
            fs::create_dir_all(&self.path)?;
            self.created = true;
            debug!("Created capture directory {:?}", self.path);
        }
        Ok(&self.path)
    }

    /// Registers files written into the directory so cleanup removes them.
    pub fn track(&mut self, files: &[PathBuf]) {
        self.tracked.extend(files.iter().cloned());
    }

    /// Removes this run's captures now instead of waiting for drop.
    pub fn cleanup(&mut self) {
        if self.created {
            match fs::remove_dir_all(&self.path) {
                Ok(()) => info!("Removed capture directory {:?}", self.path),
                Err(e) => warn!("Failed to remove capture directory {:?}: {}", self.path, e),
            }
            self.created = false;
        } else {
            for file in &self.tracked {
                match fs::remove_file(file) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => warn!("Failed to remove capture {:?}: {}", file, e),
                }
            }
        }
        self.tracked.clear();
    }
}

impl Drop for CaptureDir {
    fn drop(&mut self) {
        self.cleanup();
    }
}
