use super::{FrameSource, VideoOpener, VideoProbe};
use anyhow::{anyhow, Context, Result};
use image::RgbaImage;
use std::path::Path;

use ffmpeg_next::ffi;

/// Forward gaps larger than this are served by seeking instead of decoding through.
const SEEK_AHEAD_SEC: f64 = 2.0;
/// Slack when comparing frame times against requested timestamps.
const TIME_EPSILON: f64 = 1e-6;

/// Opens videos through ffmpeg-next.
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegOpener;

impl VideoOpener for FfmpegOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>> {
        Ok(Box::new(FfmpegReader::new(path)?))
    }
}

/// Last decoded frame, converted to RGBA.
struct DecodedFrame {
    time_sec: f64,
    image: RgbaImage,
}

/// Timestamp-addressed frame reader backed by FFmpeg via ffmpeg-next.
///
/// Sequential requests (the sampler always asks in increasing order) are
/// served by decoding forward; anything behind the decoder or far ahead of
/// it triggers a container seek.
pub struct FfmpegReader {
    input_ctx: ffmpeg_next::format::context::Input,
    decoder: ffmpeg_next::codec::decoder::Video,
    video_stream_index: usize,
    /// Created on the first frame (source format is only known then).
    scaler: Option<ffmpeg_next::software::scaling::Context>,
    time_base: f64,
    start_offset_sec: f64,
    probe: VideoProbe,
    current: Option<DecodedFrame>,
    /// Timestamp of the previous request; `current` is only reusable going forward.
    last_request: f64,
    reuse_packet: ffmpeg_next::codec::packet::Packet,
    eof_sent: bool,
}

// SAFETY: a reader is owned by exactly one job thread at a time. The raw
// pointers inside ffmpeg-next types are never shared across threads.
unsafe impl Send for FfmpegReader {}

impl FfmpegReader {
    pub fn new(path: &Path) -> Result<Self> {
        ffmpeg_next::init().context("Failed to initialize FFmpeg")?;

        if !path.exists() {
            return Err(anyhow!("Video file not found: {}", path.display()));
        }

        let input_ctx = ffmpeg_next::format::input(&path)
            .with_context(|| format!("Failed to open video file {}", path.display()))?;

        let video_stream = input_ctx
            .streams()
            .best(ffmpeg_next::media::Type::Video)
            .ok_or_else(|| anyhow!("No video stream found in {}", path.display()))?;
        let video_stream_index = video_stream.index();

        let time_base = f64::from(video_stream.time_base());
        let start_offset_sec = if video_stream.start_time() == ffi::AV_NOPTS_VALUE {
            0.0
        } else {
            (video_stream.start_time().max(0) as f64) * time_base
        };

        let rational_fps = video_stream.avg_frame_rate();
        let fps = if rational_fps.denominator() > 0 {
            rational_fps.numerator() as f64 / rational_fps.denominator() as f64
        } else {
            0.0
        };

        // Container duration first, stream duration as a fallback.
        let mut duration_sec = input_ctx.duration() as f64 / ffi::AV_TIME_BASE as f64;
        if !(duration_sec.is_finite() && duration_sec > 0.0) {
            duration_sec = (video_stream.duration().max(0) as f64) * time_base;
        }

        let decoder_ctx =
            ffmpeg_next::codec::context::Context::from_parameters(video_stream.parameters())
                .context("Failed to create decoder context")?;
        let decoder = decoder_ctx
            .decoder()
            .video()
            .context("Failed to open video decoder")?;

        let probe = VideoProbe {
            duration_sec: duration_sec.max(0.0),
            width: decoder.width(),
            height: decoder.height(),
            fps,
        };

        tracing::debug!(
            "FfmpegReader: opened {}, duration={:.2}s, fps={:.2}, size={}x{}",
            path.display(),
            probe.duration_sec,
            probe.fps,
            probe.width,
            probe.height
        );

        Ok(Self {
            input_ctx,
            decoder,
            video_stream_index,
            scaler: None,
            time_base,
            start_offset_sec,
            probe,
            current: None,
            last_request: f64::NEG_INFINITY,
            reuse_packet: ffmpeg_next::codec::packet::Packet::empty(),
            eof_sent: false,
        })
    }

    /// Retrieve the next decoded frame from the stream.
    /// Returns Ok(false) once the decoder is fully drained.
    fn decode_loop(&mut self, target_frame: &mut ffmpeg_next::util::frame::Video) -> Result<bool> {
        loop {
            // 1. Try to receive a decoded frame
            match self.decoder.receive_frame(target_frame) {
                Ok(()) => return Ok(true),
                Err(ffmpeg_next::Error::Other { errno: ffi::EAGAIN }) => {
                    if self.eof_sent {
                        return Ok(false);
                    }
                }
                Err(ffmpeg_next::Error::Eof) => return Ok(false),
                Err(e) => return Err(anyhow!("Decoder error: {}", e)),
            }

            // 2. Feed packets until we find a video packet or reach EOF
            let mut found_packet = false;
            while self.reuse_packet.read(&mut self.input_ctx).is_ok() {
                if self.reuse_packet.stream() == self.video_stream_index {
                    self.decoder
                        .send_packet(&self.reuse_packet)
                        .context("Failed to send packet to decoder")?;
                    found_packet = true;
                    break;
                }
            }

            if !found_packet {
                self.decoder
                    .send_eof()
                    .context("Failed to send EOF to decoder")?;
                self.eof_sent = true;
            }
        }
    }

    fn seek_to(&mut self, timestamp_sec: f64) -> Result<()> {
        let absolute = timestamp_sec + self.start_offset_sec;
        let timestamp = (absolute * ffi::AV_TIME_BASE as f64) as i64;
        self.input_ctx
            .seek(timestamp, ..timestamp)
            .context("Failed to seek")?;
        self.decoder.flush();
        self.eof_sent = false;
        self.scaler = None;
        self.current = None;
        Ok(())
    }

    fn frame_time(&self, frame: &ffmpeg_next::util::frame::Video) -> Option<f64> {
        frame
            .timestamp()
            .or_else(|| frame.pts())
            .map(|pts| pts as f64 * self.time_base - self.start_offset_sec)
    }

    /// Convert a decoded frame to an owned RGBA image.
    fn to_rgba(&mut self, frame: &ffmpeg_next::util::frame::Video) -> Result<RgbaImage> {
        let (width, height) = (frame.width(), frame.height());
        if self.scaler.is_none() {
            let scaler = ffmpeg_next::software::scaling::Context::get(
                frame.format(),
                width,
                height,
                ffmpeg_next::format::Pixel::RGBA,
                width,
                height,
                ffmpeg_next::software::scaling::Flags::BILINEAR,
            )
            .context("Failed to create scaler")?;
            self.scaler = Some(scaler);
        }
        let scaler = self
            .scaler
            .as_mut()
            .ok_or_else(|| anyhow!("Scaler unavailable"))?;

        let mut rgba = ffmpeg_next::util::frame::Video::empty();
        scaler.run(frame, &mut rgba).context("Scaler failed")?;

        // Rows are padded to the stride; copy them out tightly.
        let data = rgba.data(0);
        let stride = rgba.stride(0);
        let row_bytes = width as usize * 4;
        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for y in 0..height as usize {
            let src_offset = y * stride;
            pixels.extend_from_slice(&data[src_offset..src_offset + row_bytes]);
        }

        RgbaImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("Decoded frame buffer has the wrong size"))
    }
}

impl FrameSource for FfmpegReader {
    fn probe(&self) -> Result<VideoProbe> {
        Ok(self.probe)
    }

    fn extract(&mut self, timestamp_sec: f64) -> Result<RgbaImage> {
        let forward = timestamp_sec + TIME_EPSILON >= self.last_request;
        self.last_request = timestamp_sec;

        // Low source frame rates can make one frame cover several samples.
        if let Some(current) = &self.current {
            if forward && current.time_sec + TIME_EPSILON >= timestamp_sec {
                return Ok(current.image.clone());
            }
        }

        let behind = !forward;
        let far_ahead = self
            .current
            .as_ref()
            .map(|c| timestamp_sec - c.time_sec > SEEK_AHEAD_SEC)
            .unwrap_or(timestamp_sec > SEEK_AHEAD_SEC);
        if behind || far_ahead {
            self.seek_to(timestamp_sec)?;
        }

        let mut frame = ffmpeg_next::util::frame::Video::empty();
        let mut previous = ffmpeg_next::util::frame::Video::empty();
        let mut have_previous = false;
        loop {
            if !self.decode_loop(&mut frame)? {
                // Past the last frame: the tail of the video repeats it.
                if have_previous {
                    let image = self.to_rgba(&previous)?;
                    let time_sec = self.frame_time(&previous).unwrap_or(timestamp_sec);
                    self.current = Some(DecodedFrame {
                        time_sec,
                        image: image.clone(),
                    });
                    return Ok(image);
                }
                return match &self.current {
                    Some(last) => Ok(last.image.clone()),
                    None => Err(anyhow!("No frame decodable at {:.3}s", timestamp_sec)),
                };
            }

            let time_sec = self.frame_time(&frame).unwrap_or(timestamp_sec);
            if time_sec + TIME_EPSILON < timestamp_sec {
                std::mem::swap(&mut frame, &mut previous);
                have_previous = true;
                continue;
            }

            let image = self.to_rgba(&frame)?;
            self.current = Some(DecodedFrame {
                time_sec,
                image: image.clone(),
            });
            return Ok(image);
        }
    }
}
