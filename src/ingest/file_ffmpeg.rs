//! Local video decoding using FFmpeg.
//!
//! Random access is implemented as: decode forward when the target is close
//! ahead of the decoder position, otherwise seek to the target time, flush the
//! decoder and decode forward until the target frame is reached.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;

use super::{index_timestamp_ms, FrameSource};
use crate::frame::Frame;

/// Forward gaps up to this many frames are decoded instead of seeking.
const MAX_FORWARD_DECODE: u64 = 90;

pub(crate) struct FfmpegFileSource {
    path: String,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    time_base: f64,
    fps: Option<f64>,
    frame_count: u64,
    /// Index of the frame the decoder will produce next.
    next_index: u64,
    eof: bool,
}

impl FfmpegFileSource {
    pub(crate) fn open(path: &str) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&path)
            .with_context(|| format!("failed to open file input '{}' with ffmpeg", path))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("file has no video track"))?;
        let stream_index = input_stream.index();
        let time_base = f64::from(input_stream.time_base());
        let rate = f64::from(input_stream.avg_frame_rate());
        let fps = (rate.is_finite() && rate > 0.0).then_some(rate);
        let frame_count = match input_stream.frames() {
            n if n > 0 => n as u64,
            _ => {
                let secs = input.duration() as f64 / f64::from(ffmpeg::ffi::AV_TIME_BASE);
                fps.map_or(0, |fps| (secs * fps).floor().max(0.0) as u64)
            }
        };
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        Ok(Self {
            path: path.to_string(),
            input,
            stream_index,
            decoder,
            scaler,
            time_base,
            fps,
            frame_count,
            next_index: 0,
            eof: false,
        })
    }

    fn decode_next(&mut self) -> Result<Option<ffmpeg::frame::Video>> {
        let mut decoded = ffmpeg::frame::Video::empty();
        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                return Ok(Some(decoded));
            }
            if self.eof {
                return Ok(None);
            }
            match self.input.packets().next() {
                Some((stream, packet)) => {
                    if stream.index() == self.stream_index {
                        self.decoder
                            .send_packet(&packet)
                            .context("send packet to ffmpeg decoder")?;
                    }
                }
                None => {
                    self.decoder.send_eof().context("flush ffmpeg decoder")?;
                    self.eof = true;
                }
            }
        }
    }

    fn seek_to(&mut self, index: u64) -> Result<()> {
        let fps = self
            .fps
            .ok_or_else(|| anyhow!("cannot seek in {} without a frame rate", self.path))?;
        let target_us = (index as f64 / fps * f64::from(ffmpeg::ffi::AV_TIME_BASE)) as i64;
        self.input
            .seek(target_us, ..=target_us)
            .with_context(|| format!("seek to frame {} in {}", index, self.path))?;
        self.decoder.flush();
        self.eof = false;
        // Unknown until the first decoded frame reports its pts.
        self.next_index = 0;
        Ok(())
    }

    fn frame_index_of(&self, decoded: &ffmpeg::frame::Video) -> Option<u64> {
        let pts = decoded.timestamp()?;
        let fps = self.fps?;
        Some((pts as f64 * self.time_base * fps).round().max(0.0) as u64)
    }
}

impl FrameSource for FfmpegFileSource {
    fn describe(&self) -> String {
        self.path.clone()
    }

    fn frame_count(&self) -> u64 {
        self.frame_count
    }

    fn fps(&self) -> Option<f64> {
        self.fps
    }

    fn read_at(&mut self, index: u64) -> Result<Frame> {
        let ahead = index.checked_sub(self.next_index);
        if !matches!(ahead, Some(gap) if gap <= MAX_FORWARD_DECODE) {
            self.seek_to(index)?;
        }

        loop {
            let decoded = self
                .decode_next()?
                .ok_or_else(|| anyhow!("end of video before frame {}", index))?;
            let current = self.frame_index_of(&decoded).unwrap_or(self.next_index);
            self.next_index = current + 1;
            if current < index {
                continue;
            }

            let mut rgb_frame = ffmpeg::frame::Video::empty();
            self.scaler
                .run(&decoded, &mut rgb_frame)
                .context("scale frame to RGB")?;
            let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;
            return Frame::new(pixels, width, height, index, index_timestamp_ms(index, self.fps));
        }
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        let len = row_bytes * height as usize;
        let pixels = data
            .get(..len)
            .context("ffmpeg frame is shorter than its dimensions")?;
        return Ok((pixels.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
