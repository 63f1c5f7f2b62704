use std::io::{ErrorKind, Read};
use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// One fixed-size window of interleaved 16-bit samples.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    samples: Vec<i16>,
    channels: usize,
}

impl Frame {
    pub fn from_interleaved(samples: Vec<i16>, channels: usize) -> Result<Self> {
        if channels == 0 || samples.len() % channels != 0 {
            return Err(Error::config(format!(
                "{} samples cannot be split into {} channels",
                samples.len(),
                channels
            )));
        }
        Ok(Self { samples, channels })
    }

    /// Decodes a signed 16-bit little-endian interleaved buffer.
    pub fn from_le_bytes(bytes: &[u8], channels: usize) -> Result<Self> {
        if bytes.len() % 2 != 0 {
            return Err(Error::Acquisition(format!(
                "odd byte count {} in a 16-bit buffer",
                bytes.len()
            )));
        }
        let samples = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Self::from_interleaved(samples, channels)
    }

    /// Interleaves per-channel sample vectors of equal length.
    pub fn from_channels(channels: &[Vec<i16>]) -> Result<Self> {
        let count = channels.len();
        let len = channels.first().map_or(0, Vec::len);
        if count == 0 || channels.iter().any(|ch| ch.len() != len) {
            return Err(Error::config("channels must be non-empty and of equal length"));
        }
        let mut samples = Vec::with_capacity(count * len);
        for i in 0..len {
            for ch in channels {
                samples.push(ch[i]);
            }
        }
        Ok(Self {
            samples,
            channels: count,
        })
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    #[inline]
    pub fn samples_per_channel(&self) -> usize {
        self.samples.len() / self.channels
    }

    #[inline]
    pub fn sample(&self, ch: usize, i: usize) -> i16 {
        debug_assert!(ch < self.channels);
        self.samples[i * self.channels + ch]
    }

    #[inline]
    pub fn set_sample(&mut self, ch: usize, i: usize, value: i16) {
        debug_assert!(ch < self.channels);
        self.samples[i * self.channels + ch] = value;
    }

    pub fn channel(&self, ch: usize) -> impl Iterator<Item = i16> + '_ {
        self.samples.iter().skip(ch).step_by(self.channels).copied()
    }

    pub fn interleaved(&self) -> &[i16] {
        &self.samples
    }
}

/// RMS over every sample of the frame, all channels together.
pub fn estimate_level(frame: &Frame) -> f32 {
    let samples = frame.interleaved();
    if samples.is_empty() {
        return 0.0;
    }
    let total: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (total / samples.len() as f64).sqrt() as f32
}

/// A blocking producer of frames.
///
/// `Ok(None)` marks the end of the stream; `Err` is an acquisition failure.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

/// Frames read from a multi-channel 16-bit WAV recording.
pub struct WavFrameSource {
    samples: std::vec::IntoIter<i16>,
    channels: usize,
    frame_len: usize,
}

impl WavFrameSource {
    pub fn open(
        filepath: impl AsRef<Path>,
        channels: usize,
        sample_rate: u32,
        frame_len: usize,
    ) -> Result<Self> {
        let reader = hound::WavReader::open(filepath.as_ref())?;
        let spec = reader.spec();

        info!(
            path = %filepath.as_ref().display(),
            sample_rate = spec.sample_rate,
            channels = spec.channels,
            bits = spec.bits_per_sample,
            format = ?spec.sample_format,
            samples = reader.len(),
            "opened recording"
        );

        if spec.channels as usize != channels {
            return Err(Error::config(format!(
                "recording has {} channels, the array needs {}",
                spec.channels, channels
            )));
        }
        if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
            return Err(Error::config("only 16-bit integer PCM recordings are supported"));
        }
        if spec.sample_rate != sample_rate {
            return Err(Error::config(format!(
                "recording is {} Hz, pipeline expects {} Hz",
                spec.sample_rate, sample_rate
            )));
        }

        let samples: Vec<i16> = reader.into_samples::<i16>().collect::<std::result::Result<_, _>>()?;
        let total_frames = samples.len() / (channels * frame_len);
        debug!(total_frames, "recording split into frames");

        Ok(Self {
            samples: samples.into_iter(),
            channels,
            frame_len,
        })
    }
}

impl FrameSource for WavFrameSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let wanted = self.channels * self.frame_len;
        let chunk: Vec<i16> = self.samples.by_ref().take(wanted).collect();
        if chunk.len() < wanted {
            if !chunk.is_empty() {
                debug!(dropped = chunk.len(), "dropping trailing partial frame");
            }
            return Ok(None);
        }
        Frame::from_interleaved(chunk, self.channels).map(Some)
    }
}

/// Frames of raw S16LE interleaved samples read from any byte stream.
pub struct RawFrameSource<R: Read> {
    reader: R,
    channels: usize,
    buffer: Vec<u8>,
}

impl<R: Read> RawFrameSource<R> {
    pub fn new(reader: R, channels: usize, frame_len: usize) -> Self {
        Self {
            reader,
            channels,
            buffer: vec![0u8; channels * frame_len * 2],
        }
    }
}

impl<R: Read> FrameSource for RawFrameSource<R> {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let mut filled = 0;
        while filled < self.buffer.len() {
            match self.reader.read(&mut self.buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Acquisition(format!("read failed: {}", e))),
            }
        }
        if filled < self.buffer.len() {
            if filled > 0 {
                warn!(bytes = filled, "stream ended mid-frame");
            }
            return Ok(None);
        }
        Frame::from_le_bytes(&self.buffer, self.channels).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_channel_indexing() {
        let frame = Frame::from_channels(&[vec![1, 2, 3], vec![4, 5, 6]]).unwrap();
        assert_eq!(frame.interleaved(), &[1, 4, 2, 5, 3, 6]);
        assert_eq!(frame.samples_per_channel(), 3);
        assert_eq!(frame.sample(1, 2), 6);
        assert_eq!(frame.channel(0).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_rejects_ragged_buffer() {
        assert!(Frame::from_interleaved(vec![0; 7], 4).is_err());
        assert!(Frame::from_channels(&[vec![1, 2], vec![1]]).is_err());
    }

    #[test]
    fn test_le_decoding() {
        let bytes = [0x01, 0x00, 0xff, 0xff, 0x00, 0x80, 0xff, 0x7f];
        let frame = Frame::from_le_bytes(&bytes, 4).unwrap();
        assert_eq!(frame.interleaved(), &[1, -1, i16::MIN, i16::MAX]);
    }

    #[test]
    fn test_level_of_constant_frame() {
        let frame = Frame::from_interleaved(vec![-300; 16], 4).unwrap();
        assert!((estimate_level(&frame) - 300.0).abs() < 1e-3);
    }

    #[test]
    fn test_raw_source_ends_on_short_read() {
        let mut bytes = Vec::new();
        for v in 0..(4 * 3 * 2 + 3) as i16 {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let mut source = RawFrameSource::new(Cursor::new(bytes), 4, 3);
        let first = source.next_frame().unwrap().unwrap();
        assert_eq!(first.sample(0, 0), 0);
        let second = source.next_frame().unwrap().unwrap();
        assert_eq!(second.sample(0, 0), 12);
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_wav_source_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("four.wav");
        let spec = hound::WavSpec {
            channels: 4,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for i in 0..(4 * 25) {
            writer.write_sample(i as i16).unwrap();
        }
        writer.finalize().unwrap();

        let mut source = WavFrameSource::open(&path, 4, 16000, 10).unwrap();
        let frame = source.next_frame().unwrap().unwrap();
        assert_eq!(frame.sample(3, 9), 39);
        assert!(source.next_frame().unwrap().is_some());
        // 5 samples per channel left over, not enough for a frame
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_wav_source_rejects_stereo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        writer.write_sample(0i16).unwrap();
        writer.write_sample(0i16).unwrap();
        writer.finalize().unwrap();

        assert!(matches!(
            WavFrameSource::open(&path, 4, 16000, 10),
            Err(Error::Config(_))
        ));
    }
}
