//! Raw PCM helpers: sample conversion, gain and probe tone synthesis

use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::{SampleFormat, StreamFormat};

/// Decode interleaved PCM bytes into normalized f32 samples
pub fn to_f32(pcm: &[u8], format: SampleFormat) -> Vec<f32> {
    match format {
        SampleFormat::I16 => pcm
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
            .collect(),
        SampleFormat::F32 => pcm
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    }
}

/// Encode normalized f32 samples into interleaved PCM bytes
pub fn from_f32(samples: &[f32], format: SampleFormat) -> Bytes {
    let mut buf = BytesMut::with_capacity(samples.len() * format.bytes_per_sample());
    for &s in samples {
        match format {
            SampleFormat::I16 => buf.put_i16_le(f32_to_i16(s)),
            SampleFormat::F32 => buf.put_f32_le(s),
        }
    }
    buf.freeze()
}

#[inline]
fn f32_to_i16(s: f32) -> i16 {
    (s.clamp(-1.0, 1.0) * 32767.0).round() as i16
}

/// Scale PCM by `gain`. Unity gain returns the input without copying.
pub fn apply_gain(pcm: &Bytes, format: SampleFormat, gain: f32) -> Bytes {
    if (gain - 1.0).abs() < f32::EPSILON {
        return pcm.clone();
    }

    let mut out = BytesMut::with_capacity(pcm.len());
    match format {
        SampleFormat::I16 => {
            for b in pcm.chunks_exact(2) {
                let s = i16::from_le_bytes([b[0], b[1]]) as f32 * gain;
                out.put_i16_le(s.clamp(i16::MIN as f32, i16::MAX as f32) as i16);
            }
        }
        SampleFormat::F32 => {
            for b in pcm.chunks_exact(4) {
                out.put_f32_le(f32::from_le_bytes([b[0], b[1], b[2], b[3]]) * gain);
            }
        }
    }
    out.freeze()
}

/// Mono sine tone with linear fade in/out, used as the calibration probe
/// and as the reference for acoustic detection.
pub fn tone(sample_rate: u32, frames: usize, frequency: f32, amplitude: f32) -> Vec<f32> {
    let fade = (sample_rate as usize / 1000).min(frames / 2).max(1);
    let step = 2.0 * std::f32::consts::PI * frequency / sample_rate as f32;

    (0..frames)
        .map(|i| {
            let envelope = if i < fade {
                i as f32 / fade as f32
            } else if i >= frames - fade {
                (frames - 1 - i) as f32 / fade as f32
            } else {
                1.0
            };
            (i as f32 * step).sin() * envelope * amplitude
        })
        .collect()
}

/// Probe tone rendered in `format`, duplicated on every channel, exactly
/// `len` bytes long (rounded down to whole sample frames).
pub fn probe_tone(format: StreamFormat, len: usize, frequency: f32, amplitude: f32) -> Bytes {
    let frames = len / format.bytes_per_frame().max(1);
    let mono = tone(format.sample_rate, frames, frequency, amplitude);

    let mut interleaved = Vec::with_capacity(frames * format.channels as usize);
    for s in mono {
        interleaved.extend(std::iter::repeat(s).take(format.channels as usize));
    }
    from_f32(&interleaved, format.sample_format)
}
