//! Sample conversion, software volume and mixing.

use crate::sample::{SampleFormat, SampleSpec};
use crate::volume::ChannelVolumes;

pub fn silence_byte(format: SampleFormat) -> u8 {
    match format {
        SampleFormat::U8 => 0x80,
        _ => 0,
    }
}

pub fn silence(spec: &SampleSpec, nbytes: usize) -> Vec<u8> {
    vec![silence_byte(spec.format); spec.frame_align(nbytes)]
}

/// Decodes one sample to the -1.0..1.0 range.
pub fn read_sample(format: SampleFormat, bytes: &[u8]) -> f32 {
    match format {
        SampleFormat::U8 => (f32::from(bytes[0]) - 128.0) / 128.0,
        SampleFormat::S16Le => f32::from(i16::from_le_bytes([bytes[0], bytes[1]])) / 32_768.0,
        SampleFormat::S16Be => f32::from(i16::from_be_bytes([bytes[0], bytes[1]])) / 32_768.0,
        SampleFormat::S24Le => {
            let raw = i32::from_le_bytes([0, bytes[0], bytes[1], bytes[2]]) >> 8;
            raw as f32 / 8_388_608.0
        }
        SampleFormat::S32Le => {
            i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32 / 2_147_483_648.0
        }
        SampleFormat::S32Be => {
            i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32 / 2_147_483_648.0
        }
        SampleFormat::F32Le => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        SampleFormat::F32Be => f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
    }
}

pub fn write_sample(format: SampleFormat, value: f32, out: &mut [u8]) {
    let value = value.clamp(-1.0, 1.0);
    match format {
        SampleFormat::U8 => out[0] = (value * 127.0 + 128.0).round() as u8,
        SampleFormat::S16Le => {
            out[..2].copy_from_slice(&((value * 32_767.0).round() as i16).to_le_bytes())
        }
        SampleFormat::S16Be => {
            out[..2].copy_from_slice(&((value * 32_767.0).round() as i16).to_be_bytes())
        }
        SampleFormat::S24Le => {
            let raw = (value * 8_388_607.0).round() as i32;
            out[..3].copy_from_slice(&raw.to_le_bytes()[..3]);
        }
        SampleFormat::S32Le => {
            let raw = (f64::from(value) * 2_147_483_647.0).round() as i32;
            out[..4].copy_from_slice(&raw.to_le_bytes());
        }
        SampleFormat::S32Be => {
            let raw = (f64::from(value) * 2_147_483_647.0).round() as i32;
            out[..4].copy_from_slice(&raw.to_be_bytes());
        }
        SampleFormat::F32Le => out[..4].copy_from_slice(&value.to_le_bytes()),
        SampleFormat::F32Be => out[..4].copy_from_slice(&value.to_be_bytes()),
    }
}

fn channel_factors(volume: &ChannelVolumes, channels: usize) -> Vec<f32> {
    (0..channels)
        .map(|c| {
            // a single channel volume applies to every channel
            let v = if volume.channels() == 1 {
                volume.get(0)
            } else {
                volume.get(c.min(usize::from(volume.channels()).saturating_sub(1)))
            };
            v.to_linear() as f32
        })
        .collect()
}

/// Scales `data` in place.
pub fn apply_volume(data: &mut [u8], spec: &SampleSpec, volume: &ChannelVolumes) {
    if volume.is_norm() {
        return;
    }
    if volume.is_muted() {
        data.fill(silence_byte(spec.format));
        return;
    }
    let channels = usize::from(spec.channels);
    let size = spec.format.sample_size();
    let factors = channel_factors(volume, channels);
    for (n, sample) in data.chunks_exact_mut(size).enumerate() {
        let value = read_sample(spec.format, sample) * factors[n % channels];
        write_sample(spec.format, value, sample);
    }
}

/// One stream's contribution to a mix.
pub struct MixInput<'a> {
    pub data: &'a [u8],
    pub volume: &'a ChannelVolumes,
}

/// Sums the inputs with their volumes and the device volume applied on top.
pub fn mix(
    inputs: &[MixInput<'_>],
    spec: &SampleSpec,
    length: usize,
    device_volume: &ChannelVolumes,
    device_muted: bool,
) -> Vec<u8> {
    let length = spec.frame_align(length);
    let mut out = silence(spec, length);
    if device_muted || inputs.is_empty() {
        return out;
    }
    let channels = usize::from(spec.channels);
    let size = spec.format.sample_size();
    let device = channel_factors(device_volume, channels);
    let per_input: Vec<Vec<f32>> = inputs
        .iter()
        .map(|input| channel_factors(input.volume, channels))
        .collect();

    for (n, sample) in out.chunks_exact_mut(size).enumerate() {
        let offset = n * size;
        let channel = n % channels;
        let mut acc = 0.0f32;
        for (input, factors) in inputs.iter().zip(&per_input) {
            if let Some(bytes) = input.data.get(offset..offset + size) {
                acc += read_sample(spec.format, bytes) * factors[channel];
            }
        }
        write_sample(spec.format, acc * device[channel], sample);
    }
    out
}
