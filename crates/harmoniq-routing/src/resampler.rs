//! Format, rate and channel-layout conversion between a stream and its device.

use std::fmt;

use bitflags::bitflags;

use crate::error::RoutingError;
use crate::mix::{read_sample, write_sample};
use crate::sample::{ChannelMap, ChannelPosition, SampleSpec};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ResamplerFlags: u8 {
        const VARIABLE_RATE = 1 << 0;
        const NO_REMAP = 1 << 1;
        const NO_REMIX = 1 << 2;
    }
}

/// A converter owned by one stream's realtime half.
pub trait Resampler: Send {
    fn input_spec(&self) -> &SampleSpec;
    fn output_spec(&self) -> &SampleSpec;
    fn output_map(&self) -> &ChannelMap;
    /// Input bytes needed to produce `out_bytes`, rounded up.
    fn request(&self, out_bytes: usize) -> usize;
    /// Output bytes produced from `in_bytes`, rounded down.
    fn result(&self, in_bytes: usize) -> usize;
    fn run(&mut self, input: &[u8]) -> Vec<u8>;
    /// Forgets conversion state covering the last `out_bytes` of output.
    fn rewind(&mut self, out_bytes: usize);
    fn reset(&mut self);
    fn max_block_size(&self) -> usize;
    fn set_input_rate(&mut self, rate: u32);
    fn set_output_rate(&mut self, rate: u32);
}

pub trait ResamplerFactory: Send + Sync {
    fn create(
        &self,
        input: (&SampleSpec, &ChannelMap),
        output: (&SampleSpec, &ChannelMap),
        flags: ResamplerFlags,
    ) -> Result<Box<dyn Resampler>, RoutingError>;
}

const MAX_BLOCK_FRAMES: usize = 16 * 1024;

/// Nearest-neighbour rate conversion with position based channel remapping.
pub struct NearestResampler {
    input: SampleSpec,
    output: SampleSpec,
    output_map: ChannelMap,
    routes: Vec<Vec<usize>>,
    position: f64,
}

impl fmt::Debug for NearestResampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NearestResampler")
            .field("input", &self.input)
            .field("output", &self.output)
            .finish()
    }
}

fn route_channels(from: &ChannelMap, to: &ChannelMap, flags: ResamplerFlags) -> Vec<Vec<usize>> {
    let from_positions = from.positions();
    to.positions()
        .iter()
        .enumerate()
        .map(|(n, target)| {
            if flags.contains(ResamplerFlags::NO_REMAP) {
                return vec![n % from_positions.len()];
            }
            if let Some(same) = from_positions.iter().position(|p| p == target) {
                return vec![same];
            }
            if flags.contains(ResamplerFlags::NO_REMIX) {
                return Vec::new();
            }
            let side: Vec<usize> = from_positions
                .iter()
                .enumerate()
                .filter(|(_, p)| {
                    (target.on_left() && p.on_left())
                        || (target.on_right() && p.on_right())
                        || (target.on_center() && p.on_center())
                        || (target.on_lfe() && p.on_lfe())
                })
                .map(|(idx, _)| idx)
                .collect();
            if !side.is_empty() {
                return side;
            }
            if *target == ChannelPosition::Mono || from_positions.contains(&ChannelPosition::Mono) {
                return (0..from_positions.len()).collect();
            }
            Vec::new()
        })
        .collect()
}

impl NearestResampler {
    pub fn new(
        input: (&SampleSpec, &ChannelMap),
        output: (&SampleSpec, &ChannelMap),
        flags: ResamplerFlags,
    ) -> Result<Self, RoutingError> {
        let (in_spec, in_map) = input;
        let (out_spec, out_map) = output;
        if !in_spec.is_valid() || !out_spec.is_valid() {
            return Err(RoutingError::Invalid("resampler sample spec"));
        }
        if !in_map.is_compatible(in_spec) || !out_map.is_compatible(out_spec) {
            return Err(RoutingError::Invalid("resampler channel map"));
        }
        Ok(Self {
            input: *in_spec,
            output: *out_spec,
            output_map: out_map.clone(),
            routes: route_channels(in_map, out_map, flags),
            position: 0.0,
        })
    }

    fn step(&self) -> f64 {
        f64::from(self.input.rate) / f64::from(self.output.rate)
    }
}

impl Resampler for NearestResampler {
    fn input_spec(&self) -> &SampleSpec {
        &self.input
    }

    fn output_spec(&self) -> &SampleSpec {
        &self.output
    }

    fn output_map(&self) -> &ChannelMap {
        &self.output_map
    }

    fn request(&self, out_bytes: usize) -> usize {
        let out_frame = self.output.frame_size();
        let frames = (out_bytes + out_frame - 1) / out_frame;
        let in_rate = u64::from(self.input.rate);
        let out_rate = u64::from(self.output.rate);
        let in_frames = (frames as u64 * in_rate + out_rate - 1) / out_rate;
        in_frames as usize * self.input.frame_size()
    }

    fn result(&self, in_bytes: usize) -> usize {
        let frames = (in_bytes / self.input.frame_size()) as u64;
        let out_frames = frames * u64::from(self.output.rate) / u64::from(self.input.rate);
        out_frames as usize * self.output.frame_size()
    }

    fn run(&mut self, input: &[u8]) -> Vec<u8> {
        let in_frame = self.input.frame_size();
        let in_channels = usize::from(self.input.channels);
        let in_size = self.input.format.sample_size();
        let out_size = self.output.format.sample_size();
        let frames_in = input.len() / in_frame;
        if frames_in == 0 {
            return Vec::new();
        }

        let step = self.step();
        let mut out = Vec::new();
        let mut frame_buf = vec![0u8; self.output.frame_size()];
        while self.position < frames_in as f64 {
            let source = (self.position as usize).min(frames_in - 1);
            let base = source * in_frame;
            for (channel, route) in self.routes.iter().enumerate() {
                let mut value = 0.0f32;
                for &from in route {
                    let at = base + (from % in_channels) * in_size;
                    value += read_sample(self.input.format, &input[at..at + in_size]);
                }
                if route.len() > 1 {
                    value /= route.len() as f32;
                }
                let at = channel * out_size;
                write_sample(self.output.format, value, &mut frame_buf[at..at + out_size]);
            }
            out.extend_from_slice(&frame_buf);
            self.position += step;
        }
        self.position -= frames_in as f64;
        out
    }

    fn rewind(&mut self, _out_bytes: usize) {
        self.position = 0.0;
    }

    fn reset(&mut self) {
        self.position = 0.0;
    }

    fn max_block_size(&self) -> usize {
        MAX_BLOCK_FRAMES * self.input.frame_size()
    }

    fn set_input_rate(&mut self, rate: u32) {
        if rate > 0 {
            self.input.rate = rate;
        }
    }

    fn set_output_rate(&mut self, rate: u32) {
        if rate > 0 {
            self.output.rate = rate;
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NearestResamplerFactory;

impl ResamplerFactory for NearestResamplerFactory {
    fn create(
        &self,
        input: (&SampleSpec, &ChannelMap),
        output: (&SampleSpec, &ChannelMap),
        flags: ResamplerFlags,
    ) -> Result<Box<dyn Resampler>, RoutingError> {
        Ok(Box::new(NearestResampler::new(input, output, flags)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::SampleFormat;

    fn spec(rate: u32, channels: u8) -> SampleSpec {
        SampleSpec::new(SampleFormat::S16Le, rate, channels)
    }

    #[test]
    fn request_rounds_up_and_result_rounds_down() {
        let input = spec(44_100, 2);
        let output = spec(48_000, 2);
        let stereo = ChannelMap::stereo();
        let r = NearestResampler::new((&input, &stereo), (&output, &stereo), ResamplerFlags::empty())
            .unwrap();
        // 480 output frames need 441 input frames
        assert_eq!(r.request(480 * 4), 441 * 4);
        assert_eq!(r.result(441 * 4), 480 * 4);
        assert_eq!(r.result(4), 4);
        assert_eq!(r.request(4), 4);
    }

    #[test]
    fn mono_is_spread_to_stereo() {
        let input = spec(48_000, 1);
        let output = spec(48_000, 2);
        let mut r = NearestResampler::new(
            (&input, &ChannelMap::mono()),
            (&output, &ChannelMap::stereo()),
            ResamplerFlags::empty(),
        )
        .unwrap();
        let data = 1_000i16.to_le_bytes();
        let out = r.run(&data);
        assert_eq!(out.len(), 4);
        assert_eq!(i16::from_le_bytes([out[2], out[3]]), 1_000);
    }

    #[test]
    fn upsampling_produces_more_frames() {
        let input = spec(24_000, 1);
        let output = spec(48_000, 1);
        let mono = ChannelMap::mono();
        let mut r =
            NearestResampler::new((&input, &mono), (&output, &mono), ResamplerFlags::empty()).unwrap();
        let out = r.run(&[0u8; 200]);
        assert_eq!(out.len(), 400);
    }
}
