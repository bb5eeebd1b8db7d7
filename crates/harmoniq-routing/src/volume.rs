//! Per-channel volume vectors and their arithmetic.
//!
//! Volumes are integers on a cubic scale: [`Volume::NORM`] is unity gain and
//! [`Volume::MUTED`] silence. Multiplication and division of two volumes
//! operate directly on the integer domain, which corresponds to multiplying
//! the cubic-mapped linear amplitudes.

use std::collections::BTreeMap;

use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};

use crate::sample::{ChannelMap, SampleSpec, CHANNELS_MAX};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Volume(pub u32);

impl Volume {
    pub const MUTED: Volume = Volume(0);
    pub const NORM: Volume = Volume(0x10000);
    pub const MAX: Volume = Volume(u32::MAX / 2);

    pub fn is_valid(self) -> bool {
        self <= Self::MAX
    }

    /// Volume as a fraction of unity on the user-facing scale.
    pub fn from_fraction(fraction: f64) -> Volume {
        let raw = (fraction.max(0.0) * f64::from(Self::NORM.0)).round();
        Volume(raw.min(f64::from(Self::MAX.0)) as u32)
    }

    pub fn fraction(self) -> f64 {
        f64::from(self.0) / f64::from(Self::NORM.0)
    }

    /// Linear amplitude factor used when scaling samples.
    pub fn to_linear(self) -> f64 {
        let f = self.fraction();
        f * f * f
    }

    pub fn from_linear(linear: f64) -> Volume {
        if linear <= 0.0 {
            return Volume::MUTED;
        }
        Volume::from_fraction(linear.cbrt())
    }

    pub fn multiply(self, other: Volume) -> Volume {
        let norm = u64::from(Self::NORM.0);
        let result = (u64::from(self.0) * u64::from(other.0) + norm / 2) / norm;
        Volume(result.min(u64::from(Self::MAX.0)) as u32)
    }

    pub fn divide(self, other: Volume) -> Volume {
        if other == Volume::MUTED {
            return Volume::MUTED;
        }
        let norm = u64::from(Self::NORM.0);
        let divisor = u64::from(other.0);
        let result = (u64::from(self.0) * norm + divisor / 2) / divisor;
        Volume(result.min(u64::from(Self::MAX.0)) as u32)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "Vec<Volume>", try_from = "Vec<Volume>")]
pub struct ChannelVolumes {
    values: ArrayVec<Volume, CHANNELS_MAX>,
}

impl ChannelVolumes {
    pub fn uniform(channels: u8, volume: Volume) -> Self {
        let count = usize::from(channels).clamp(1, CHANNELS_MAX);
        let mut values = ArrayVec::new();
        for _ in 0..count {
            values.push(volume);
        }
        Self { values }
    }

    pub fn norm(channels: u8) -> Self {
        Self::uniform(channels, Volume::NORM)
    }

    pub fn muted(channels: u8) -> Self {
        Self::uniform(channels, Volume::MUTED)
    }

    pub fn from_values(values: &[Volume]) -> Option<Self> {
        if values.is_empty() || values.len() > CHANNELS_MAX {
            return None;
        }
        let mut out = ArrayVec::new();
        out.try_extend_from_slice(values).ok()?;
        Some(Self { values: out })
    }

    pub fn channels(&self) -> u8 {
        self.values.len() as u8
    }

    pub fn values(&self) -> &[Volume] {
        &self.values
    }

    pub fn get(&self, channel: usize) -> Volume {
        self.values.get(channel).copied().unwrap_or(Volume::MUTED)
    }

    pub fn set_channel(&mut self, channel: usize, volume: Volume) {
        if let Some(slot) = self.values.get_mut(channel) {
            *slot = volume;
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.values.is_empty() && self.values.iter().all(|v| v.is_valid())
    }

    pub fn is_compatible(&self, spec: &SampleSpec) -> bool {
        self.channels() == spec.channels
    }

    pub fn is_compatible_with_map(&self, map: &ChannelMap) -> bool {
        self.channels() == map.channels()
    }

    /// Matches the spec exactly or is a single value to apply uniformly.
    pub fn fits(&self, spec: &SampleSpec) -> bool {
        self.is_compatible(spec) || self.channels() == 1
    }

    pub fn is_norm(&self) -> bool {
        self.values.iter().all(|v| *v == Volume::NORM)
    }

    pub fn is_muted(&self) -> bool {
        self.values.iter().all(|v| *v == Volume::MUTED)
    }

    pub fn max(&self) -> Volume {
        self.values.iter().copied().max().unwrap_or(Volume::MUTED)
    }

    pub fn avg(&self) -> Volume {
        if self.values.is_empty() {
            return Volume::MUTED;
        }
        let sum: u64 = self.values.iter().map(|v| u64::from(v.0)).sum();
        Volume((sum / self.values.len() as u64) as u32)
    }

    /// Scales all channels so that the loudest one equals `max`, keeping the
    /// balance between channels.
    pub fn scale(&self, max: Volume) -> Self {
        let current = self.max();
        if current == Volume::MUTED {
            return Self::uniform(self.channels(), max);
        }
        let mut out = self.clone();
        for value in out.values.iter_mut() {
            let scaled = u64::from(value.0) * u64::from(max.0) / u64::from(current.0);
            *value = Volume(scaled.min(u64::from(Volume::MAX.0)) as u32);
        }
        out
    }

    pub fn multiply(&self, other: &ChannelVolumes) -> Self {
        self.zip_with(other, Volume::multiply)
    }

    pub fn multiply_scalar(&self, scalar: Volume) -> Self {
        self.map(|v| v.multiply(scalar))
    }

    pub fn divide(&self, other: &ChannelVolumes) -> Self {
        self.zip_with(other, Volume::divide)
    }

    pub fn divide_scalar(&self, scalar: Volume) -> Self {
        self.map(|v| v.divide(scalar))
    }

    /// Channel-wise maximum.
    pub fn merge(&self, other: &ChannelVolumes) -> Self {
        self.zip_with(other, Volume::max)
    }

    fn map(&self, f: impl Fn(Volume) -> Volume) -> Self {
        let mut out = self.clone();
        for value in out.values.iter_mut() {
            *value = f(*value);
        }
        out
    }

    fn zip_with(&self, other: &ChannelVolumes, f: impl Fn(Volume, Volume) -> Volume) -> Self {
        let mut out = ArrayVec::new();
        for (a, b) in self.values.iter().zip(other.values.iter()) {
            out.push(f(*a, *b));
        }
        if out.is_empty() {
            out.push(Volume::MUTED);
        }
        Self { values: out }
    }

    /// Remaps a volume from one channel layout to another. Channels with the
    /// same position are averaged; otherwise channels on the same side are
    /// used, and the overall average is the last resort.
    pub fn remap(&self, from: &ChannelMap, to: &ChannelMap) -> Self {
        if from == to {
            return self.clone();
        }
        if !self.is_compatible_with_map(from) {
            return Self::uniform(to.channels(), self.max());
        }
        let mut out = ArrayVec::new();
        for target in to.positions() {
            let mut sum = 0u64;
            let mut count = 0u64;
            for (position, value) in from.positions().iter().zip(self.values.iter()) {
                if position == target {
                    sum += u64::from(value.0);
                    count += 1;
                }
            }
            if count == 0 {
                for (position, value) in from.positions().iter().zip(self.values.iter()) {
                    let same_side = (position.on_left() && target.on_left())
                        || (position.on_right() && target.on_right())
                        || (position.on_center() && target.on_center())
                        || (position.on_lfe() && target.on_lfe());
                    if same_side {
                        sum += u64::from(value.0);
                        count += 1;
                    }
                }
            }
            let value = if count == 0 {
                self.avg()
            } else {
                Volume((sum / count) as u32)
            };
            out.push(value);
        }
        Self { values: out }
    }

    /// Remaps `self` (in `from` layout) into `to`, preferring `template` (a
    /// volume already in `to` layout) when it maps back onto `self` exactly.
    /// Falls back to a flat vector at the maximum.
    pub fn remap_minimal_impact(
        &self,
        template: &ChannelVolumes,
        from: &ChannelMap,
        to: &ChannelMap,
    ) -> Self {
        if from == to {
            return self.clone();
        }
        if template.is_compatible_with_map(to) && template.remap(to, from) == *self {
            return template.clone();
        }
        Self::uniform(to.channels(), self.max())
    }
}

impl From<ChannelVolumes> for Vec<Volume> {
    fn from(volumes: ChannelVolumes) -> Self {
        volumes.values.to_vec()
    }
}

impl TryFrom<Vec<Volume>> for ChannelVolumes {
    type Error = String;

    fn try_from(value: Vec<Volume>) -> Result<Self, Self::Error> {
        ChannelVolumes::from_values(&value)
            .ok_or_else(|| format!("volume must have 1..={CHANNELS_MAX} channels"))
    }
}

/// Multiplies all named factors into one vector of `channels` channels.
pub fn combine_factors(items: &BTreeMap<String, ChannelVolumes>, channels: u8) -> ChannelVolumes {
    let mut combined = ChannelVolumes::norm(channels);
    for factor in items.values() {
        let factor = if factor.channels() == channels {
            factor.clone()
        } else {
            ChannelVolumes::uniform(channels, factor.max())
        };
        combined = combined.multiply(&factor);
    }
    combined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::ChannelPosition;

    fn cv(values: &[u32]) -> ChannelVolumes {
        let values: Vec<Volume> = values.iter().copied().map(Volume).collect();
        ChannelVolumes::from_values(&values).unwrap()
    }

    #[test]
    fn multiply_and_divide_invert() {
        let half = Volume::from_fraction(0.5);
        let ratio = half.divide(Volume::from_fraction(0.8));
        assert_eq!(ratio.multiply(Volume::from_fraction(0.8)), half);
        assert_eq!(half.divide(Volume::MUTED), Volume::MUTED);
        assert_eq!(Volume::NORM.multiply(Volume::NORM), Volume::NORM);
    }

    #[test]
    fn scale_keeps_balance() {
        let v = cv(&[0x8000, 0x4000]);
        let scaled = v.scale(Volume::NORM);
        assert_eq!(scaled, cv(&[0x10000, 0x8000]));
        assert_eq!(ChannelVolumes::muted(2).scale(Volume::NORM), ChannelVolumes::norm(2));
    }

    #[test]
    fn remap_mono_to_stereo_and_back() {
        let mono = ChannelMap::mono();
        let stereo = ChannelMap::stereo();
        let v = cv(&[0x9000]);
        let up = v.remap(&mono, &stereo);
        assert_eq!(up, cv(&[0x9000, 0x9000]));
        let down = cv(&[0x4000, 0x8000]).remap(&stereo, &mono);
        assert_eq!(down, cv(&[0x6000]));
    }

    #[test]
    fn remap_uses_sides_before_average() {
        let from = ChannelMap::from_positions(&[
            ChannelPosition::FrontLeft,
            ChannelPosition::FrontRight,
        ])
        .unwrap();
        let to = ChannelMap::from_positions(&[
            ChannelPosition::RearLeft,
            ChannelPosition::RearRight,
            ChannelPosition::Lfe,
        ])
        .unwrap();
        let out = cv(&[0x1000, 0x3000]).remap(&from, &to);
        assert_eq!(out, cv(&[0x1000, 0x3000, 0x2000]));
    }

    #[test]
    fn minimal_impact_prefers_template_then_flat_max() {
        let mono = ChannelMap::mono();
        let stereo = ChannelMap::stereo();
        let stream = cv(&[0x8000]);
        let template = cv(&[0x8000, 0x8000]);
        assert_eq!(stream.remap_minimal_impact(&template, &mono, &stereo), template);

        let unbalanced = cv(&[0x4000, 0xa000]);
        let remapped = stream.remap_minimal_impact(&unbalanced, &mono, &stereo);
        assert_eq!(remapped, cv(&[0x8000, 0x8000]));

        let wide = cv(&[0x2000, 0x6000]);
        let collapsed = wide.remap_minimal_impact(&cv(&[0x1000]), &stereo, &mono);
        assert_eq!(collapsed, cv(&[0x6000]));
    }

    #[test]
    fn factors_multiply() {
        let mut items = BTreeMap::new();
        items.insert("duck".to_string(), ChannelVolumes::uniform(2, Volume::from_fraction(0.5)));
        items.insert("fade".to_string(), ChannelVolumes::uniform(2, Volume::from_fraction(0.5)));
        let combined = combine_factors(&items, 2);
        assert_eq!(combined, ChannelVolumes::uniform(2, Volume::from_fraction(0.25)));
    }
}
