//! Sample specifications, channel maps and format descriptors.

use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};

use crate::error::RoutingError;

pub const CHANNELS_MAX: usize = 32;
pub const RATE_MAX: u32 = 48_000 * 16;
pub const USEC_PER_SEC: u64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    U8,
    S16Le,
    S16Be,
    S24Le,
    S32Le,
    S32Be,
    F32Le,
    F32Be,
}

impl SampleFormat {
    pub fn sample_size(self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16Le | SampleFormat::S16Be => 2,
            SampleFormat::S24Le => 3,
            SampleFormat::S32Le | SampleFormat::S32Be | SampleFormat::F32Le | SampleFormat::F32Be => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SampleSpec {
    pub format: SampleFormat,
    pub rate: u32,
    pub channels: u8,
}

impl Default for SampleSpec {
    fn default() -> Self {
        Self {
            format: SampleFormat::S16Le,
            rate: 44_100,
            channels: 2,
        }
    }
}

impl SampleSpec {
    pub fn new(format: SampleFormat, rate: u32, channels: u8) -> Self {
        Self {
            format,
            rate,
            channels,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.rate > 0
            && self.rate <= RATE_MAX
            && self.channels > 0
            && usize::from(self.channels) <= CHANNELS_MAX
    }

    pub fn frame_size(&self) -> usize {
        self.format.sample_size() * usize::from(self.channels)
    }

    pub fn bytes_per_second(&self) -> usize {
        self.frame_size() * self.rate as usize
    }

    pub fn frame_align(&self, bytes: usize) -> usize {
        let frame = self.frame_size().max(1);
        bytes - bytes % frame
    }

    pub fn usec_to_bytes(&self, usec: u64) -> usize {
        let frames = usec.saturating_mul(u64::from(self.rate)) / USEC_PER_SEC;
        (frames as usize).saturating_mul(self.frame_size())
    }

    pub fn bytes_to_usec(&self, bytes: usize) -> u64 {
        let frame = self.frame_size().max(1) as u64;
        (bytes as u64 / frame).saturating_mul(USEC_PER_SEC) / u64::from(self.rate.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelPosition {
    Mono,
    FrontLeft,
    FrontRight,
    FrontCenter,
    RearCenter,
    RearLeft,
    RearRight,
    Lfe,
    FrontLeftOfCenter,
    FrontRightOfCenter,
    SideLeft,
    SideRight,
    TopCenter,
    TopFrontLeft,
    TopFrontRight,
    TopFrontCenter,
    TopRearLeft,
    TopRearRight,
    TopRearCenter,
    Aux(u8),
}

impl ChannelPosition {
    pub fn on_left(self) -> bool {
        matches!(
            self,
            ChannelPosition::FrontLeft
                | ChannelPosition::RearLeft
                | ChannelPosition::FrontLeftOfCenter
                | ChannelPosition::SideLeft
                | ChannelPosition::TopFrontLeft
                | ChannelPosition::TopRearLeft
        )
    }

    pub fn on_right(self) -> bool {
        matches!(
            self,
            ChannelPosition::FrontRight
                | ChannelPosition::RearRight
                | ChannelPosition::FrontRightOfCenter
                | ChannelPosition::SideRight
                | ChannelPosition::TopFrontRight
                | ChannelPosition::TopRearRight
        )
    }

    pub fn on_center(self) -> bool {
        matches!(
            self,
            ChannelPosition::FrontCenter
                | ChannelPosition::RearCenter
                | ChannelPosition::TopCenter
                | ChannelPosition::TopFrontCenter
                | ChannelPosition::TopRearCenter
                | ChannelPosition::FrontLeftOfCenter
                | ChannelPosition::FrontRightOfCenter
        )
    }

    pub fn on_lfe(self) -> bool {
        self == ChannelPosition::Lfe
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "Vec<ChannelPosition>", try_from = "Vec<ChannelPosition>")]
pub struct ChannelMap {
    positions: ArrayVec<ChannelPosition, CHANNELS_MAX>,
}

impl ChannelMap {
    pub fn from_positions(positions: &[ChannelPosition]) -> Option<Self> {
        if positions.is_empty() || positions.len() > CHANNELS_MAX {
            return None;
        }
        let mut map = ArrayVec::new();
        map.try_extend_from_slice(positions).ok()?;
        Some(Self { positions: map })
    }

    pub fn mono() -> Self {
        Self::default_for(1).unwrap_or_else(Self::fallback_stereo)
    }

    pub fn stereo() -> Self {
        Self::default_for(2).unwrap_or_else(Self::fallback_stereo)
    }

    fn fallback_stereo() -> Self {
        let mut positions = ArrayVec::new();
        positions.push(ChannelPosition::FrontLeft);
        positions.push(ChannelPosition::FrontRight);
        Self { positions }
    }

    /// Default layout for a channel count, following the usual WAVE ordering.
    pub fn default_for(channels: u8) -> Option<Self> {
        use ChannelPosition::*;
        let channels = usize::from(channels);
        if channels == 0 || channels > CHANNELS_MAX {
            return None;
        }
        let base: &[ChannelPosition] = match channels {
            1 => &[Mono],
            2 => &[FrontLeft, FrontRight],
            3 => &[FrontLeft, FrontRight, FrontCenter],
            4 => &[FrontLeft, FrontRight, RearLeft, RearRight],
            5 => &[FrontLeft, FrontRight, FrontCenter, RearLeft, RearRight],
            6 => &[FrontLeft, FrontRight, FrontCenter, Lfe, RearLeft, RearRight],
            7 => &[FrontLeft, FrontRight, FrontCenter, Lfe, RearCenter, SideLeft, SideRight],
            _ => &[FrontLeft, FrontRight, FrontCenter, Lfe, RearLeft, RearRight, SideLeft, SideRight],
        };
        let mut positions = ArrayVec::new();
        positions.try_extend_from_slice(base).ok()?;
        let mut aux = 0u8;
        while positions.len() < channels {
            positions.push(Aux(aux));
            aux += 1;
        }
        Some(Self { positions })
    }

    pub fn channels(&self) -> u8 {
        self.positions.len() as u8
    }

    pub fn positions(&self) -> &[ChannelPosition] {
        &self.positions
    }

    pub fn is_valid(&self) -> bool {
        !self.positions.is_empty()
    }

    pub fn is_compatible(&self, spec: &SampleSpec) -> bool {
        self.channels() == spec.channels
    }
}

impl From<ChannelMap> for Vec<ChannelPosition> {
    fn from(map: ChannelMap) -> Self {
        map.positions.to_vec()
    }
}

impl TryFrom<Vec<ChannelPosition>> for ChannelMap {
    type Error = String;

    fn try_from(value: Vec<ChannelPosition>) -> Result<Self, Self::Error> {
        ChannelMap::from_positions(&value)
            .ok_or_else(|| format!("channel map must have 1..={CHANNELS_MAX} positions"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Encoding {
    Pcm,
    Ac3Iec61937,
    Eac3Iec61937,
    MpegIec61937,
    DtsIec61937,
    Mpeg2AacIec61937,
    TruehdIec61937,
    DtshdIec61937,
}

impl Encoding {
    pub fn is_pcm(self) -> bool {
        self == Encoding::Pcm
    }

    fn passthrough_channels(self) -> u8 {
        match self {
            Encoding::TruehdIec61937 | Encoding::DtshdIec61937 => 8,
            _ => 2,
        }
    }
}

/// A format offer or requirement. Unset fields mean "whatever the other side
/// uses"; on a device they mean "accepts anything".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatInfo {
    pub encoding: Encoding,
    #[serde(default)]
    pub sample_format: Option<SampleFormat>,
    #[serde(default)]
    pub rate: Option<u32>,
    #[serde(default)]
    pub channels: Option<u8>,
    #[serde(default)]
    pub channel_map: Option<ChannelMap>,
}

impl FormatInfo {
    pub fn pcm() -> Self {
        Self::encoded(Encoding::Pcm)
    }

    pub fn encoded(encoding: Encoding) -> Self {
        Self {
            encoding,
            sample_format: None,
            rate: None,
            channels: None,
            channel_map: None,
        }
    }

    pub fn with_rate(mut self, rate: u32) -> Self {
        self.rate = Some(rate);
        self
    }

    pub fn with_channels(mut self, channels: u8) -> Self {
        self.channels = Some(channels);
        self
    }

    pub fn with_sample_format(mut self, format: SampleFormat) -> Self {
        self.sample_format = Some(format);
        self
    }

    /// Builds a PCM format from a sample spec. Fields whose `set_*` flag is
    /// false stay open so negotiation fills them from the device.
    pub fn from_sample_spec(
        spec: &SampleSpec,
        map: Option<&ChannelMap>,
        set_format: bool,
        set_rate: bool,
        set_channels: bool,
    ) -> Result<Self, RoutingError> {
        if !spec.is_valid() {
            return Err(RoutingError::Invalid("sample spec"));
        }
        if let Some(map) = map {
            if !map.is_compatible(spec) {
                return Err(RoutingError::Invalid("channel map does not match sample spec"));
            }
        }
        Ok(Self {
            encoding: Encoding::Pcm,
            sample_format: set_format.then_some(spec.format),
            rate: set_rate.then_some(spec.rate),
            channels: set_channels.then_some(spec.channels),
            channel_map: if set_channels { map.cloned() } else { None },
        })
    }

    pub fn is_pcm(&self) -> bool {
        self.encoding.is_pcm()
    }

    pub fn is_passthrough(&self) -> bool {
        !self.is_pcm()
    }

    /// Whether `other` (a requested format) can be carried by `self` (an
    /// offered format).
    pub fn is_compatible(&self, other: &FormatInfo) -> bool {
        if self.encoding != other.encoding {
            return false;
        }
        fn field_ok<T: PartialEq>(offer: &Option<T>, request: &Option<T>) -> bool {
            match (offer, request) {
                (Some(offer), Some(request)) => offer == request,
                _ => true,
            }
        }
        field_ok(&self.sample_format, &other.sample_format)
            && field_ok(&self.rate, &other.rate)
            && field_ok(&self.channels, &other.channels)
            && field_ok(&self.channel_map, &other.channel_map)
    }

    /// Resolves a concrete sample spec and channel map, taking unset fields
    /// from the template (the device).
    pub fn to_sample_spec(
        &self,
        template: &SampleSpec,
        template_map: &ChannelMap,
    ) -> Result<(SampleSpec, ChannelMap), RoutingError> {
        if !self.is_pcm() {
            let rate = self
                .rate
                .ok_or(RoutingError::Invalid("passthrough format without rate"))?;
            let channels = self.encoding.passthrough_channels();
            let spec = SampleSpec::new(SampleFormat::S16Le, rate, channels);
            let map = ChannelMap::default_for(channels)
                .ok_or(RoutingError::Invalid("channel count"))?;
            return Ok((spec, map));
        }

        let spec = SampleSpec {
            format: self.sample_format.unwrap_or(template.format),
            rate: self.rate.unwrap_or(template.rate),
            channels: self.channels.unwrap_or(template.channels),
        };
        if !spec.is_valid() {
            return Err(RoutingError::Invalid("negotiated sample spec"));
        }
        let map = match &self.channel_map {
            Some(map) if map.is_compatible(&spec) => map.clone(),
            _ if spec.channels == template.channels => template_map.clone(),
            _ => ChannelMap::default_for(spec.channels)
                .ok_or(RoutingError::Invalid("channel count"))?,
        };
        Ok((spec, map))
    }
}

/// Intersects device offers with requested formats. The result keeps the
/// request order, so the caller's first compatible choice wins.
pub fn negotiate_formats(offered: &[FormatInfo], requested: &[FormatInfo]) -> Vec<FormatInfo> {
    requested
        .iter()
        .filter(|request| offered.iter().any(|offer| offer.is_compatible(request)))
        .cloned()
        .collect()
}
