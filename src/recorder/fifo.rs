use ffmpeg_next::format::Sample;
use ffmpeg_next::{ChannelLayout, frame};

/// Buffers resampled audio so the encoder always receives frames of its own size.
pub(crate) struct SampleFifo {
    format: Sample,
    layout: ChannelLayout,
    rate: u32,
    // Bytes per sample in one plane.
    stride: usize,
    planes: Vec<Vec<u8>>,
}

impl SampleFifo {
    pub(crate) fn new(format: Sample, layout: ChannelLayout, rate: u32) -> Self {
        let channels = layout.channels().max(1) as usize;
        let (plane_count, stride) = if format.is_planar() {
            (channels, format.bytes())
        } else {
            (1, format.bytes() * channels)
        };
        Self {
            format,
            layout,
            rate,
            stride,
            planes: vec![Vec::new(); plane_count],
        }
    }

    /// Samples per channel currently buffered.
    pub(crate) fn len(&self) -> usize {
        self.planes[0].len() / self.stride
    }

    pub(crate) fn push(&mut self, frame: &frame::Audio) {
        let bytes = frame.samples() * self.stride;
        for (index, plane) in self.planes.iter_mut().enumerate() {
            plane.extend_from_slice(&frame.data(index)[..bytes]);
        }
    }

    /// Takes exactly `samples` samples, or nothing if fewer are buffered.
    pub(crate) fn pop(&mut self, samples: usize) -> Option<frame::Audio> {
        if samples == 0 || self.len() < samples {
            return None;
        }

        let bytes = samples * self.stride;
        let mut frame = frame::Audio::new(self.format, samples, self.layout);
        frame.set_rate(self.rate);
        for (index, plane) in self.planes.iter_mut().enumerate() {
            frame.data_mut(index)[..bytes].copy_from_slice(&plane[..bytes]);
            plane.drain(..bytes);
        }
        Some(frame)
    }

    pub(crate) fn pop_remaining(&mut self) -> Option<frame::Audio> {
        self.pop(self.len())
    }
}
