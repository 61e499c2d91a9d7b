//! Opus support for the symphonia decode path, backed by libopus through `audiopus`.

use audiopus::coder::Decoder as OpusDecoder;
use audiopus::{Channels, SampleRate};
use symphonia::core::audio::{AsAudioBufferRef, AudioBuffer, AudioBufferRef, Layout, Signal, SignalSpec};
use symphonia::core::codecs::{
    CodecDescriptor, CodecParameters, Decoder, DecoderOptions, FinalizeResult, CODEC_TYPE_OPUS,
};
use symphonia::core::errors::{Error, Result};
use symphonia::core::formats::Packet;
use symphonia::core::units::Duration;
use tracing::debug;

/// Largest Opus frame: 120 ms at 48 kHz, per channel.
const MAX_FRAME_SAMPLES: usize = 5760;

fn opus_rate(rate: u32) -> SampleRate {
    match rate {
        8000 => SampleRate::Hz8000,
        12000 => SampleRate::Hz12000,
        16000 => SampleRate::Hz16000,
        24000 => SampleRate::Hz24000,
        _ => SampleRate::Hz48000,
    }
}

fn opus_channels(channels: usize) -> Channels {
    if channels == 1 {
        Channels::Mono
    } else {
        Channels::Stereo
    }
}

/// Decodes Opus packets, mono or stereo, into planar `f32`.
pub struct OpusPacketDecoder {
    params: CodecParameters,
    sample_rate: u32,
    channels: usize,
    decoder: OpusDecoder,
    buf: AudioBuffer<f32>,
    /// Interleaved output of the last packet.
    pcm: Vec<f32>,
}

// SAFETY: the libopus state is only ever touched through `&mut self`.
unsafe impl Sync for OpusPacketDecoder {}

impl OpusPacketDecoder {
    fn open(sample_rate: u32, channels: usize) -> Result<OpusDecoder> {
        OpusDecoder::new(opus_rate(sample_rate), opus_channels(channels)).map_err(|e| {
            debug!("cannot create opus decoder: {}", e);
            Error::Unsupported("opus: decoder setup failed")
        })
    }
}

impl Decoder for OpusPacketDecoder {
    fn try_new(params: &CodecParameters, _options: &DecoderOptions) -> Result<Self> {
        if params.codec != CODEC_TYPE_OPUS {
            return Err(Error::Unsupported("opus: not an opus stream"));
        }

        // multi-stream layouts are beyond a single libopus decoder
        let channels = params.channels.map(|c| c.count()).unwrap_or(2);
        if !(1..=2).contains(&channels) {
            return Err(Error::Unsupported("opus: only mono and stereo streams are supported"));
        }
        let sample_rate = params.sample_rate.unwrap_or(48_000);

        let layout = if channels == 1 { Layout::Mono } else { Layout::Stereo };
        let spec = SignalSpec::new_with_layout(sample_rate, layout);

        Ok(Self {
            params: params.clone(),
            sample_rate,
            channels,
            decoder: Self::open(sample_rate, channels)?,
            buf: AudioBuffer::new(MAX_FRAME_SAMPLES as Duration, spec),
            pcm: vec![0.0; MAX_FRAME_SAMPLES * channels],
        })
    }

    fn supported_codecs() -> &'static [CodecDescriptor] {
        &[CodecDescriptor {
            codec: CODEC_TYPE_OPUS,
            short_name: "opus",
            long_name: "Opus (libopus)",
            inst_func: |params, opts| Ok(Box::new(OpusPacketDecoder::try_new(params, opts)?)),
        }]
    }

    fn reset(&mut self) {
        match Self::open(self.sample_rate, self.channels) {
            Ok(decoder) => self.decoder = decoder,
            Err(e) => debug!("keeping opus decoder state: {}", e),
        }
    }

    fn codec_params(&self) -> &CodecParameters {
        &self.params
    }

    fn decode(&mut self, packet: &Packet) -> Result<AudioBufferRef<'_>> {
        let frames = self
            .decoder
            .decode_float(Some(&packet.data[..]), &mut self.pcm[..], false)
            .map_err(|e| {
                debug!(ts = packet.ts, "opus packet rejected: {}", e);
                Error::DecodeError("opus: invalid packet")
            })?;

        self.buf.clear();
        self.buf.render_reserved(Some(frames));
        let channels = self.channels;
        for ch in 0..channels {
            for (i, sample) in self.buf.chan_mut(ch).iter_mut().enumerate() {
                *sample = self.pcm[i * channels + ch];
            }
        }

        Ok(self.buf.as_audio_buffer_ref())
    }

    fn finalize(&mut self) -> FinalizeResult {
        FinalizeResult::default()
    }

    fn last_decoded(&self) -> AudioBufferRef<'_> {
        self.buf.as_audio_buffer_ref()
    }
}
