//! Decoding encoded audio files into PCM with symphonia.

use std::io::{Cursor, ErrorKind};
use std::sync::OnceLock;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecRegistry, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};

/// An encoded audio file as supplied by the UI layer.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioFile {
    pub name: String,
    /// MIME type reported by the picker, if any.
    pub mime: Option<String>,
    pub bytes: Vec<u8>,
}

impl AudioFile {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime: None,
            bytes,
        }
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    /// Lowercase file extension, if the name has one.
    pub fn extension(&self) -> Option<String> {
        let (stem, ext) = self.name.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }
}

/// Interleaved PCM decoded from one file.
#[derive(Clone, Debug)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub channels: usize,
    pub sample_rate: u32,
}

impl DecodedAudio {
    #[inline]
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1)
    }
}

/// Recognize a container by its leading bytes.
fn has_audio_signature(bytes: &[u8]) -> bool {
    match bytes {
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'A', b'V', b'E', ..] => true,
        [b'O', b'g', b'g', b'S', ..] => true,
        [b'f', b'L', b'a', b'C', ..] => true,
        [b'I', b'D', b'3', ..] => true,
        // MPEG audio frame sync
        [0xFF, second, ..] => second & 0xE0 == 0xE0,
        _ => false,
    }
}

/// Reject anything that is obviously not audio, before decoding is attempted.
pub fn check_audio(file: &AudioFile) -> EngineResult<()> {
    if file.bytes.is_empty() {
        return Err(EngineError::InvalidInput(format!("{} is empty", file.name)));
    }

    if let Some(mime) = &file.mime {
        if !mime.starts_with("audio/") && mime != "application/ogg" {
            return Err(EngineError::InvalidInput(format!(
                "{} is not an audio file ({})",
                file.name, mime
            )));
        }
    }

    if !has_audio_signature(&file.bytes) {
        return Err(EngineError::InvalidInput(format!(
            "{} does not look like a supported audio container",
            file.name
        )));
    }

    Ok(())
}

/// Symphonia's built-in codecs, plus Opus when the `opus` feature is on.
fn codecs() -> &'static CodecRegistry {
    static CODECS: OnceLock<CodecRegistry> = OnceLock::new();
    CODECS.get_or_init(|| {
        let mut registry = CodecRegistry::new();
        symphonia::default::register_enabled_codecs(&mut registry);
        #[cfg(feature = "opus")]
        registry.register_all::<super::opus::OpusPacketDecoder>();
        registry
    })
}

/// Decode a whole file into interleaved `f32` PCM.
///
/// Corrupt packets are skipped; a file that yields no audio at all is a
/// [`EngineError::DecodeFailure`].
pub fn decode(file: AudioFile) -> EngineResult<DecodedAudio> {
    check_audio(&file)?;

    let mut hint = Hint::new();
    if let Some(ext) = file.extension() {
        hint.with_extension(&ext);
    }

    let AudioFile { name, bytes, .. } = file;
    let fail = |reason: String| EngineError::DecodeFailure {
        file: name.clone(),
        reason,
    };

    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());
    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| fail(e.to_string()))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| fail("no decodable audio track".into()))?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);
    let mut channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(0);

    let mut decoder = codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| fail(e.to_string()))?;

    let mut samples = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;
    let mut buf_frames = 0u64;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(fail(e.to_string())),
        };

        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                channels = spec.channels.count();
                sample_rate = spec.rate;

                let needed = decoded.capacity() as u64;
                if sample_buf.is_none() || needed > buf_frames {
                    sample_buf = Some(SampleBuffer::new(needed, spec));
                    buf_frames = needed;
                }
                if let Some(buf) = sample_buf.as_mut() {
                    buf.copy_interleaved_ref(decoded);
                    samples.extend_from_slice(buf.samples());
                }
            }
            Err(SymphoniaError::DecodeError(e)) => {
                warn!(file = %name, "skipping corrupt packet: {}", e);
            }
            Err(e) => return Err(fail(e.to_string())),
        }
    }

    if channels == 0 || samples.is_empty() {
        return Err(fail("file contains no audio".into()));
    }

    debug!(
        file = %name,
        channels,
        sample_rate,
        frames = samples.len() / channels,
        "decoded audio file"
    );

    Ok(DecodedAudio {
        samples,
        channels,
        sample_rate,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// 16-bit PCM WAV holding interleaved `samples`.
    pub(crate) fn wav_bytes(samples: &[i16], channels: u16, sample_rate: u32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for s in samples {
                writer.write_sample(*s).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    /// Ogg/Opus stream of `packets` 20 ms frames of a 440 Hz tone at half scale.
    #[cfg(feature = "opus")]
    pub(crate) fn ogg_opus_bytes(channels: u8, packets: usize) -> Vec<u8> {
        use std::f32::consts::TAU;

        use audiopus::coder::Encoder;
        use audiopus::{Application, Channels, SampleRate};
        use ogg::writing::{PacketWriteEndInfo, PacketWriter};

        const FRAME: usize = 960;
        const SERIAL: u32 = 0x7374_726d;

        let layout = if channels == 1 { Channels::Mono } else { Channels::Stereo };
        let encoder = Encoder::new(SampleRate::Hz48000, layout, Application::Audio).unwrap();

        let mut head = b"OpusHead".to_vec();
        head.extend_from_slice(&[1, channels]);
        head.extend_from_slice(&0u16.to_le_bytes()); // pre-skip
        head.extend_from_slice(&48_000u32.to_le_bytes());
        head.extend_from_slice(&0i16.to_le_bytes()); // gain
        head.push(0); // mapping family

        let vendor = b"strom tests";
        let mut tags = b"OpusTags".to_vec();
        tags.extend_from_slice(&(vendor.len() as u32).to_le_bytes());
        tags.extend_from_slice(vendor);
        tags.extend_from_slice(&0u32.to_le_bytes());

        let mut bytes = Vec::new();
        {
            let mut writer = PacketWriter::new(&mut bytes);
            writer
                .write_packet(head, SERIAL, PacketWriteEndInfo::EndPage, 0)
                .unwrap();
            writer
                .write_packet(tags, SERIAL, PacketWriteEndInfo::EndPage, 0)
                .unwrap();

            let mut encoded = vec![0u8; 4000];
            for p in 0..packets {
                let pcm: Vec<i16> = (0..FRAME)
                    .flat_map(|n| {
                        let t = (p * FRAME + n) as f32 / 48_000.0;
                        let s = ((TAU * 440.0 * t).sin() * 16384.0) as i16;
                        std::iter::repeat(s).take(channels as usize)
                    })
                    .collect();
                let len = encoder.encode(&pcm, &mut encoded).unwrap();
                let end = if p + 1 == packets {
                    PacketWriteEndInfo::EndStream
                } else {
                    PacketWriteEndInfo::NormalPacket
                };
                writer
                    .write_packet(encoded[..len].to_vec(), SERIAL, end, ((p + 1) * FRAME) as u64)
                    .unwrap();
            }
        }
        bytes
    }

    #[test]
    #[cfg(feature = "opus")]
    fn decodes_ogg_opus() {
        let file = AudioFile::new("tone.opus", ogg_opus_bytes(1, 10)).with_mime("audio/ogg");
        let decoded = decode(file).unwrap();
        assert_eq!(decoded.channels, 1);
        assert_eq!(decoded.sample_rate, 48_000);
        assert!(
            (9 * 960..=10 * 960).contains(&decoded.frames()),
            "{} frames",
            decoded.frames()
        );

        // lossy, but clearly the half-scale tone once the codec delay has passed
        let tail = &decoded.samples[decoded.samples.len() / 2..];
        let rms = (tail.iter().map(|s| s * s).sum::<f32>() / tail.len() as f32).sqrt();
        assert!(rms > 0.2 && rms < 0.5, "rms {}", rms);
    }

    #[test]
    #[cfg(feature = "opus")]
    fn decodes_stereo_ogg_opus_interleaved() {
        let decoded = decode(AudioFile::new("st.opus", ogg_opus_bytes(2, 5))).unwrap();
        assert_eq!(decoded.channels, 2);
        assert_eq!(decoded.samples.len(), decoded.frames() * 2);
        assert!(decoded.samples.iter().any(|s| s.abs() > 0.1));
    }

    #[test]
    fn decodes_wav() {
        let file = AudioFile::new("tone.wav", wav_bytes(&[0, 16384, -16384, 8192], 1, 8000));
        let decoded = decode(file).unwrap();
        assert_eq!(decoded.channels, 1);
        assert_eq!(decoded.sample_rate, 8000);
        assert_eq!(decoded.samples, vec![0.0, 0.5, -0.5, 0.25]);
    }

    #[test]
    fn decodes_stereo_wav_interleaved() {
        let file = AudioFile::new("st.wav", wav_bytes(&[16384, -16384, 8192, -8192], 2, 44_100));
        let decoded = decode(file).unwrap();
        assert_eq!(decoded.channels, 2);
        assert_eq!(decoded.frames(), 2);
        assert_eq!(decoded.samples, vec![0.5, -0.5, 0.25, -0.25]);
    }

    #[test]
    fn rejects_non_audio_before_decoding() {
        let text = AudioFile::new("notes.txt", b"hello there".to_vec());
        assert!(matches!(decode(text), Err(EngineError::InvalidInput(_))));

        let empty = AudioFile::new("empty.wav", Vec::new());
        assert!(matches!(decode(empty), Err(EngineError::InvalidInput(_))));

        let wrong_mime =
            AudioFile::new("image.wav", wav_bytes(&[0, 1], 1, 8000)).with_mime("image/png");
        assert!(matches!(decode(wrong_mime), Err(EngineError::InvalidInput(_))));
    }

    #[test]
    fn truncated_container_is_a_decode_failure() {
        let mut bytes = wav_bytes(&[0; 64], 1, 8000);
        bytes.truncate(14);
        let file = AudioFile::new("broken.wav", bytes).with_mime("audio/wav");
        match decode(file) {
            Err(EngineError::DecodeFailure { file, .. }) => assert_eq!(file, "broken.wav"),
            other => panic!("expected decode failure, got {:?}", other),
        }
    }

    #[test]
    fn extension_is_lowercased() {
        assert_eq!(AudioFile::new("Song.FLAC", vec![]).extension().as_deref(), Some("flac"));
        assert_eq!(AudioFile::new("noext", vec![]).extension(), None);
        assert_eq!(AudioFile::new(".hidden", vec![]).extension(), None);
    }
}
