use std::{
    fs::File,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use symphonia::core::{
    audio::SampleBuffer,
    codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::{FormatOptions, FormatReader},
    io::{MediaSourceStream, MediaSourceStreamOptions},
    meta::MetadataOptions,
    probe::Hint,
};

use url::Url;

use crate::{Result, SoundError};

/// Maps a source URI onto a local path.
///
/// Accepts plain paths and `file://` URIs; every other scheme is a load error.
pub fn resolve(source_uri: &str) -> Result<PathBuf> {
    if source_uri.trim().is_empty() {
        return Err(SoundError::load(source_uri, "empty source"));
    }

    // Single-letter schemes are drive prefixes, not URIs.
    let url = match Url::parse(source_uri) {
        Ok(url) if url.scheme().len() > 1 => url,
        _ => return Ok(PathBuf::from(source_uri)),
    };

    if url.scheme() != "file" {
        return Err(SoundError::load(
            source_uri,
            format!("unsupported scheme \"{}\"", url.scheme()),
        ));
    }

    let path = url
        .to_file_path()
        .map_err(|()| SoundError::load(source_uri, "file URI does not name a local path"))?;
    if path.file_name().is_none() {
        return Err(SoundError::load(source_uri, "file URI without a file name"));
    }
    Ok(path)
}

/// Incremental decoder over one source, yielding mono blocks.
///
/// Multichannel sources are downmixed to the mono `f32` layout the analysers
/// measure.
pub struct SourceStream {
    source_uri: String,
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    sample_buf: Option<SampleBuffer<f32>>,
}

impl SourceStream {
    /// Resolves, opens and probes `source_uri`.
    pub fn open(source_uri: &str) -> Result<Self> {
        let path = resolve(source_uri)?;
        let file = File::open(&path).map_err(|e| SoundError::load(source_uri, e))?;
        let mss = MediaSourceStream::new(Box::new(file), MediaSourceStreamOptions::default());

        let mut hint = Hint::new();
        if let Some(ext) = extension(&path) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| SoundError::load(source_uri, e))?;

        let format = probed.format;
        let track = format
            .tracks()
            .iter()
            .find(|track| track.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| SoundError::load(source_uri, "no decodable audio track"))?;
        let track_id = track.id;
        let params = track.codec_params.clone();
        let sample_rate = params
            .sample_rate
            .ok_or_else(|| SoundError::load(source_uri, "missing sample rate"))?;

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| SoundError::load(source_uri, e))?;

        tracing::debug!(source = source_uri, sample_rate, "source opened");

        Ok(Self {
            source_uri: source_uri.to_string(),
            format,
            decoder,
            track_id,
            sample_rate,
            sample_buf: None,
        })
    }

    pub fn source_uri(&self) -> &str {
        &self.source_uri
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Decodes the next non-empty block. `None` marks the end of the stream.
    pub fn next_chunk(&mut self) -> Result<Option<Vec<f32>>> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                    return Ok(None)
                }
                Err(SymphoniaError::ResetRequired) => return Ok(None),
                Err(e) => return Err(SoundError::load(&self.source_uri, e)),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    if decoded.frames() == 0 {
                        continue;
                    }
                    let spec = *decoded.spec();
                    let channels = spec.channels.count().max(1);
                    let needs_realloc = self
                        .sample_buf
                        .as_ref()
                        .map(|buf| buf.capacity() < decoded.capacity())
                        .unwrap_or(true);
                    if needs_realloc {
                        self.sample_buf = Some(SampleBuffer::new(decoded.capacity() as u64, spec));
                    }
                    let Some(buf) = self.sample_buf.as_mut() else {
                        continue;
                    };
                    buf.copy_interleaved_ref(decoded);
                    return Ok(Some(downmix(buf.samples(), channels)));
                }
                Err(SymphoniaError::DecodeError(reason)) => {
                    tracing::debug!(source = %self.source_uri, reason, "skipping corrupt packet");
                    continue;
                }
                Err(e) => return Err(SoundError::load(&self.source_uri, e)),
            }
        }
    }
}

impl std::fmt::Debug for SourceStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceStream")
            .field("source_uri", &self.source_uri)
            .field("track_id", &self.track_id)
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}

/// A clip decoded completely into memory.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate.max(1) as f64)
    }
}

/// Decodes a whole source into memory.
pub fn decode_all(source_uri: &str) -> Result<DecodedAudio> {
    decode_while(source_uri, || true)?
        .ok_or_else(|| SoundError::load(source_uri, "decoding stopped early"))
}

/// Decodes chunk by chunk while `keep_going` holds. `Ok(None)` means the
/// caller stopped the decode.
pub(crate) fn decode_while(
    source_uri: &str,
    keep_going: impl Fn() -> bool,
) -> Result<Option<DecodedAudio>> {
    let mut stream = SourceStream::open(source_uri)?;
    let mut samples = Vec::new();
    while let Some(chunk) = stream.next_chunk()? {
        if !keep_going() {
            return Ok(None);
        }
        samples.extend_from_slice(&chunk);
    }

    Ok(Some(DecodedAudio {
        samples: samples.into(),
        sample_rate: stream.sample_rate(),
    }))
}

fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|ext| ext.to_str())
}

fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }

    let scale = 1.0 / channels as f32;
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() * scale)
        .collect()
}
