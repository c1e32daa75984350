use std::fs::File;
use std::path::Path;

use anyhow::Context;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

const RESAMPLE_CHUNK: usize = 1024;

/// Mono audio at a known sample rate.
#[derive(Clone, Debug)]
pub struct AudioClip {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioClip {
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }
}

/// Decodes any format symphonia knows about and averages all channels to mono.
pub fn decode_mono(path: &Path) -> anyhow::Result<AudioClip> {
    let src =
        File::open(path).with_context(|| format!("Failed to open audio: {}", path.display()))?;
    let mss = MediaSourceStream::new(Box::new(src), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|ext| ext.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .with_context(|| format!("Unsupported audio format: {}", path.display()))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .with_context(|| format!("No supported audio tracks in {}", path.display()))?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .with_context(|| format!("Unsupported codec in {}", path.display()))?;

    let mut samples = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(err))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(err) => {
                return Err(err).with_context(|| format!("Failed reading {}", path.display()))
            }
        };

        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                if sample_rate.is_none() {
                    sample_rate = Some(spec.rate);
                }
                let channels = spec.channels.count().max(1);
                let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                buf.copy_interleaved_ref(decoded);
                samples.extend(downmix(buf.samples(), channels));
            }
            Err(SymphoniaError::DecodeError(msg)) => {
                tracing::warn!(
                    path = %path.display(),
                    timestamp = packet.ts,
                    "skipping undecodable packet: {msg}"
                );
            }
            Err(err) => {
                return Err(err).with_context(|| format!("Failed decoding {}", path.display()))
            }
        }
    }

    let sample_rate =
        sample_rate.with_context(|| format!("Unknown sample rate for {}", path.display()))?;
    tracing::debug!(
        path = %path.display(),
        sample_rate,
        samples = samples.len(),
        "decoded audio"
    );
    Ok(AudioClip {
        samples,
        sample_rate,
    })
}

/// Averages interleaved frames down to a single channel.
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Converts `clip` to `target_rate` with band-limited sinc interpolation.
pub fn resample(clip: &AudioClip, target_rate: u32) -> anyhow::Result<AudioClip> {
    if clip.sample_rate == target_rate || clip.samples.is_empty() {
        return Ok(AudioClip {
            samples: clip.samples.clone(),
            sample_rate: target_rate,
        });
    }

    let ratio = f64::from(target_rate) / f64::from(clip.sample_rate);
    let params = SincInterpolationParameters {
        sinc_len: 128,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 128,
        window: WindowFunction::BlackmanHarris2,
    };
    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, RESAMPLE_CHUNK, 1)
        .context("Failed to construct resampler")?;

    let expected_len = (clip.samples.len() as f64 * ratio).ceil() as usize;
    let delay = resampler.output_delay();
    let mut out = Vec::with_capacity(expected_len + delay);

    let input = clip.samples.as_slice();
    let mut pos = 0usize;
    while input.len() - pos >= resampler.input_frames_next() {
        let next = resampler.input_frames_next();
        let frame: [&[f32]; 1] = [&input[pos..pos + next]];
        let chunk = resampler
            .process(&frame[..], None)
            .context("Resampling failed")?;
        out.extend_from_slice(&chunk[0]);
        pos += next;
    }
    if pos < input.len() {
        let tail: [&[f32]; 1] = [&input[pos..]];
        let chunk = resampler
            .process_partial(Some(&tail[..]), None)
            .context("Resampling failed")?;
        out.extend_from_slice(&chunk[0]);
    }
    while out.len() < expected_len + delay {
        let chunk = resampler
            .process_partial::<&[f32]>(None, None)
            .context("Resampling flush failed")?;
        if chunk[0].is_empty() {
            break;
        }
        out.extend_from_slice(&chunk[0]);
    }

    let end = (delay + expected_len).min(out.len());
    let samples = out.get(delay..end).map(<[f32]>::to_vec).unwrap_or_default();
    Ok(AudioClip {
        samples,
        sample_rate: target_rate,
    })
}

/// Decodes `path` and brings it to mono at `target_rate`.
pub fn load_for_model(path: &Path, target_rate: u32) -> anyhow::Result<AudioClip> {
    let clip = decode_mono(path)?;
    resample(&clip, target_rate)
        .with_context(|| format!("Failed resampling {}", path.display()))
}
