use async_trait::async_trait;
use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, Packet};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::{Time, TimeBase};
use tracing::debug;

use crate::error::ProbeError;

#[async_trait]
pub trait DurationProbe: Send + Sync {
    /// Playable length of the media at `path`, in seconds.
    async fn duration(&self, path: &Path) -> Result<f64, ProbeError>;
}

/// Reads container metadata with symphonia, decoding packet headers only
/// when the container does not declare its length.
#[derive(Debug, Default, Clone, Copy)]
pub struct SymphoniaProbe;

#[async_trait]
impl DurationProbe for SymphoniaProbe {
    async fn duration(&self, path: &Path) -> Result<f64, ProbeError> {
        let path: PathBuf = path.to_path_buf();
        let seconds = tokio::task::spawn_blocking(move || probe_duration(&path)).await??;
        debug!(seconds, "Probed media duration");
        Ok(seconds)
    }
}

fn probe_duration(path: &Path) -> Result<f64, ProbeError> {
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(extension) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(extension);
    }

    let probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let mut format = probed.format;

    let track = format.default_track().ok_or(ProbeError::NoAudioTrack)?;
    let track_id = track.id;
    let params = &track.codec_params;
    let time_base = params
        .time_base
        .or_else(|| params.sample_rate.map(|rate| TimeBase::new(1, rate)))
        .ok_or(ProbeError::UnknownTimeBase)?;

    if let Some(frames) = params.n_frames {
        return Ok(seconds(time_base.calc_time(frames)));
    }

    let end = last_packet_end(std::iter::from_fn(|| Some(format.next_packet())), track_id)?;
    Ok(seconds(time_base.calc_time(end)))
}

/// Walk packets for containers that do not declare their length. Stops at
/// end of stream; timestamps past `u64::MAX` are clamped.
fn last_packet_end<I>(packets: I, track_id: u32) -> Result<u64, ProbeError>
where
    I: IntoIterator<Item = symphonia::core::errors::Result<Packet>>,
{
    let mut end: u64 = 0;
    for packet in packets {
        match packet {
            Ok(packet) if packet.track_id() == track_id => {
                end = end.max(packet.ts().saturating_add(packet.dur()));
            }
            Ok(_) => {}
            Err(SymphoniaError::IoError(ref e)) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(end)
}

fn seconds(time: Time) -> f64 {
    time.seconds as f64 + time.frac
}
