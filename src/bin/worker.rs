//! Analysis worker: one process per track.
//!
//! Decodes the track, reports duration, tempo data and a waveform thumbnail
//! on stdout, then serves tempo-adjusted piece requests from stdin until the
//! server closes the pipe. All frames use the length-prefixed wire format
//! shared with the server.

use std::io::{Read, Write};

use tempocast::analysis::{beats, bpm, decode, tempo, thumbnail};
use tempocast::worker::wire::{self, FrameDecoder, KIND_BINARY, KIND_JSON, THUMBNAIL_ID};
use tempocast::worker::{
    encode_samples, DurationReport, PieceRequest, TempoReport, DURATION_ID, TEMPO_ID,
};

struct Args {
    track: String,
    channels: usize,
    rate: u32,
    want_start_bpm: bool,
}

fn parse_args() -> Result<Args, String> {
    let mut track = None;
    let mut channels = 2usize;
    let mut rate = 48_000u32;
    let mut want_start_bpm = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--channels" => {
                channels = args
                    .next()
                    .ok_or("--channels needs a value")?
                    .parse()
                    .map_err(|e| format!("--channels: {e}"))?;
            }
            "--rate" => {
                rate = args
                    .next()
                    .ok_or("--rate needs a value")?
                    .parse()
                    .map_err(|e| format!("--rate: {e}"))?;
            }
            "--start-bpm" => want_start_bpm = true,
            other if !other.starts_with("--") && track.is_none() => {
                track = Some(other.to_string());
            }
            other => return Err(format!("unknown argument '{other}'")),
        }
    }
    Ok(Args {
        track: track.ok_or("missing track path")?,
        channels,
        rate,
        want_start_bpm,
    })
}

fn run() -> Result<(), String> {
    let args = parse_args()?;
    let track = decode::decode_file(std::path::Path::new(&args.track), args.channels, args.rate)?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    let duration = serde_json::to_vec(&DurationReport {
        duration: track.duration_secs(),
    })
    .map_err(|e| e.to_string())?;
    write_frame(&mut out, KIND_JSON, DURATION_ID, &duration)?;

    let beat_times = beats::detect_beats(&track.samples, track.channels, track.sample_rate);
    let report = match bpm::tempo_figures(&beat_times, track.duration_secs(), args.want_start_bpm)
    {
        Some(figures) => TempoReport {
            bpm_start: figures.bpm_start,
            bpm_end: figures.bpm_end,
            beats: beat_times,
            error: None,
        },
        None => TempoReport {
            error: Some(format!(
                "not enough beats detected ({} found)",
                beat_times.len()
            )),
            ..TempoReport::default()
        },
    };
    let payload = serde_json::to_vec(&report).map_err(|e| e.to_string())?;
    write_frame(&mut out, KIND_JSON, TEMPO_ID, &payload)?;

    let (mins, maxs) = thumbnail::waveform_extremes(&track.samples, track.channels);
    write_frame(&mut out, KIND_BINARY, THUMBNAIL_ID, &thumbnail::encode(&mins, &maxs))?;

    serve_pieces(&track, &mut out)
}

/// Blocking request loop: one binary reply per piece request, until stdin
/// closes.
fn serve_pieces(track: &decode::DecodedTrack, out: &mut impl Write) -> Result<(), String> {
    let stdin = std::io::stdin();
    let mut input = stdin.lock();
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let want = decoder.needed().min(buf.len());
        let n = input.read(&mut buf[..want]).map_err(|e| e.to_string())?;
        if n == 0 {
            return Ok(());
        }
        let frame = match decoder.push(&buf[..n]).map_err(|e| e.to_string())? {
            Some(frame) => frame,
            None => continue,
        };
        let request: PieceRequest =
            serde_json::from_slice(&frame.payload).map_err(|e| format!("bad request: {e}"))?;
        let piece = tempo::render_piece(
            &track.samples,
            track.channels,
            request.offset,
            request.length,
            request.tempo_change,
        );
        write_frame(out, KIND_BINARY, request.id, &encode_samples(&piece))?;
    }
}

fn write_frame(out: &mut impl Write, kind: u8, id: u32, payload: &[u8]) -> Result<(), String> {
    out.write_all(&wire::encode_frame(kind, id, payload))
        .map_err(|e| e.to_string())?;
    out.flush().map_err(|e| e.to_string())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("tempocast-worker: {e}");
        std::process::exit(1);
    }
}
