//! Worker-side analysis: decode, beat detection, tempo figures, the block
//! tempo transform, and the waveform thumbnail. The server binary never
//! touches these modules; they run inside `tempocast-worker` and in tests.

pub mod beats;
pub mod bpm;
pub mod decode;
pub mod tempo;
pub mod thumbnail;
