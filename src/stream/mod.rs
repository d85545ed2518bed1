//! PCM mixing and encoded-stream production.

pub mod encoder;
pub mod mixer;

pub use mixer::spawn_mix_loop;
