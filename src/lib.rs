//! TFMX-file parser and player.
//!
//! [TFMX] is a tracker format built for the custom sound hardware of the
//! Amiga home computers. A song ships as two files: the music data
//! (`mdat.*`) with its trackstep table, patterns and voice macros, and the
//! raw 8-bit signed PCM sample bank (`smpl.*`).
//!
//! This library parses the pair into a [TfmxModule] and plays it back with
//! [TfmxPlayer]: a tick-driven interpreter pushes eight voices through the
//! trackstep, pattern and macro state machines, and a fixed-point mixer
//! resamples them into stereo float frames at any host rate. Hand the
//! frames to whatever audio backend the host prefers.
//!
//! ```no_run
//! use tfmx_file_parser::TfmxPlayer;
//!
//! let module = tfmx_file_parser::parse_files("mdat.intro", "smpl.intro")?;
//! let mut player = TfmxPlayer::new(44100);
//! player.load(module);
//! player.start_song(0, false);
//!
//! let mut left = [0.0f32; 1024];
//! let mut right = [0.0f32; 1024];
//! player.render(&mut left, &mut right);
//! # Ok::<(), std::io::Error>(())
//! ```
//!
//! [TFMX]: https://en.wikipedia.org/wiki/TFMX
use std::{fs, io, path::Path};

mod tfmx;

pub use tfmx::*;

/// Attempts to parse a TFMX music-data file together with its sample bank,
/// from the given file `paths`.
///
/// Returns an instance of `TfmxModule` on success.
pub fn parse_files<P: AsRef<Path>, Q: AsRef<Path>>(mdat: P, smpl: Q) -> io::Result<TfmxModule> {
    let music = fs::read(mdat.as_ref())?;
    let samples = fs::read(smpl.as_ref())?;
    TfmxModule::parse(&music, samples)
}
