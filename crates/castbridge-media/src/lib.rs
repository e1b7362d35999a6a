//! Media-format helpers for the castbridge streaming pipeline.
//!
//! Everything in this crate is pure byte-level logic with no I/O:
//! MPEG-TS packet scanning and PAT/PMT handling, H.264 Annex-B NAL
//! inspection, AAC AudioSpecificConfig synthesis, and HLS media playlist
//! rendering. The transcoder uses it to patch segments into shape for
//! strict receivers; the test suite uses the same routines to validate
//! emitted segments.

pub mod aac;
pub mod annexb;
pub mod error;
pub mod playlist;
pub mod ts;

pub use aac::{sample_rate_index, synthesize_asc};
pub use annexb::{AnnexBScan, NalUnitIterator, ParameterSets};
pub use error::{Error, Result};
pub use playlist::{LivePlaylist, PlaylistSegment};
pub use ts::{PsiPair, TsPacketIterator, PID_PAT, TS_PACKET_LEN};
