//! Token stream processing: protocol decoding, flush policy and repetition detection.

mod decoder;
mod flush;
mod repetition;

pub use decoder::{decode_line, LineSplitter, StreamDecoder, StreamEvent, DONE_SENTINEL, EVENT_PREFIX};
pub use flush::{should_flush, Durability, SaveMode};
pub use repetition::{similarity_ratio, GuardVerdict, RepetitionConfig, RepetitionGuard};
