//! WebVTT parsing and serialization.
//!
//! Lossless single-pass parse of WebVTT caption files into ordered cue
//! sequences, with two local extensions: a leading NOTE block carrying
//! episode metadata, and `<v Speaker>` voice spans.

pub mod parser;
pub mod serializer;

pub use parser::{parse_file, parse_reader, parse_str, peek_metadata, ParseOutcome, VttError, Warning};
pub use serializer::serialize;
