//! # Encoding Module
//!
//! Text-safe binary encodings embedded inside the JSON files. The index file
//! stores every integer and double of an entry payload as Z85 so that
//! payloads stay printable and fixed-width fields can be rewritten in place.

pub mod z85;
