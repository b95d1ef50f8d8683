//! Wire protocol for streamed plan co-authoring.
//!
//! A generation stream is a sequence of small JSON documents ("records")
//! delimited by the symbol-for-record-separator character (U+241E). This
//! crate provides the record grammar, a chunk-boundary-safe tokenizer, the
//! patch operations that mutate a plan document, and the closed set of
//! plan sections with their shape validators.

pub mod error;
pub mod patch;
pub mod record;
pub mod sections;
pub mod tokenizer;

pub use error::{ParseFailure, PatchError};
pub use patch::PatchOp;
pub use record::{markers, parse_record, LockoutAction, Record};
pub use sections::{SectionKey, SectionKind};
pub use tokenizer::{RecordTokenizer, RECORD_SEPARATOR};
