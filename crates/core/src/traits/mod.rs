//! Capability traits for the external engines
//!
//! Every engine sits behind one of these traits so backends can be swapped by
//! configuration and replaced by mocks in tests.
//!
//! ```text
//!   - SpeechToText: audio -> Transcript
//!   - LanguageModel: prompt -> text (buffered or token stream)
//!   - TextToSpeech: text -> audio (buffered or ordered chunks)
//! ```

mod llm;
mod speech;

pub use llm::{LanguageModel, TokenStream};
pub use speech::{
    AudioStream, SpeechToText, SynthesisStream, TextToSpeech, TranscriptionRequest,
};
