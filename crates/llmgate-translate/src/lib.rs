pub mod claude;
pub mod envelope;
pub mod gemini;
pub mod openai;
pub mod stream;
pub mod translator;

pub use envelope::{CanonicalRequest, CanonicalResponse, ContentBlock, Message, Role, ThinkingMode};
pub use stream::{CanonicalStreamEvent, StreamIngester};
pub use translator::{map_error, translate_request, translate_response};
