pub mod generative;
pub mod http;

pub use generative::OpenAiTransformer;
pub use http::{sign_body, HttpAgentInvoker, SIGNATURE_HEADER};
