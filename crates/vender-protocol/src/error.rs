use thiserror::Error;

#[derive(Error, Debug)]
pub enum SlimError {
    #[error("Frame is invalid: wrong magic {magic:#06x}")]
    Magic { magic: u16 },

    #[error("Frame is invalid: length={length}")]
    Length { length: usize },

    #[error("Frame length={length} exceeds max={max}")]
    TooLarge { length: usize, max: usize },

    #[error("Unexpected EOF: {context}")]
    UnexpectedEof { context: &'static str },

    // Authentication
    #[error("Secret must be >= 8 bytes")]
    WeakSecret,

    #[error("Signature is invalid")]
    SignatureInvalid,

    #[error("Frame is not signed but a secret is configured")]
    SignatureMissing,

    #[error("Signed frame but no secret source")]
    SecretMissing,

    #[error("Secret lookup failed: {0}")]
    Secret(String),

    // Payload
    #[error("Message encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SlimError {
    pub fn eof(context: &'static str) -> Self {
        Self::UnexpectedEof { context }
    }
}

pub type Result<T> = std::result::Result<T, SlimError>;
