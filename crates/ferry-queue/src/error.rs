use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("The specified queue {0} does not exist")]
    NonExistentQueue(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Receipt handle is invalid: {0}")]
    InvalidReceiptHandle(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("AWS SQS error: {0}")]
    Sqs(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl QueueError {
    /// Errors worth retrying on the next natural cycle
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Sqs(_))
    }
}
