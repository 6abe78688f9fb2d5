use ferry_queue::QueueError;
use thiserror::Error;

/// Failures of the consumer itself: registration and startup
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Concurrency value {0} is invalid, it needs to be a positive number")]
    InvalidConcurrency(usize),

    #[error("Could not register {worker} for {queue}, because {existing} is already registered for this queue")]
    DuplicateWorker {
        queue: String,
        worker: String,
        existing: String,
    },

    #[error("The specified queue(s) {0} do not exist")]
    NonExistentQueues(String),

    #[error("Consumer already started")]
    AlreadyStarted,
}

/// Failures while processing one unit of work
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Error parsing the message body: {0}")]
    Parse(String),

    #[error("No worker registered for queue {0}")]
    NoWorker(String),

    #[error("Unknown worker {0}")]
    UnknownWorker(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Processor panicked: {0}")]
    Panicked(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WorkerError {
    pub fn handler(message: impl std::fmt::Display) -> Self {
        WorkerError::Handler(message.to_string())
    }
}
