pub mod account;
pub mod admission;
pub mod config;
pub mod converter;
pub mod engine;
pub mod job;
pub mod queue;
pub mod scheduler;
pub mod storage;
pub mod sweeper;
pub mod testing;

pub use admission::{Admission, AdmissionError, SubmitRequest, Submission};
pub use config::{load_config, load_config_from_str, validate_config, Config, ConfigError};
pub use converter::{AdapterFamily, ConverterError, ConverterRegistry};
pub use engine::{Engine, EngineError, Requester};
pub use job::{Job, JobFilter, JobStatus};
