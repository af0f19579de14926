pub mod config;
pub mod encode;
pub mod error;
pub mod ffprobe;
pub mod filter_graph;
pub mod job;
pub mod pipeline;
pub mod plan;
pub mod policy;
pub mod postprocess;
pub mod queue;
pub mod source;
pub mod temp;
pub mod worker;

pub use config::ConverterConfig;
pub use error::{ConvertError, ConvertResult};
pub use ffprobe::{FFProbeData, FFProbeFormat, FFProbeStream, ProbedMedia};
pub use job::{FrameShape, Job, JobInput};
pub use pipeline::{Converter, JobFailure, JobOutput};
pub use queue::{JobRecord, JobStatus, JobStore};
