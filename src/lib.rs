pub mod artifact;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod crawler;
pub mod frontier;
pub mod logging;
pub mod output_pipeline;
pub mod page;
pub mod redis_frontier;
pub mod robots;
pub mod runtime;
pub mod sanitized_url;
pub mod seeder;
pub mod tracer;
pub mod worker;

// Re-export the component contracts and their main types for library usage
pub use artifact::{Artifact, ArtifactGatherer, BlobStorage};
pub use config::Config;
pub use coordinator::Coordinator;
pub use redis_frontier::RedisStreamUrlFrontier;
pub use crawler::Crawler;
pub use frontier::{SpawnedUrl, UrlFrontier};
pub use output_pipeline::OutputPipeline;
pub use page::Page;
pub use robots::RobotsTxt;
pub use sanitized_url::SanitizedUrl;
pub use tracer::{MetricsSink, Tracer};
pub use worker::{ComponentProvider, Worker};
